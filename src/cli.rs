use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands;

#[derive(Debug, Parser)]
#[command(name = "ctx-budget")]
#[command(
    about = "Token budget accounting and background context compaction for Claude Code hooks"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// PostToolUse hook: record token usage and check thresholds
    Extract,
    /// PreToolUse hook: block work while over the critical threshold
    Guard,
    /// PostToolUse hook: report background compaction progress
    Progress,
    /// SessionStart hook: restore context for a new session
    SessionStart,
    /// PreCompact hook: start a background compaction
    Compact,
    #[command(hide = true)]
    CompactWorker,
    Status,
    Reset(ResetArgs),
    CheckContinuity(CheckContinuityArgs),
    Backups(BackupsArgs),
}

#[derive(Debug, Args, Default)]
pub struct ResetArgs {
    /// Drop session records instead of archiving them
    #[arg(long)]
    pub delete_sessions: bool,
}

#[derive(Debug, Args, Default)]
pub struct CheckContinuityArgs {
    #[arg(long)]
    pub transcript: Option<PathBuf>,
    #[arg(long)]
    pub session_id: Option<String>,
}

#[derive(Debug, Args, Default)]
pub struct BackupsArgs {
    #[arg(long)]
    pub limit: Option<usize>,
}

fn print_report(report: &commands::CommandReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("command: {}", report.command);
    println!("ok: {}", report.ok);
    if !report.details.is_empty() {
        println!("details:");
        for detail in &report.details {
            println!("- {detail}");
        }
    }
    if !report.issues.is_empty() {
        println!("issues:");
        for issue in &report.issues {
            println!("- {issue}");
        }
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let report = match &cli.command {
        Command::Extract => std::process::exit(commands::extract::run()),
        Command::Guard => std::process::exit(commands::guard::run()),
        Command::Progress => std::process::exit(commands::progress::run()),
        Command::SessionStart => std::process::exit(commands::session_start::run()),
        Command::Compact => std::process::exit(commands::compact::run()),
        Command::CompactWorker => std::process::exit(commands::compact_worker::run()),
        Command::Status => commands::status::run()?,
        Command::Reset(args) => commands::reset::run(&commands::reset::ResetOptions {
            delete_sessions: args.delete_sessions,
        })?,
        Command::CheckContinuity(args) => {
            let opts = commands::check_continuity::CheckContinuityOptions {
                transcript: args.transcript.clone(),
                session_id: args.session_id.clone(),
            };
            let (report, continued) = commands::check_continuity::run(&opts)?;
            print_report(&report, cli.json)?;
            std::process::exit(if continued { 0 } else { 1 });
        }
        Command::Backups(args) => commands::backups::run(&commands::backups::BackupsOptions {
            limit: args.limit,
        })?,
    };

    print_report(&report, cli.json)?;

    if report.ok {
        Ok(())
    } else {
        std::process::exit(2);
    }
}
