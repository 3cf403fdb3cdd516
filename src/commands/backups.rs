use anyhow::Result;
use chrono::{DateTime, Local};

use crate::budget::backup::list_backups;
use crate::budget::paths::resolve_paths;
use crate::commands::CommandReport;

#[derive(Debug, Clone, Default)]
pub struct BackupsOptions {
    pub limit: Option<usize>,
}

pub fn run(opts: &BackupsOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("backups");
    report.detail(format!("backups_dir={}", paths.backups_dir.display()));

    let listing = list_backups(&paths.backups_dir);
    report.detail(format!("count={}", listing.len()));
    for entry in listing.iter().take(opts.limit.unwrap_or(usize::MAX)) {
        let modified: DateTime<Local> = entry.modified.into();
        report.detail(format!(
            "{} format={} size={}B modified={}",
            entry.path.display(),
            entry.format.label(),
            entry.size_bytes,
            modified.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    Ok(report)
}
