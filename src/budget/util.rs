use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

const LIVENESS_TIMEOUT_SECS: u64 = 5;

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Truncate `input` to at most `max_chars` Unicode characters, stripping
/// control characters other than newlines and appending `…` when truncated.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    let clean: String = input
        .chars()
        .filter(|c| *c == '\n' || !c.is_control())
        .collect();
    if clean.chars().count() > max_chars {
        let mut s: String = clean.chars().take(max_chars).collect();
        s.push('…');
        s
    } else {
        clean
    }
}

/// Keep the last `max_chars` characters of `input`.
pub fn keep_tail_chars(input: &str, max_chars: usize) -> &str {
    let count = input.chars().count();
    if count <= max_chars {
        return input;
    }
    let skip = count - max_chars;
    match input.char_indices().nth(skip) {
        Some((idx, _)) => &input[idx..],
        None => "",
    }
}

/// Render `value` with thousands separators: `185000` -> `185,000`.
pub fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `true` when `pid` names a running, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if cfg!(windows) {
        return false;
    }

    let mut kill_cmd = Command::new("kill");
    kill_cmd.arg("-0").arg(pid.to_string());
    let Ok(kill_out) = run_command_with_optional_timeout(&mut kill_cmd, Some(LIVENESS_TIMEOUT_SECS))
    else {
        return false;
    };
    if !kill_out.status.success() {
        return false;
    }

    let mut ps_cmd = Command::new("ps");
    ps_cmd.arg("-p").arg(pid.to_string()).arg("-o").arg("stat=");
    let Ok(ps_out) = run_command_with_optional_timeout(&mut ps_cmd, Some(LIVENESS_TIMEOUT_SECS))
    else {
        // kill -0 succeeded; without ps we cannot rule out a zombie.
        return true;
    };
    if !ps_out.status.success() {
        return false;
    }
    let proc_state = String::from_utf8_lossy(&ps_out.stdout).trim().to_string();
    !proc_state.starts_with('Z')
}

pub fn run_command_with_optional_timeout(
    cmd: &mut Command,
    timeout_secs: Option<u64>,
) -> Result<Output> {
    let Some(timeout_secs) = timeout_secs else {
        return Ok(cmd.output()?);
    };
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let started = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            return Ok(child.wait_with_output()?);
        }
        if started.elapsed() >= Duration::from_secs(timeout_secs) {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("command timed out after {}s", timeout_secs);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Outcome of a command that was fed `input` on stdin.
#[derive(Debug)]
pub enum TimedOutput {
    Finished(Output),
    TimedOut,
}

/// Spawn `cmd`, write `input` to its stdin and collect output, killing the
/// child when `timeout_secs` elapses. Pipes are drained on reader threads so a
/// chatty child cannot deadlock against a full pipe.
pub fn run_command_with_input_timeout(
    cmd: &mut Command,
    input: &[u8],
    timeout_secs: u64,
) -> Result<TimedOutput> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn().context("failed to spawn command")?;

    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    if let Some(mut stdin) = child.stdin.take() {
        let payload = input.to_vec();
        thread::spawn(move || {
            let _ = stdin.write_all(&payload);
        });
    }

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= Duration::from_secs(timeout_secs) {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(TimedOutput::TimedOut);
        }
        thread::sleep(Duration::from_millis(50));
    };

    let stdout = stdout_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    Ok(TimedOutput::Finished(Output {
        status,
        stdout,
        stderr,
    }))
}

/// Replace `path` with the pretty JSON of `value` via temp file + rename, so
/// readers only ever see the old or the new file in full.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    temp.write_all(b"\n")?;
    temp.flush()?;
    temp.persist(path).map_err(|e| {
        anyhow::anyhow!("failed persisting {} atomically: {}", path.display(), e.error)
    })?;
    Ok(())
}

/// Remove `path`, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
