use crate::budget::config::ContinuityConfig;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuity {
    Continued(String),
    New(String),
}

impl Continuity {
    pub fn is_continued(&self) -> bool {
        matches!(self, Self::Continued(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Continued(reason) | Self::New(reason) => reason,
        }
    }
}

struct TranscriptMeta {
    line_count: usize,
    age_secs: u64,
    head: Vec<String>,
}

fn read_meta(path: &Path, head_lines: usize, now: SystemTime) -> std::io::Result<TranscriptMeta> {
    let modified = fs::metadata(path)?.modified()?;
    let age_secs = now
        .duration_since(modified)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let reader = BufReader::new(fs::File::open(path)?);
    let mut line_count = 0usize;
    let mut head = Vec::with_capacity(head_lines);
    for line in reader.lines() {
        let line = line?;
        if line_count < head_lines {
            head.push(line);
        }
        line_count += 1;
    }
    Ok(TranscriptMeta {
        line_count,
        age_secs,
        head,
    })
}

/// Decide whether the process behind `transcript` continues the session last
/// recorded in the ledger. Checks run in a fixed order and the first match
/// wins; anything unreadable is a new session.
pub fn detect(
    transcript: Option<&Path>,
    current_session_id: Option<&str>,
    last_session_id: Option<&str>,
    policy: &ContinuityConfig,
    now: SystemTime,
) -> Continuity {
    let Some(path) = transcript else {
        return Continuity::New("no transcript".to_string());
    };
    let meta = match read_meta(path, policy.marker_scan_lines, now) {
        Ok(meta) => meta,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "transcript unreadable");
            return Continuity::New("transcript unreadable".to_string());
        }
    };

    if meta.line_count < policy.min_lines {
        return Continuity::New(format!(
            "transcript has {} lines (< {})",
            meta.line_count, policy.min_lines
        ));
    }
    if meta.age_secs < policy.min_age_secs {
        return Continuity::New(format!(
            "transcript is {}s old (< {}s)",
            meta.age_secs, policy.min_age_secs
        ));
    }

    let Some(last) = last_session_id.map(str::trim).filter(|s| !s.is_empty()) else {
        return Continuity::New("no tracked session".to_string());
    };
    if current_session_id.map(str::trim) == Some(last) {
        return Continuity::Continued("same session id".to_string());
    }
    if meta.head.iter().any(|line| line.contains(last)) {
        return Continuity::Continued(format!(
            "previous session id found in first {} lines",
            policy.marker_scan_lines
        ));
    }

    Continuity::New("session id changed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write_transcript(dir: &Path, lines: &[String], age: Duration) -> std::path::PathBuf {
        let path = dir.join("current.jsonl");
        fs::write(&path, lines.join("\n")).expect("write transcript");
        let file = fs::File::options().write(true).open(&path).expect("open");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
        path
    }

    fn filler(n: usize) -> Vec<String> {
        (0..n).map(|i| format!(r#"{{"type":"user","n":{i}}}"#)).collect()
    }

    #[test]
    fn missing_transcript_is_new() {
        let policy = ContinuityConfig::default();
        let got = detect(None, Some("a"), Some("a"), &policy, SystemTime::now());
        assert!(!got.is_continued());
    }

    #[test]
    fn short_transcript_is_new_even_with_matching_id() {
        let tmp = tempdir().expect("tempdir");
        let path = write_transcript(tmp.path(), &filler(3), Duration::from_secs(600));
        let got = detect(
            Some(&path),
            Some("a"),
            Some("a"),
            &ContinuityConfig::default(),
            SystemTime::now(),
        );
        assert!(!got.is_continued());
        assert!(got.reason().contains("lines"));
    }

    #[test]
    fn fresh_transcript_is_new() {
        let tmp = tempdir().expect("tempdir");
        let path = write_transcript(tmp.path(), &filler(10), Duration::from_secs(2));
        let got = detect(
            Some(&path),
            Some("a"),
            Some("a"),
            &ContinuityConfig::default(),
            SystemTime::now(),
        );
        assert!(!got.is_continued());
        assert!(got.reason().contains("old"));
    }

    #[test]
    fn matching_id_continues() {
        let tmp = tempdir().expect("tempdir");
        let path = write_transcript(tmp.path(), &filler(10), Duration::from_secs(600));
        let got = detect(
            Some(&path),
            Some("abc"),
            Some("abc"),
            &ContinuityConfig::default(),
            SystemTime::now(),
        );
        assert_eq!(got, Continuity::Continued("same session id".to_string()));
    }

    #[test]
    fn marker_in_head_continues_but_not_beyond_scan_window() {
        let tmp = tempdir().expect("tempdir");
        let mut lines = filler(30);
        lines[4] = r#"{"type":"summary","leafUuid":"old-session-42"}"#.to_string();
        let path = write_transcript(tmp.path(), &lines, Duration::from_secs(600));
        let policy = ContinuityConfig::default();
        let got = detect(
            Some(&path),
            Some("new"),
            Some("old-session-42"),
            &policy,
            SystemTime::now(),
        );
        assert!(got.is_continued());

        let mut late = filler(30);
        late[25] = r#"{"ref":"old-session-42"}"#.to_string();
        let path = write_transcript(tmp.path(), &late, Duration::from_secs(600));
        let got = detect(
            Some(&path),
            Some("new"),
            Some("old-session-42"),
            &policy,
            SystemTime::now(),
        );
        assert!(!got.is_continued());
    }

    #[test]
    fn empty_stored_id_is_new() {
        let tmp = tempdir().expect("tempdir");
        let path = write_transcript(tmp.path(), &filler(10), Duration::from_secs(600));
        let got = detect(
            Some(&path),
            Some("abc"),
            Some("  "),
            &ContinuityConfig::default(),
            SystemTime::now(),
        );
        assert!(!got.is_continued());
    }
}
