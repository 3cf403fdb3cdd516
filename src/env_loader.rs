use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotenvLoadOutcome {
    LoadedDefault,
    LoadedFallback(PathBuf),
    Missing,
}

fn fallback_dotenv_path(project_dir: Option<PathBuf>, cwd: Option<PathBuf>) -> Option<PathBuf> {
    let base = project_dir.or(cwd)?;
    Some(base.join(".claude/.env"))
}

fn load_from(path: &Path) -> bool {
    path.is_file() && dotenvy::from_path(path).is_ok()
}

/// `.env` in the working directory wins; otherwise `<project>/.claude/.env`.
/// Variables already set in the environment are never overridden.
pub fn load_dotenv() -> DotenvLoadOutcome {
    if dotenvy::dotenv().is_ok() {
        return DotenvLoadOutcome::LoadedDefault;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("CLAUDE_PROJECT_DIR").map(PathBuf::from),
        env::current_dir().ok(),
    );
    match fallback {
        Some(path) if load_from(&path) => DotenvLoadOutcome::LoadedFallback(path),
        _ => DotenvLoadOutcome::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::fallback_dotenv_path;
    use std::path::PathBuf;

    #[test]
    fn fallback_prefers_project_dir() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/work/app")),
            Some(PathBuf::from("/tmp")),
        );
        assert_eq!(got, Some(PathBuf::from("/work/app/.claude/.env")));
    }

    #[test]
    fn fallback_uses_cwd_when_project_dir_unset() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/tmp/x")));
        assert_eq!(got, Some(PathBuf::from("/tmp/x/.claude/.env")));
    }

    #[test]
    fn no_base_means_no_fallback() {
        assert_eq!(fallback_dotenv_path(None, None), None);
    }
}
