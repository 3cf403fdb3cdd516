use crate::budget::config::load_config_or_default;
use crate::budget::observer;
use crate::budget::paths::resolve_paths;
use crate::budget::worker::CompactionWorker;
use crate::hook::{STDIN_TIMEOUT, read_stdin_with_timeout};

/// Entry point of the detached worker process. Stdout and stderr are null;
/// everything observable goes to the progress record and the log file.
pub fn run() -> i32 {
    let paths = match resolve_paths() {
        Ok(paths) => paths,
        Err(_) => return 1,
    };
    crate::logging::init(&paths);
    let payload = read_stdin_with_timeout(STDIN_TIMEOUT);
    let cfg = load_config_or_default(&paths);
    let observer = observer::from_config(&paths, cfg.telemetry.audit_log);
    CompactionWorker::from_config(&paths, &cfg, observer).run_guarded(&payload)
}
