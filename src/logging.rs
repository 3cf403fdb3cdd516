use crate::budget::paths::BudgetPaths;
use std::fs::{self, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "ctx-budget.log";
const FILTER_ENV: &str = "CTX_BUDGET_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Hook stdout/stderr belong to the host
/// contract, so events go to `<logs_dir>/ctx-budget.log`; when that file
/// cannot be opened they are discarded.
pub fn init(paths: &BudgetPaths) {
    let file = fs::create_dir_all(&paths.logs_dir).ok().and_then(|()| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.logs_dir.join(LOG_FILE))
            .ok()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_ansi(false)
        .with_target(false);
    let result = match file {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::sink).try_init(),
    };
    // A second init in the same process keeps the first subscriber.
    let _ = result;
}
