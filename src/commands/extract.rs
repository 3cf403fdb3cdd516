use anyhow::Result;

use crate::budget::accountant::{DetachedLauncher, TokenAccountant};
use crate::commands::run_hook;
use crate::hook::read_hook_input;

/// PostToolUse: record the newest usage sample, apply auto-reset and the
/// threshold check.
pub fn run() -> i32 {
    run_hook("extract", |paths, cfg| -> Result<_> {
        let input = read_hook_input();
        let launcher = DetachedLauncher::new(paths);
        let accountant = TokenAccountant::new(paths, cfg, &launcher);
        let result = accountant.extract(&input)?;
        tracing::debug!(?result, "extract finished");
        Ok(accountant.render(&result))
    })
}
