use anyhow::Result;

use crate::budget::accountant::{DetachedLauncher, TokenAccountant};
use crate::commands::run_hook;
use crate::hook::read_hook_input;

/// PreToolUse / UserPromptSubmit: check-only evaluation.
pub fn run() -> i32 {
    run_hook("guard", |paths, cfg| -> Result<_> {
        let input = read_hook_input();
        let launcher = DetachedLauncher::new(paths);
        TokenAccountant::new(paths, cfg, &launcher).guard(&input)
    })
}
