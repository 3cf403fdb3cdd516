use crate::budget::poller;
use crate::commands::run_hook;

pub fn run() -> i32 {
    run_hook("progress", |paths, _cfg| Ok(poller::poll(paths)))
}
