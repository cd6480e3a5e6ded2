use std::thread;
use std::time::{Duration, Instant};

pub mod cluster;
pub mod data;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn sleep_ms(milliseconds: u64) {
    thread::sleep(Duration::from_millis(milliseconds));
}

/// Polls the condition until it holds or the timeout elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep_ms(10);
    }
}
