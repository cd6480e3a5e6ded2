use std::thread;
use std::thread::JoinHandle;

pub mod cancellation;
pub mod peer_requester;
pub mod watch;

/// Spawns a worker function with its parameters on a dedicated thread.
pub fn run_worker_thread<T: Send + 'static, F: FnOnce(T) + Send + 'static>(
    worker: F,
    params: T,
) -> JoinHandle<()> {
    thread::spawn(move || worker(params))
}
