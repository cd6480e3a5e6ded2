#[macro_use]
extern crate log;

mod counter_state;
mod election;
mod inproc_network;
mod memory_storage;

pub use counter_state::{CounterChange, CounterState};
pub use election::{FixedElectionTimer, RandomizedElectionTimer};
pub use inproc_network::InProcNetwork;
pub use memory_storage::MemoryStorage;
