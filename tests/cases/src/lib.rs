#[macro_use]
extern crate log;

pub mod cases;
pub mod steps;
