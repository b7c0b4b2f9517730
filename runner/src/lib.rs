pub mod artifacts;
pub mod collector;
pub mod command;
pub mod config;
pub mod distributed;
pub mod executors;
pub mod grid;
pub mod namespaces;
pub mod sweep;
pub mod trainer;

#[cfg(test)]
mod sweep_test;
