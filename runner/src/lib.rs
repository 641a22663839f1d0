pub mod backends;
pub mod chain;
pub mod chart;
pub mod collector;
pub mod command;
pub mod config;
pub mod log;
pub mod maps;
pub mod orchestrator;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;
