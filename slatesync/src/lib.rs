pub mod cli;
pub mod commands;
pub mod config;
pub mod control;
pub mod session;
pub mod ssh;
pub mod sync;
