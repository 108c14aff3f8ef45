pub mod app;
pub mod cli;
pub mod config;
pub mod credits;
pub mod logging;
