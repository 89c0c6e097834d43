pub mod app;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod logging;
pub mod provider;
pub mod utils;
