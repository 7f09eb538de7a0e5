pub mod api;
pub mod config;
pub mod connection;
pub mod database;
pub mod engine;
pub mod error;
pub mod messages;
pub mod rpc_handler;
pub mod services;
pub mod store;
pub mod types;
pub mod use_cases;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
