pub mod assignment;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod json_store;
pub mod layout;
pub mod pending;
pub mod persistence;
pub mod service;
pub mod tiling;
pub mod util;

#[cfg(test)]
mod testing;
