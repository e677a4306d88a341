#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod listener;
pub mod offline_store;
pub mod poller;
pub mod queue_bridge;
pub mod redis_bridge;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(test)]
mod poller_tests;
