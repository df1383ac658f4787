// Public API for the binaries and integration tests

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod identity;
pub mod mirror;
pub mod protocol;
pub mod room;
pub mod routes;
pub mod store;
pub mod sync;
pub mod types;
pub mod words;
pub mod ws;
