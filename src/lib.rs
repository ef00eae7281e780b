pub mod agent;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod locking;
pub mod message;
pub mod messaging;
pub mod mux;
pub mod output;
pub mod rate_limit;
pub mod registry;
pub mod resource;
pub mod secret;
pub mod store;
