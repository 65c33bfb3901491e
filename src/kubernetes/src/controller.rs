pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod provider;
pub mod reconciler;
pub mod server;
pub mod webhook;
