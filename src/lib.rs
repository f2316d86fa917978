pub mod activity;
pub mod api;
pub mod config;
pub mod error;
pub mod node;
pub mod pool;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod token;
