pub mod api;
pub mod config;
pub mod handlers;
pub mod publisher;
pub mod router;
pub mod server;
