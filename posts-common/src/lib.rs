pub mod config;
pub mod envelope;
pub mod kafka;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod test_utils;
pub mod time;
