pub mod channel;
pub mod config;
pub mod engine;
pub mod events;
pub mod log;
pub mod model;
pub mod secret;
pub mod session;
pub mod simulator;
pub mod store;
