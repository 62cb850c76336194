pub mod engineio;
pub mod http;
pub mod polling;
pub mod registry;
pub mod websocket;
