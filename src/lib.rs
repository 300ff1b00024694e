// Shared components
pub mod config;
pub mod correlation;
pub mod error;
pub mod metrics;

// Relay core
pub mod hub;
pub mod transport;

// Application layer
pub mod api;
pub mod server;
pub mod triggers;
pub mod websocket;
