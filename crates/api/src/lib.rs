//! DRN Realtime API Library
//!
//! This crate contains the WebSocket gateway, the realtime room service and
//! the room administration routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use realtime::{RealtimeService, RealtimeSettings};
pub use state::AppState;
