//! WebSocket gateway for real-time rooms
//!
//! # Architecture
//!
//! - **Connection**: an authenticated WebSocket connection and its outbound queue
//! - **Room**: the rooms known to this instance and their local members
//! - **Heartbeat**: per-connection ping/pong liveness check
//! - **Handler**: Axum WebSocket route handler
//! - **Events**: Type-safe event definitions for client/server communication

pub mod connection;
pub mod events;
pub mod handler;
pub mod heartbeat;
pub mod room;

pub use handler::ws_handler;
