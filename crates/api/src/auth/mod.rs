//! Authentication module for the connection gateway

pub mod jwt;

pub use jwt::{Claims, JwtError, JwtVerifier, TokenVerifier};
