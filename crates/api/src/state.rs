//! Application state shared by every handler

use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::realtime::RealtimeService;

#[derive(Clone)]
pub struct AppState {
    pub realtime: RealtimeService,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Origins allowed to open a WebSocket
    pub allowed_hosts: Arc<[String]>,
}

impl AppState {
    pub fn new(
        realtime: RealtimeService,
        verifier: Arc<dyn TokenVerifier>,
        allowed_hosts: Vec<String>,
    ) -> Self {
        Self {
            realtime,
            verifier,
            allowed_hosts: allowed_hosts.into(),
        }
    }
}
