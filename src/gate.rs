// src/gate.rs

use std::sync::Arc;
use tokio::sync::watch;

/// Pause switch shared by all chunk tasks of one upload.
///
/// Only `pause`/`resume` write it; chunk tasks just wait until it is open.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { paused: Arc::new(tx) }
    }

    /// Returns true if the gate was open.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Returns true if the gate was closed.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Waits until the gate is open; returns immediately when it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}
