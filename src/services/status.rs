use serde::Serialize;
use std::sync::{
    Arc, OnceLock, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
};

/// Progress of the current network connection attempt as shown by the portal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionPhase,
    pub status: String,
}

/// Shared, read-mostly status record
///
/// The state machine writes it, the portal reads it. Besides the snapshot it
/// carries whether the access point is accepting submissions and the device
/// code, once loaded.
#[derive(Clone, Debug, Default)]
pub struct StatusBoard {
    snapshot: Arc<RwLock<StatusSnapshot>>,
    portal_open: Arc<AtomicBool>,
    device_code: Arc<OnceLock<String>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, state: ConnectionPhase, status: impl Into<String>) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        snapshot.state = state;
        snapshot.status = status.into();
    }

    pub fn portal_open(&self) -> bool {
        self.portal_open.load(Ordering::Acquire)
    }

    pub fn set_portal_open(&self, open: bool) {
        self.portal_open.store(open, Ordering::Release);
    }

    pub fn device_code(&self) -> Option<&str> {
        self.device_code.get().map(String::as_str)
    }

    /// Publish the device code; the first published code sticks
    pub fn set_device_code(&self, code: &str) {
        let _ = self.device_code.set(code.to_string());
    }
}
