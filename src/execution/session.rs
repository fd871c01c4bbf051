//! Browser and Designer Sessions
//!
//! Sessions are opened before the first step of a playbook that needs them
//! and closed on every exit path. [`SessionGuard`] closes its session when
//! dropped, so an execution future cancelled mid-flight still tears down.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

/// Kind of automation session.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Browser,
    Designer,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Browser => write!(f, "browser"),
            Self::Designer => write!(f, "designer"),
        }
    }
}

/// Identifies an open session.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub kind: SessionKind,
    pub opened_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            opened_at: Utc::now(),
        }
    }
}

/// Opens and closes automation sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self, kind: SessionKind) -> Result<SessionHandle>;

    async fn close(&self, handle: &SessionHandle) -> Result<()>;
}

/// Provider that hands out session ids without driving anything.
///
/// Used when no browser or designer automation is wired in; steps still see
/// a session handle and can be run against mocks.
#[derive(Debug, Default)]
pub struct DetachedSessionProvider;

#[async_trait]
impl SessionProvider for DetachedSessionProvider {
    async fn open(&self, kind: SessionKind) -> Result<SessionHandle> {
        let handle = SessionHandle::new(kind);
        debug!("Opened detached {} session {}", kind, handle.id);
        Ok(handle)
    }

    async fn close(&self, handle: &SessionHandle) -> Result<()> {
        debug!("Closed detached {} session {}", handle.kind, handle.id);
        Ok(())
    }
}

/// Owns an open session until it is closed.
pub struct SessionGuard {
    provider: Arc<dyn SessionProvider>,
    handle: Option<SessionHandle>,
}

impl SessionGuard {
    /// Opens a session through the provider.
    pub async fn open(provider: Arc<dyn SessionProvider>, kind: SessionKind) -> Result<Self> {
        let handle = provider.open(kind).await?;
        info!("Started {} session {}", kind, handle.id);
        Ok(Self {
            provider,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    /// Closes the session and waits for the provider. Close errors are logged.
    pub async fn close(mut self) {
        if let Some(handle) = self.handle.take() {
            match self.provider.close(&handle).await {
                Ok(()) => info!("Closed {} session {}", handle.kind, handle.id),
                Err(e) => warn!("Failed to close {} session {}: {}", handle.kind, handle.id, e),
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // Dropped without an explicit close: hand the close to the runtime.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let provider = Arc::clone(&self.provider);
                runtime.spawn(async move {
                    if let Err(e) = provider.close(&handle).await {
                        warn!("Failed to close {} session {}: {}", handle.kind, handle.id, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime available to close {} session {}",
                handle.kind, handle.id
            ),
        }
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("handle", &self.handle)
            .finish()
    }
}
