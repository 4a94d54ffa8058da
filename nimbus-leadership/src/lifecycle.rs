//! Session ownership and ordered cleanup
//!
//! A [`ManagedSession`] owns exactly one coordination session and at most one
//! contention node created through it. Closing deletes the node first and the
//! session second, exactly once, and never fails: secondary errors are logged.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::coordination::{ConnectOptions, Connector, Session};
use crate::error::Result;

/// A coordination session that is closed exactly once
pub struct ManagedSession {
    session: Arc<dyn Session>,
    contender: Option<String>,
    closed: bool,
}

impl ManagedSession {
    /// Connect and take ownership of the new session
    pub fn open(
        connector: &dyn Connector,
        servers: &[String],
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let session = connector.connect(servers, port, options)?;
        Ok(Self::adopt(session))
    }

    /// Take ownership of an already connected session
    pub fn adopt(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            contender: None,
            closed: false,
        }
    }

    /// The underlying session
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Record the contention node this session owns
    pub fn register_contender(&mut self, path: String) {
        self.contender = Some(path);
    }

    /// Path of the owned contention node, if any
    pub fn contender(&self) -> Option<&str> {
        self.contender.as_deref()
    }

    /// Delete the owned contention node, if any
    ///
    /// Returns whether a node was registered. Failures are logged; the
    /// service drops the ephemeral node with the session regardless.
    pub fn release_contender(&mut self) -> bool {
        let Some(path) = self.contender.take() else {
            return false;
        };
        debug!("Deleting contention node {}", path);
        if let Err(e) = self.session.delete(&path) {
            warn!("Failed to delete contention node {}: {}", path, e);
        }
        true
    }

    /// Release the contention node, then close the session
    ///
    /// Safe to call any number of times.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release_contender();
        if let Err(e) = self.session.close() {
            warn!("Failed to close coordination session: {}", e);
        }
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        self.close();
    }
}
