//! Coordination client adapter
//!
//! A thin facade over a hierarchical coordination service with ephemeral
//! nodes, sequential node creation and one-shot watches. The election engine
//! and membership resolver only ever talk to a [`Session`].
//!
//! Two backends are provided:
//! - [`ZooKeeperConnector`] for a real ZooKeeper ensemble
//! - [`MemoryEnsemble`] for in-process elections and tests

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LeadershipError, Result};

pub mod memory;
#[cfg(test)]
pub(crate) mod scripted;
pub mod zk;

pub use self::memory::MemoryEnsemble;
pub use self::zk::ZooKeeperConnector;

/// Name prefix of every contention node under the election path
pub const CONTENDER_PREFIX: &str = "lock-";

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a service-assigned monotonically increasing suffix
    EphemeralSequential,
}

impl NodeMode {
    /// Whether the node is bound to the session lifetime
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Whether the service appends a sequence number to the name
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::EphemeralSequential)
    }
}

/// Session state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected; ephemeral nodes are alive
    Connected,
    /// Temporarily disconnected; the session may still be recovered
    Suspended,
    /// The service expired the session and removed its ephemeral nodes
    Expired,
    /// Closed by this client
    Closed,
}

impl SessionState {
    /// Whether ephemeral nodes created by this session are known to be gone
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Expired | Self::Closed)
    }
}

/// Wake-up delivered to a blocked contender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A watched node was deleted or changed
    NodeChanged(String),
    /// The session expired or was closed
    SessionLost,
    /// The connection came back after a suspension
    ///
    /// Ephemeral nodes may have been removed meanwhile; holders must re-check.
    Reconnected,
    /// The owning engine was released from another thread
    Released,
}

/// Channel end that watches and session listeners deliver into
pub type Notifier = Sender<Notification>;

/// Session parameters handed to a [`Connector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Session expiry negotiated with the service
    pub session_timeout: Duration,
    /// How long to wait for the initial connection
    pub connection_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_millis(20_000),
            connection_timeout: Duration::from_millis(15_000),
        }
    }
}

/// Opens sessions to a coordination service
pub trait Connector: Send + Sync {
    /// Establish a session
    ///
    /// Fails with [`LeadershipError::Connection`] when no server is reachable.
    fn connect(
        &self,
        servers: &[String],
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Session>>;
}

/// One session with the coordination service
///
/// Ephemeral nodes created through a session live exactly as long as it does.
pub trait Session: Send + Sync {
    /// Create every missing segment of `path` as a persistent node
    fn ensure_path(&self, path: &str) -> Result<()>;

    /// Create a node and return its actual path
    ///
    /// For sequential modes `path` is a name prefix and the service appends
    /// the sequence number.
    fn create_contender(&self, path: &str, payload: &[u8], mode: NodeMode) -> Result<String>;

    /// Direct child names of `path`, in no guaranteed order
    fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// Payload of the node at `path`
    fn read_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Arm a one-shot watch on an existing node
    ///
    /// Returns `false` without arming anything if the node does not exist.
    fn watch_node(&self, path: &str, notifier: Notifier) -> Result<bool>;

    /// Deliver [`Notification::SessionLost`] when the session ends and
    /// [`Notification::Reconnected`] when a suspended connection recovers
    fn subscribe(&self, notifier: Notifier);

    /// Current session state
    fn state(&self) -> SessionState;

    /// Delete the node at `path`; a missing node is not an error
    fn delete(&self, path: &str) -> Result<()>;

    /// End the session; closing twice is not an error
    fn close(&self) -> Result<()>;
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Last segment of a node path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Check that `path` is absolute with no empty segments
pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(LeadershipError::coordination(path, "path must be absolute"));
    }
    if path.ends_with('/') || path.contains("//") {
        return Err(LeadershipError::coordination(path, "path has an empty segment"));
    }
    if path.contains('\0') {
        return Err(LeadershipError::coordination(path, "path contains NUL"));
    }
    Ok(())
}

/// Sequence number the service assigned to a contention node
///
/// Returns `None` for children that are not contention nodes.
pub fn contender_sequence(name: &str) -> Option<u64> {
    let (_, suffix) = name.rsplit_once(CONTENDER_PREFIX)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Order contention nodes by creation sequence
///
/// Children that are not contention nodes are dropped. This is the single
/// ordering rule used both to decide leadership and to resolve the leader.
pub fn contenders_in_order(children: Vec<String>) -> Vec<String> {
    let mut contenders: Vec<(u64, String)> = children
        .into_iter()
        .filter_map(|name| contender_sequence(&name).map(|seq| (seq, name)))
        .collect();
    contenders.sort();
    contenders.into_iter().map(|(_, name)| name).collect()
}
