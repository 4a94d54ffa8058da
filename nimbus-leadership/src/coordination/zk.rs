//! ZooKeeper backend for the coordination adapter

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZkState, ZooKeeper};

use super::{
    validate_path, ConnectOptions, Connector, NodeMode, Notification, Notifier, Session,
    SessionState,
};
use crate::error::{LeadershipError, Result};

/// Opens sessions against a ZooKeeper ensemble
#[derive(Debug, Clone, Copy, Default)]
pub struct ZooKeeperConnector;

/// Build the `host:port,host:port` connect string
pub fn connect_string(servers: &[String], port: u16) -> String {
    servers
        .iter()
        .map(|server| format!("{}:{}", server, port))
        .collect::<Vec<_>>()
        .join(",")
}

fn map_state(state: ZkState) -> SessionState {
    match state {
        ZkState::Connected | ZkState::ConnectedReadOnly => SessionState::Connected,
        ZkState::Closed | ZkState::AuthFailed => SessionState::Expired,
        _ => SessionState::Suspended,
    }
}

fn map_error(path: &str, error: ZkError) -> LeadershipError {
    match error {
        ZkError::NoNode => LeadershipError::not_found(path),
        ZkError::NodeExists => LeadershipError::AlreadyExists {
            path: path.to_string(),
        },
        ZkError::ConnectionLoss | ZkError::SessionExpired | ZkError::OperationTimeout => {
            LeadershipError::connection(format!("{:?} at {}", error, path))
        }
        other => LeadershipError::coordination(path, format!("{:?}", other)),
    }
}

fn create_mode(mode: NodeMode) -> CreateMode {
    match mode {
        NodeMode::Persistent => CreateMode::Persistent,
        NodeMode::Ephemeral => CreateMode::Ephemeral,
        NodeMode::EphemeralSequential => CreateMode::EphemeralSequential,
    }
}

/// Watch callback forwarding any event on `path` as a node change
fn node_watcher(path: &str, notifier: Notifier) -> impl Watcher {
    let watched = path.to_string();
    move |_event: WatchedEvent| {
        let _ = notifier.send(Notification::NodeChanged(watched.clone()));
    }
}

/// Default watcher; node watches are registered per call instead
struct SessionEventLogger;

impl Watcher for SessionEventLogger {
    fn handle(&self, _event: WatchedEvent) {
        debug!("ZooKeeper session event received");
    }
}

#[derive(Default)]
struct Status {
    state: Option<SessionState>,
    suspended_since: Option<Instant>,
}

/// State shared between the session and its connection listener
///
/// The client library silently replaces a session the server expired while
/// it was disconnected. A suspension that outlasts the session timeout is
/// therefore treated as expiry, and any shorter one is reported as
/// [`Notification::Reconnected`] so holders re-check their nodes.
struct SessionShared {
    session_timeout: Duration,
    status: Mutex<Status>,
    listeners: Mutex<Vec<Notifier>>,
}

impl SessionShared {
    fn new(session_timeout: Duration) -> Self {
        Self {
            session_timeout,
            status: Mutex::new(Status::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn current(&self) -> SessionState {
        self.status
            .lock()
            .map(|status| status.state.unwrap_or(SessionState::Suspended))
            .unwrap_or(SessionState::Closed)
    }

    fn update(&self, reported: SessionState) {
        let Ok(mut status) = self.status.lock() else {
            return;
        };
        if status.state.is_some_and(|state| state.is_lost()) {
            return;
        }
        let was_connected = status.state == Some(SessionState::Connected);
        let mut reconnected = false;
        let next = match reported {
            SessionState::Connected => match status.suspended_since.take() {
                Some(since) if since.elapsed() >= self.session_timeout => {
                    warn!(
                        "ZooKeeper connection was down for {:?}; treating session as expired",
                        since.elapsed()
                    );
                    SessionState::Expired
                }
                Some(_) => {
                    reconnected = true;
                    SessionState::Connected
                }
                None => SessionState::Connected,
            },
            SessionState::Suspended => {
                if was_connected {
                    status.suspended_since = Some(Instant::now());
                }
                SessionState::Suspended
            }
            lost => lost,
        };
        status.state = Some(next);
        drop(status);

        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        if next.is_lost() {
            for listener in listeners.drain(..) {
                let _ = listener.send(Notification::SessionLost);
            }
        } else if reconnected {
            listeners.retain(|listener| listener.send(Notification::Reconnected).is_ok());
        }
    }

    /// Mark the session closed by us; returns false if it already was
    fn mark_closed(&self) -> bool {
        let Ok(mut status) = self.status.lock() else {
            return false;
        };
        if status.state == Some(SessionState::Closed) {
            return false;
        }
        status.state = Some(SessionState::Closed);
        true
    }
}

impl Connector for ZooKeeperConnector {
    fn connect(
        &self,
        servers: &[String],
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Session>> {
        if servers.is_empty() {
            return Err(LeadershipError::connection("no ZooKeeper servers configured"));
        }
        let connect_string = connect_string(servers, port);
        debug!("Connecting to ZooKeeper at {}", connect_string);

        let zk = ZooKeeper::connect(&connect_string, options.session_timeout, SessionEventLogger)
            .map_err(|e| {
                LeadershipError::connection(format!(
                    "failed to connect to {}: {:?}",
                    connect_string, e
                ))
            })?;

        let shared = Arc::new(SessionShared::new(options.session_timeout));
        let (state_tx, state_rx) = mpsc::channel();
        let listener_shared = Arc::clone(&shared);
        zk.add_listener(move |state: ZkState| {
            let mapped = map_state(state);
            listener_shared.update(mapped);
            let _ = state_tx.send(mapped);
        });

        let deadline = Instant::now() + options.connection_timeout;
        let mut connected = false;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match state_rx.recv_timeout(remaining) {
                Ok(SessionState::Connected) => {
                    connected = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        // The handshake may complete before the listener is attached.
        if !connected && zk.exists("/", false).is_err() {
            let _ = zk.close();
            return Err(LeadershipError::connection(format!(
                "no ZooKeeper server reachable at {} within {:?}",
                connect_string, options.connection_timeout
            )));
        }
        shared.update(SessionState::Connected);

        info!("Connected to ZooKeeper at {}", connect_string);
        Ok(Arc::new(ZooKeeperSession { zk, shared }))
    }
}

/// A live ZooKeeper session
pub struct ZooKeeperSession {
    zk: ZooKeeper,
    shared: Arc<SessionShared>,
}

impl Session for ZooKeeperSession {
    fn ensure_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.zk.create(
                &current,
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(e) => return Err(map_error(&current, e)),
            }
        }
        Ok(())
    }

    fn create_contender(&self, path: &str, payload: &[u8], mode: NodeMode) -> Result<String> {
        self.zk
            .create(
                path,
                payload.to_vec(),
                Acl::open_unsafe().clone(),
                create_mode(mode),
            )
            .map_err(|e| map_error(path, e))
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.zk
            .get_children(path, false)
            .map_err(|e| map_error(path, e))
    }

    fn read_data(&self, path: &str) -> Result<Vec<u8>> {
        self.zk
            .get_data(path, false)
            .map(|(data, _stat)| data)
            .map_err(|e| map_error(path, e))
    }

    fn watch_node(&self, path: &str, notifier: Notifier) -> Result<bool> {
        let stat = self
            .zk
            .exists_w(path, node_watcher(path, notifier))
            .map_err(|e| map_error(path, e))?;
        Ok(stat.is_some())
    }

    fn subscribe(&self, notifier: Notifier) {
        if self.shared.current().is_lost() {
            let _ = notifier.send(Notification::SessionLost);
            return;
        }
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.push(notifier);
        }
    }

    fn state(&self) -> SessionState {
        self.shared.current()
    }

    fn delete(&self, path: &str) -> Result<()> {
        match self.zk.delete(path, None) {
            Ok(()) | Err(ZkError::NoNode) => Ok(()),
            Err(e) => Err(map_error(path, e)),
        }
    }

    fn close(&self) -> Result<()> {
        if !self.shared.mark_closed() {
            return Ok(());
        }
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.clear();
        }
        self.zk.close().map_err(|e| {
            warn!("Closing ZooKeeper session failed: {:?}", e);
            LeadershipError::connection(format!("close failed: {:?}", e))
        })
    }
}
