//! In-process coordination service
//!
//! `MemoryEnsemble` keeps a node tree shared by every session connected to it
//! and reproduces the parts of ZooKeeper semantics the election relies on:
//! ephemeral nodes bound to a session, per-parent sequence counters, one-shot
//! node watches and session expiry. Clones share the same tree.
//!
//! A session's record outlives its end only while a [`MemorySession`] handle
//! still refers to it; dropping the handle closes the session and forgets it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{
    validate_path, ConnectOptions, Connector, NodeMode, Notification, Notifier, Session,
    SessionState,
};
use crate::error::{LeadershipError, Result};

/// Identifier of one in-process session
pub type SessionId = u64;

/// A shared in-memory node tree that sessions connect to
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
    next_sequence: u64,
}

impl Node {
    fn persistent() -> Self {
        Self {
            data: Vec::new(),
            owner: None,
            next_sequence: 0,
        }
    }
}

struct SessionRecord {
    state: SessionState,
    listeners: Vec<Notifier>,
}

struct Watch {
    session: SessionId,
    notifier: Notifier,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<SessionId, SessionRecord>,
    watches: HashMap<String, Vec<Watch>>,
    next_session: SessionId,
    reachable: bool,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::persistent());
        Self {
            nodes,
            sessions: HashMap::new(),
            watches: HashMap::new(),
            next_session: 1,
            reachable: true,
        }
    }
}

impl Tree {
    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &path[..idx],
            None => "/",
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn check_session(&self, id: SessionId) -> Result<()> {
        match self.sessions.get(&id).map(|s| s.state) {
            Some(SessionState::Connected) => Ok(()),
            Some(SessionState::Expired) => Err(LeadershipError::connection("session expired")),
            Some(SessionState::Closed) => Err(LeadershipError::connection("session closed")),
            Some(SessionState::Suspended) => {
                Err(LeadershipError::connection("session suspended"))
            }
            None => Err(LeadershipError::connection("unknown session")),
        }
    }

    fn fire(&mut self, path: &str) {
        if let Some(watchers) = self.watches.remove(path) {
            for watch in watchers {
                let _ = watch.notifier.send(Notification::NodeChanged(path.to_string()));
            }
        }
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire(path);
        }
    }

    /// Drop every ephemeral node owned by `id` and end the session
    fn end_session(&mut self, id: SessionId, state: SessionState) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            debug!("Removing ephemeral node {} of session {}", path, id);
            self.remove_node(&path);
        }

        self.watches.retain(|_, watchers| {
            watchers.retain(|watch| watch.session != id);
            !watchers.is_empty()
        });

        if let Some(record) = self.sessions.get_mut(&id) {
            record.state = state;
            for listener in record.listeners.drain(..) {
                let _ = listener.send(Notification::SessionLost);
            }
        }
    }

    /// Close `id` if it is still live and drop its record
    fn forget_session(&mut self, id: SessionId) {
        if self.check_session(id).is_ok() {
            self.end_session(id, SessionState::Closed);
        }
        self.sessions.remove(&id);
    }
}

impl MemoryEnsemble {
    /// Create an empty ensemble containing only the root node
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make new connections fail as if no server were reachable
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Expire a session: its ephemeral nodes vanish and listeners are told
    pub fn expire_session(&self, id: SessionId) {
        let mut tree = self.lock();
        if tree.check_session(id).is_ok() {
            tree.end_session(id, SessionState::Expired);
        }
    }

    /// Session that owns the ephemeral node at `path`
    pub fn owner_of(&self, path: &str) -> Option<SessionId> {
        self.lock().nodes.get(path).and_then(|node| node.owner)
    }

    /// Whether a node exists at `path`
    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Direct children of `path`, sorted by name
    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().children_of(path)
    }

    /// Number of sessions that are still connected
    pub fn live_sessions(&self) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Connected)
            .count()
    }

    /// Open a session directly, bypassing [`Connector`]
    pub fn open_session(&self) -> Result<MemorySession> {
        let mut tree = self.lock();
        if !tree.reachable {
            return Err(LeadershipError::connection(
                "no coordination server reachable",
            ));
        }
        let id = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(
            id,
            SessionRecord {
                state: SessionState::Connected,
                listeners: Vec::new(),
            },
        );
        debug!("Opened in-memory session {}", id);
        Ok(MemorySession {
            id,
            ensemble: self.clone(),
        })
    }
}

impl Connector for MemoryEnsemble {
    fn connect(
        &self,
        _servers: &[String],
        _port: u16,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(self.open_session()?))
    }
}

/// A session on a [`MemoryEnsemble`]
pub struct MemorySession {
    id: SessionId,
    ensemble: MemoryEnsemble,
}

impl MemorySession {
    /// This session's identifier
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.ensemble.lock().forget_session(self.id);
    }
}

impl Session for MemorySession {
    fn ensure_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut tree = self.ensemble.lock();
        tree.check_session(self.id)?;

        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !tree.nodes.contains_key(&current) {
                let parent = Tree::parent_of(&current).to_string();
                if let Some(parent) = tree.nodes.get_mut(&parent) {
                    parent.next_sequence += 1;
                }
                tree.nodes.insert(current.clone(), Node::persistent());
            }
        }
        Ok(())
    }

    fn create_contender(&self, path: &str, payload: &[u8], mode: NodeMode) -> Result<String> {
        validate_path(path)?;
        let mut tree = self.ensemble.lock();
        tree.check_session(self.id)?;

        let parent_path = Tree::parent_of(path).to_string();
        let parent = tree
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| LeadershipError::not_found(parent_path.clone()))?;
        if parent.owner.is_some() {
            return Err(LeadershipError::coordination(
                path,
                "ephemeral nodes cannot have children",
            ));
        }

        let sequence = parent.next_sequence;
        let actual = if mode.is_sequential() {
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };

        if tree.nodes.contains_key(&actual) {
            return Err(LeadershipError::AlreadyExists { path: actual });
        }
        if let Some(parent) = tree.nodes.get_mut(&parent_path) {
            parent.next_sequence += 1;
        }

        tree.nodes.insert(
            actual.clone(),
            Node {
                data: payload.to_vec(),
                owner: mode.is_ephemeral().then_some(self.id),
                next_sequence: 0,
            },
        );
        tree.fire(&actual);
        Ok(actual)
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.ensemble.lock();
        tree.check_session(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Err(LeadershipError::not_found(path));
        }
        Ok(tree.children_of(path))
    }

    fn read_data(&self, path: &str) -> Result<Vec<u8>> {
        let tree = self.ensemble.lock();
        tree.check_session(self.id)?;
        tree.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| LeadershipError::not_found(path))
    }

    fn watch_node(&self, path: &str, notifier: Notifier) -> Result<bool> {
        let mut tree = self.ensemble.lock();
        tree.check_session(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Ok(false);
        }
        // one pending watch per session and node
        let watchers = tree.watches.entry(path.to_string()).or_default();
        watchers.retain(|watch| watch.session != self.id);
        watchers.push(Watch {
            session: self.id,
            notifier,
        });
        Ok(true)
    }

    fn subscribe(&self, notifier: Notifier) {
        let mut tree = self.ensemble.lock();
        match tree.sessions.get_mut(&self.id) {
            Some(record) if record.state == SessionState::Connected => {
                record.listeners.push(notifier);
            }
            _ => {
                let _ = notifier.send(Notification::SessionLost);
            }
        }
    }

    fn state(&self) -> SessionState {
        self.ensemble
            .lock()
            .sessions
            .get(&self.id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Closed)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let mut tree = self.ensemble.lock();
        tree.check_session(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Ok(());
        }
        if !tree.children_of(path).is_empty() {
            return Err(LeadershipError::coordination(path, "node has children"));
        }
        tree.remove_node(path);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut tree = self.ensemble.lock();
        if tree.check_session(self.id).is_ok() {
            debug!("Closing in-memory session {}", self.id);
            tree.end_session(self.id, SessionState::Closed);
        }
        Ok(())
    }
}
