//! Session double that injects races into a [`MemorySession`]

use std::sync::{Arc, Mutex};

use super::memory::{MemoryEnsemble, MemorySession};
use super::{ConnectOptions, Connector, NodeMode, Notification, Notifier, Session, SessionState};
use crate::error::Result;

/// Runs once with the session and the path of the intercepted call
pub(crate) type Hook = Box<dyn FnOnce(&ScriptedSession, &str) + Send>;

/// Wraps a memory session, running hooks around selected calls
pub(crate) struct ScriptedSession {
    inner: MemorySession,
    after_list: Mutex<Option<Hook>>,
    before_watch: Mutex<Option<Hook>>,
    listeners: Mutex<Vec<Notifier>>,
    created: Mutex<Option<String>>,
    watch_results: Mutex<Vec<bool>>,
}

impl ScriptedSession {
    pub(crate) fn new(inner: MemorySession) -> Self {
        Self {
            inner,
            after_list: Mutex::new(None),
            before_watch: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            created: Mutex::new(None),
            watch_results: Mutex::new(Vec::new()),
        }
    }

    /// Run `hook` after the next `list_children` returns
    pub(crate) fn after_list(
        self,
        hook: impl FnOnce(&ScriptedSession, &str) + Send + 'static,
    ) -> Self {
        *self.after_list.lock().unwrap() = Some(Box::new(hook));
        self
    }

    /// Run `hook` before the next `watch_node` is armed
    pub(crate) fn before_watch(
        self,
        hook: impl FnOnce(&ScriptedSession, &str) + Send + 'static,
    ) -> Self {
        *self.before_watch.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub(crate) fn inner(&self) -> &MemorySession {
        &self.inner
    }

    /// Last node created through this session
    pub(crate) fn created(&self) -> Option<String> {
        self.created.lock().unwrap().clone()
    }

    /// What each `watch_node` call returned
    pub(crate) fn watch_results(&self) -> Vec<bool> {
        self.watch_results.lock().unwrap().clone()
    }

    /// Tell subscribers the connection recovered after a suspension
    pub(crate) fn reconnect(&self) {
        for listener in self.listeners.lock().unwrap().iter() {
            let _ = listener.send(Notification::Reconnected);
        }
    }

    fn run(slot: &Mutex<Option<Hook>>, session: &ScriptedSession, path: &str) {
        let hook = slot.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(session, path);
        }
    }
}

impl Session for ScriptedSession {
    fn ensure_path(&self, path: &str) -> Result<()> {
        self.inner.ensure_path(path)
    }

    fn create_contender(&self, path: &str, payload: &[u8], mode: NodeMode) -> Result<String> {
        let node = self.inner.create_contender(path, payload, mode)?;
        *self.created.lock().unwrap() = Some(node.clone());
        Ok(node)
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let children = self.inner.list_children(path)?;
        Self::run(&self.after_list, self, path);
        Ok(children)
    }

    fn read_data(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read_data(path)
    }

    fn watch_node(&self, path: &str, notifier: Notifier) -> Result<bool> {
        Self::run(&self.before_watch, self, path);
        let armed = self.inner.watch_node(path, notifier)?;
        self.watch_results.lock().unwrap().push(armed);
        Ok(armed)
    }

    fn subscribe(&self, notifier: Notifier) {
        self.listeners.lock().unwrap().push(notifier.clone());
        self.inner.subscribe(notifier);
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// Hands out [`ScriptedSession`]s, the first one carrying the given hooks
pub(crate) struct ScriptedConnector {
    ensemble: MemoryEnsemble,
    before_watch: Mutex<Option<Hook>>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedConnector {
    pub(crate) fn new(ensemble: &MemoryEnsemble) -> Self {
        Self {
            ensemble: ensemble.clone(),
            before_watch: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn before_watch(
        self,
        hook: impl FnOnce(&ScriptedSession, &str) + Send + 'static,
    ) -> Self {
        *self.before_watch.lock().unwrap() = Some(Box::new(hook));
        self
    }

    /// Most recently opened session
    pub(crate) fn last_session(&self) -> Arc<ScriptedSession> {
        Arc::clone(self.sessions.lock().unwrap().last().unwrap())
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        _servers: &[String],
        _port: u16,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn Session>> {
        let mut session = ScriptedSession::new(self.ensemble.open_session()?);
        if let Some(hook) = self.before_watch.lock().unwrap().take() {
            session = session.before_watch(hook);
        }
        let session = Arc::new(session);
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}
