//! Leadership election engine
//!
//! Each contender creates an ephemeral sequential node under the election
//! path. Contenders are ordered by the sequence number the coordination
//! service assigns; the first live node holds leadership. A waiting contender
//! watches only the node immediately ahead of it and re-evaluates the order
//! whenever that node goes away.
//!
//! ```text
//! Idle -> Connecting -> Contending -> Standby -> Leader
//!   ^          |             |           |         |
//!   +----------+-------------+-----------+         +-> Lost (session expired)
//!   (failure / timeout cleans up)
//!
//! release() from any state -> Released (terminal)
//! ```

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::address::{encode, CandidateIdentity};
use crate::config::LeadershipConfig;
use crate::coordination::{
    contenders_in_order, join, node_name, ConnectOptions, Connector, NodeMode, Notification,
    Notifier, Session, SessionState, CONTENDER_PREFIX,
};
use crate::error::{LeadershipError, Result};
use crate::lifecycle::ManagedSession;
use crate::membership::MembershipResolver;

/// Turns an identity into the payload stored in the contention node
pub type PayloadEncoder = fn(&CandidateIdentity) -> Vec<u8>;

/// Where an engine is in the election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not contending; `acquire` may be called
    Idle,
    /// Opening a coordination session
    Connecting,
    /// Creating the contention node and evaluating the order
    Contending,
    /// Waiting behind another contender
    Standby,
    /// Holding leadership
    Leader,
    /// Was leader, but the session expired and the node is gone
    Lost,
    /// Released; the engine cannot be reused
    Released,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Inner {
    state: ElectionState,
    session: Option<ManagedSession>,
    interrupt: Option<Notifier>,
    /// Session events received while leading
    events: Option<Receiver<Notification>>,
    /// Our node must be confirmed after a reconnect before we lead again
    verify_pending: bool,
}

/// One master candidate's participation in the election
pub struct LeaderElection {
    identity: CandidateIdentity,
    encoder: PayloadEncoder,
    connector: Arc<dyn Connector>,
    servers: Vec<String>,
    port: u16,
    options: ConnectOptions,
    election_path: String,
    acquire_timeout: Option<Duration>,
    resolver: MembershipResolver,
    inner: Mutex<Inner>,
}

impl LeaderElection {
    /// Create an engine for the identity and coordination settings in `config`
    pub fn new(config: &LeadershipConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let resolver = MembershipResolver::new(config, Arc::clone(&connector))?;
        Ok(Self {
            identity: config.identity()?,
            encoder: encode,
            connector,
            servers: config.zookeeper_servers.clone(),
            port: config.zookeeper_port,
            options: config.connect_options(),
            election_path: config.election_path(),
            acquire_timeout: config.acquire_timeout(),
            resolver,
            inner: Mutex::new(Inner {
                state: ElectionState::Idle,
                session: None,
                interrupt: None,
                events: None,
                verify_pending: false,
            }),
        })
    }

    /// Replace how the identity is written into the contention node
    pub fn with_payload_encoder(mut self, encoder: PayloadEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    /// This contender's identity
    pub fn identity(&self) -> &CandidateIdentity {
        &self.identity
    }

    /// Path under which contention nodes are created
    pub fn election_path(&self) -> &str {
        &self.election_path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until this contender is the leader
    ///
    /// Uses the configured `acquire_timeout_ms`, waiting forever when unset.
    pub fn acquire(&self) -> Result<()> {
        self.acquire_until(self.acquire_timeout.map(|t| Instant::now() + t))
    }

    /// Block until this contender is the leader or `timeout` elapses
    ///
    /// On timeout the contention node is deleted before `Timeout` is returned.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        self.acquire_until(Some(Instant::now() + timeout))
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> Result<()> {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel();
        {
            let mut inner = self.lock();
            if inner.state != ElectionState::Idle {
                return Err(LeadershipError::InvalidState {
                    operation: "acquire leadership",
                    state: inner.state.to_string(),
                });
            }
            inner.state = ElectionState::Connecting;
            inner.interrupt = Some(tx.clone());
        }

        let (session, node) = match self.enter_contention(&tx) {
            Ok(entered) => entered,
            Err(e) => {
                self.reset_to_idle(ElectionState::Connecting);
                return Err(e);
            }
        };

        match self.wait_for_turn(session.as_ref(), &node, &tx, &rx, started, deadline) {
            Ok(()) => self.become_leader(rx),
            Err(e) => Err(self.abandon_contention(e, started)),
        }
    }

    /// Connect, ensure the election path, create and register our node
    fn enter_contention(&self, tx: &Notifier) -> Result<(Arc<dyn Session>, String)> {
        debug!("Connecting to coordination service for {}", self.identity);
        let mut managed =
            ManagedSession::open(self.connector.as_ref(), &self.servers, self.port, &self.options)?;
        let session = Arc::clone(managed.session());
        session.subscribe(tx.clone());

        session.ensure_path(&self.election_path)?;
        let prefix = join(&self.election_path, CONTENDER_PREFIX);
        let payload = (self.encoder)(&self.identity);
        let node = session.create_contender(&prefix, &payload, NodeMode::EphemeralSequential)?;
        managed.register_contender(node.clone());
        debug!("Created contention node {} for {}", node, self.identity);

        let mut inner = self.lock();
        if inner.state != ElectionState::Connecting {
            let state = inner.state.to_string();
            drop(inner);
            managed.close();
            return Err(LeadershipError::InvalidState {
                operation: "acquire leadership",
                state,
            });
        }
        inner.state = ElectionState::Contending;
        inner.session = Some(managed);
        Ok((session, node))
    }

    fn wait_for_turn(
        &self,
        session: &dyn Session,
        node: &str,
        tx: &Notifier,
        rx: &Receiver<Notification>,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let own_name = node_name(node);
        loop {
            let ordered = contenders_in_order(session.list_children(&self.election_path)?);
            let position = ordered
                .iter()
                .position(|name| name == own_name)
                .ok_or_else(|| {
                    LeadershipError::connection(format!(
                        "contention node {} vanished; session was lost",
                        node
                    ))
                })?;

            if position == 0 {
                return Ok(());
            }

            let predecessor = join(&self.election_path, &ordered[position - 1]);
            self.transition(ElectionState::Contending, ElectionState::Standby)?;
            if !session.watch_node(&predecessor, tx.clone())? {
                continue;
            }
            debug!(
                "{} is standby at position {}, watching {}",
                self.identity, position, predecessor
            );

            let notification = match deadline {
                None => rx
                    .recv()
                    .map_err(|_| LeadershipError::connection("notification channel closed"))?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(remaining) {
                        Ok(notification) => notification,
                        Err(RecvTimeoutError::Timeout) => {
                            return Err(LeadershipError::Timeout {
                                waited: started.elapsed(),
                            })
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(LeadershipError::connection(
                                "notification channel closed",
                            ))
                        }
                    }
                }
            };

            match notification {
                Notification::NodeChanged(path) => {
                    debug!("Contention order changed at {}", path);
                }
                Notification::SessionLost => {
                    return Err(LeadershipError::connection(
                        "session lost while waiting for leadership",
                    ));
                }
                Notification::Reconnected => {
                    debug!("Session reconnected, re-checking {}", node);
                }
                Notification::Released => {
                    return Err(LeadershipError::InvalidState {
                        operation: "acquire leadership",
                        state: ElectionState::Released.to_string(),
                    });
                }
            }
        }
    }

    /// Move `from -> to` under the guard; fail if released meanwhile
    fn transition(&self, from: ElectionState, to: ElectionState) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            state if state == from => {
                inner.state = to;
                Ok(())
            }
            state if state == to => Ok(()),
            state => Err(LeadershipError::InvalidState {
                operation: "acquire leadership",
                state: state.to_string(),
            }),
        }
    }

    fn become_leader(&self, events: Receiver<Notification>) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            ElectionState::Contending | ElectionState::Standby => {
                inner.state = ElectionState::Leader;
                inner.interrupt = None;
                inner.events = Some(events);
                inner.verify_pending = false;
                info!("{} acquired leadership", self.identity);
                Ok(())
            }
            state => Err(LeadershipError::InvalidState {
                operation: "acquire leadership",
                state: state.to_string(),
            }),
        }
    }

    fn reset_to_idle(&self, expected: ElectionState) {
        let mut inner = self.lock();
        if inner.state == expected {
            inner.state = ElectionState::Idle;
            inner.interrupt = None;
        }
    }

    /// Drop our node and session after a failed wait, returning to `Idle`
    ///
    /// A failure caused by a concurrent `release` is reported as such.
    fn abandon_contention(&self, error: LeadershipError, started: Instant) -> LeadershipError {
        let session = {
            let mut inner = self.lock();
            match inner.state {
                ElectionState::Contending | ElectionState::Standby => {
                    inner.state = ElectionState::Idle;
                    inner.interrupt = None;
                    inner.session.take()
                }
                state => {
                    debug!("{} stopped contending: engine is {}", self.identity, state);
                    return LeadershipError::InvalidState {
                        operation: "acquire leadership",
                        state: state.to_string(),
                    };
                }
            }
        };

        if matches!(error, LeadershipError::Timeout { .. }) {
            info!("Gave up waiting for leadership after {:?}", started.elapsed());
        } else {
            warn!("Leadership contention failed: {}", error);
        }
        if let Some(mut session) = session {
            session.close();
        }
        error
    }

    /// Re-check a leader against its session; a lost leader becomes `Lost`
    ///
    /// After a reconnect the node is read back before leadership is trusted
    /// again.
    fn refresh(&self, inner: &mut Inner) -> ElectionState {
        if inner.state != ElectionState::Leader {
            return inner.state;
        }

        let mut lost = false;
        if let Some(events) = &inner.events {
            for event in events.try_iter() {
                match event {
                    Notification::SessionLost => lost = true,
                    Notification::Reconnected => inner.verify_pending = true,
                    Notification::NodeChanged(_) | Notification::Released => {}
                }
            }
        }

        match &inner.session {
            None => lost = true,
            Some(managed) => match managed.session().state() {
                SessionState::Expired | SessionState::Closed => lost = true,
                SessionState::Connected if inner.verify_pending && !lost => {
                    let session = managed.session();
                    match managed.contender().map(|node| session.read_data(node)) {
                        Some(Ok(_)) => {
                            debug!("{} still holds its node after reconnect", self.identity);
                            inner.verify_pending = false;
                        }
                        Some(Err(LeadershipError::NotFound { .. })) | None => lost = true,
                        Some(Err(e)) => debug!("Could not confirm contention node: {}", e),
                    }
                }
                _ => {}
            },
        }

        if lost {
            warn!("{} lost leadership: session expired", self.identity);
            inner.state = ElectionState::Lost;
            inner.events = None;
            inner.verify_pending = false;
        }
        inner.state
    }

    /// Current state, refreshed against the session
    ///
    /// A leader whose session expired is reported as [`ElectionState::Lost`].
    pub fn state(&self) -> ElectionState {
        let mut inner = self.lock();
        self.refresh(&mut inner)
    }

    /// Whether this contender currently holds leadership
    ///
    /// False while the session is suspended, since the service may already
    /// have handed leadership to another contender.
    pub fn is_leader(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner) == ElectionState::Leader
            && !inner.verify_pending
            && inner
                .session
                .as_ref()
                .is_some_and(|s| s.session().state() == SessionState::Connected)
    }

    /// Path of this contender's node while contending or leading
    pub fn contender_path(&self) -> Option<String> {
        self.lock()
            .session
            .as_ref()
            .and_then(|s| s.contender().map(str::to_string))
    }

    /// Delete our contention node, then close the session
    ///
    /// Interrupts a blocked [`acquire`](Self::acquire) on another thread.
    /// Idempotent; never fails.
    pub fn release(&self) {
        let (previous, session, interrupt) = {
            let mut inner = self.lock();
            if inner.state == ElectionState::Released {
                return;
            }
            let previous = inner.state;
            inner.state = ElectionState::Released;
            inner.events = None;
            (previous, inner.session.take(), inner.interrupt.take())
        };

        if let Some(interrupt) = interrupt {
            let _ = interrupt.send(Notification::Released);
        }
        if let Some(mut session) = session {
            session.close();
        }
        if previous == ElectionState::Leader {
            info!("{} released leadership", self.identity);
        } else {
            debug!("{} released election from {}", self.identity, previous);
        }
    }

    /// Same as [`release`](Self::release)
    pub fn close(&self) {
        self.release();
    }

    /// Resolve the current leader without contending
    ///
    /// Reuses this engine's session when it has one.
    pub fn leader_address(&self) -> Result<Option<CandidateIdentity>> {
        match self.shared_session() {
            Some(session) => self.resolver.leader_address_with(session.as_ref()),
            None => self.resolver.leader_address(),
        }
    }

    /// List all live contenders in creation order without contending
    pub fn participants(&self) -> Result<Vec<CandidateIdentity>> {
        match self.shared_session() {
            Some(session) => self.resolver.participants_with(session.as_ref()),
            None => self.resolver.participants(),
        }
    }

    fn shared_session(&self) -> Option<Arc<dyn Session>> {
        self.lock()
            .session
            .as_ref()
            .filter(|s| s.session().state() == SessionState::Connected)
            .map(|s| Arc::clone(s.session()))
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::scripted::ScriptedConnector;
    use crate::coordination::MemoryEnsemble;

    fn config(host: &str) -> LeadershipConfig {
        LeadershipConfig {
            nimbus_host: host.to_string(),
            ..Default::default()
        }
    }

    fn engine(ensemble: &MemoryEnsemble, host: &str) -> LeaderElection {
        LeaderElection::new(&config(host), Arc::new(ensemble.clone())).unwrap()
    }

    #[test]
    fn test_new_engine_is_idle() {
        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "A");

        assert_eq!(election.state(), ElectionState::Idle);
        assert!(!election.is_leader());
        assert_eq!(election.contender_path(), None);
        assert_eq!(election.election_path(), "/storm/nimbus/leadership");
        assert_eq!(election.identity().to_string(), "A:6627");
        assert_eq!(ensemble.live_sessions(), 0);
    }

    #[test]
    fn test_sole_contender_leads_immediately() {
        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "A");

        election.acquire().unwrap();

        assert!(election.is_leader());
        assert_eq!(election.state(), ElectionState::Leader);
        let node = election.contender_path().unwrap();
        assert!(node.starts_with("/storm/nimbus/leadership/lock-"));
    }

    #[test]
    fn test_double_acquire_is_invalid() {
        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "A");
        election.acquire().unwrap();

        let result = election.acquire();
        assert!(matches!(result, Err(LeadershipError::InvalidState { .. })));
        assert!(election.is_leader());
    }

    #[test]
    fn test_acquire_after_release_is_invalid() {
        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "A");
        election.release();

        let result = election.acquire();
        assert!(matches!(result, Err(LeadershipError::InvalidState { .. })));
        assert_eq!(ensemble.live_sessions(), 0);
    }

    #[test]
    fn test_release_deletes_node_and_closes_session() {
        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "A");
        election.acquire().unwrap();
        let node = election.contender_path().unwrap();

        election.release();
        election.release();

        assert!(!ensemble.exists(&node));
        assert_eq!(ensemble.live_sessions(), 0);
        assert_eq!(election.state(), ElectionState::Released);
        assert!(!election.is_leader());
    }

    #[test]
    fn test_unreachable_service_is_retryable_and_engine_stays_usable() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_reachable(false);
        let election = engine(&ensemble, "A");

        let err = election.acquire().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(election.state(), ElectionState::Idle);

        ensemble.set_reachable(true);
        election.acquire().unwrap();
        assert!(election.is_leader());
    }

    #[test]
    fn test_timeout_deletes_contention_node() {
        let ensemble = MemoryEnsemble::new();
        let leader = engine(&ensemble, "A");
        leader.acquire().unwrap();
        let standby = engine(&ensemble, "B");

        let err = standby.acquire_timeout(Duration::from_millis(50)).unwrap_err();

        assert!(matches!(err, LeadershipError::Timeout { .. }));
        assert_eq!(standby.state(), ElectionState::Idle);
        assert_eq!(standby.contender_path(), None);
        assert_eq!(ensemble.children("/storm/nimbus/leadership").len(), 1);
        assert_eq!(ensemble.live_sessions(), 1);
    }

    #[test]
    fn test_session_expiry_while_leader_is_reported() {
        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "A");
        election.acquire().unwrap();
        let owner = ensemble
            .owner_of(&election.contender_path().unwrap())
            .unwrap();

        ensemble.expire_session(owner);

        assert!(!election.is_leader());
        assert_eq!(election.state(), ElectionState::Lost);
        election.release();
        assert_eq!(election.state(), ElectionState::Released);
    }

    #[test]
    fn test_custom_payload_encoder() {
        fn upper(identity: &CandidateIdentity) -> Vec<u8> {
            identity.to_string().to_uppercase().into_bytes()
        }

        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "nimbus-a").with_payload_encoder(upper);
        election.acquire().unwrap();

        let session = ensemble.open_session().unwrap();
        let data = session
            .read_data(&election.contender_path().unwrap())
            .unwrap();
        assert_eq!(data, b"NIMBUS-A:6627".to_vec());
    }

    #[test]
    fn test_drop_releases_node() {
        let ensemble = MemoryEnsemble::new();
        let node = {
            let election = engine(&ensemble, "A");
            election.acquire().unwrap();
            election.contender_path().unwrap()
        };

        assert!(!ensemble.exists(&node));
        assert_eq!(ensemble.live_sessions(), 0);
    }

    #[test]
    fn test_leader_address_over_own_session() {
        let ensemble = MemoryEnsemble::new();
        let election = engine(&ensemble, "A");
        election.acquire().unwrap();

        assert_eq!(
            election.leader_address().unwrap(),
            Some(CandidateIdentity::new("A", 6627).unwrap())
        );
        assert_eq!(election.participants().unwrap().len(), 1);
        // resolution over the engine's own session opens nothing new
        assert_eq!(ensemble.live_sessions(), 1);
    }

    #[test]
    fn test_predecessor_gone_before_watch_is_armed() {
        let ensemble = MemoryEnsemble::new();
        let leader = engine(&ensemble, "A");
        leader.acquire().unwrap();

        // the leader's node disappears between listing and arming the watch
        let connector = Arc::new(
            ScriptedConnector::new(&ensemble)
                .before_watch(|session, predecessor| session.inner().delete(predecessor).unwrap()),
        );
        let standby = LeaderElection::new(&config("B"), connector.clone()).unwrap();

        standby.acquire_timeout(Duration::from_secs(5)).unwrap();

        assert!(standby.is_leader());
        assert_eq!(connector.last_session().watch_results(), vec![false]);
    }

    #[test]
    fn test_standby_whose_node_vanished_across_reconnect_fails() {
        let ensemble = MemoryEnsemble::new();
        let leader = engine(&ensemble, "A");
        leader.acquire().unwrap();

        let connector = Arc::new(ScriptedConnector::new(&ensemble).before_watch(|session, _| {
            let own = session.created().unwrap();
            session.inner().delete(&own).unwrap();
            session.reconnect();
        }));
        let standby = LeaderElection::new(&config("B"), connector).unwrap();

        let err = standby.acquire_timeout(Duration::from_secs(5)).unwrap_err();

        assert!(matches!(err, LeadershipError::Connection { .. }));
        assert!(err.is_retryable());
        assert_eq!(standby.state(), ElectionState::Idle);
        assert!(leader.is_leader());
    }

    #[test]
    fn test_leader_rechecks_node_after_reconnect() {
        let ensemble = MemoryEnsemble::new();
        let connector = Arc::new(ScriptedConnector::new(&ensemble));
        let election = LeaderElection::new(&config("A"), connector.clone()).unwrap();
        election.acquire().unwrap();
        let session = connector.last_session();

        session.reconnect();
        assert!(election.is_leader());

        let node = election.contender_path().unwrap();
        session.inner().delete(&node).unwrap();
        session.reconnect();

        assert!(!election.is_leader());
        assert_eq!(election.state(), ElectionState::Lost);
    }
}
