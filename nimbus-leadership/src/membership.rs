//! Leader discovery and participant listing
//!
//! Read-only: resolution never creates a node. The leader is the live
//! contender with the lowest creation sequence, the same rule the election
//! engine uses to decide leadership.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::address::{decode, CandidateIdentity};
use crate::config::LeadershipConfig;
use crate::coordination::{contenders_in_order, join, ConnectOptions, Connector, Session};
use crate::error::{LeadershipError, Result};
use crate::lifecycle::ManagedSession;

/// Resolves the current leader and the set of live contenders
pub struct MembershipResolver {
    connector: Arc<dyn Connector>,
    servers: Vec<String>,
    port: u16,
    options: ConnectOptions,
    election_path: String,
}

impl MembershipResolver {
    /// Create a resolver for the election configured in `config`
    pub fn new(config: &LeadershipConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        if config.zookeeper_servers.is_empty() {
            return Err(LeadershipError::config("zookeeper_servers is empty"));
        }
        Ok(Self {
            connector,
            servers: config.zookeeper_servers.clone(),
            port: config.zookeeper_port,
            options: config.connect_options(),
            election_path: config.election_path(),
        })
    }

    /// Path whose children are the contention nodes
    pub fn election_path(&self) -> &str {
        &self.election_path
    }

    fn open(&self) -> Result<ManagedSession> {
        ManagedSession::open(self.connector.as_ref(), &self.servers, self.port, &self.options)
    }

    /// Resolve the leader over a short-lived session
    ///
    /// Returns `None` when nobody is contending.
    pub fn leader_address(&self) -> Result<Option<CandidateIdentity>> {
        let mut managed = self.open()?;
        let result = self.leader_address_with(managed.session().as_ref());
        managed.close();
        result
    }

    /// List live contenders in creation order over a short-lived session
    pub fn participants(&self) -> Result<Vec<CandidateIdentity>> {
        let mut managed = self.open()?;
        let result = self.participants_with(managed.session().as_ref());
        managed.close();
        result
    }

    /// Resolve the leader over an existing session
    ///
    /// A leader whose node vanishes between listing and reading is skipped in
    /// favour of the next contender. A malformed leader payload is an error.
    pub fn leader_address_with(&self, session: &dyn Session) -> Result<Option<CandidateIdentity>> {
        for name in self.ordered_contenders(session)? {
            let path = join(&self.election_path, &name);
            match session.read_data(&path) {
                Ok(data) => {
                    let leader = decode(&data)?;
                    debug!("Resolved leader {} at {}", leader, path);
                    return Ok(Some(leader));
                }
                Err(LeadershipError::NotFound { .. }) => {
                    debug!("Leader candidate {} vanished, trying next", path);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// List live contenders over an existing session
    ///
    /// Contenders whose node vanishes mid-read or whose payload is malformed
    /// are skipped.
    pub fn participants_with(&self, session: &dyn Session) -> Result<Vec<CandidateIdentity>> {
        let mut participants = Vec::new();
        for name in self.ordered_contenders(session)? {
            let path = join(&self.election_path, &name);
            let data = match session.read_data(&path) {
                Ok(data) => data,
                Err(LeadershipError::NotFound { .. }) => {
                    debug!("Participant {} vanished while listing", path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match decode(&data) {
                Ok(identity) => participants.push(identity),
                Err(e) => warn!("Skipping participant {}: {}", path, e),
            }
        }
        Ok(participants)
    }

    fn ordered_contenders(&self, session: &dyn Session) -> Result<Vec<String>> {
        match session.list_children(&self.election_path) {
            Ok(children) => Ok(contenders_in_order(children)),
            Err(LeadershipError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
