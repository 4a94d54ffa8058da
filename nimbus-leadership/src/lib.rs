//! Master leader election on top of a hierarchical coordination service.
//!
//! Several master candidates, each identified by the `host:port` it serves on,
//! race to become the single active controller. Exactly one holds leadership
//! at a time; the rest wait as standby participants. Any process can resolve
//! the current leader or list every live candidate without contending.
//!
//! # Overview
//!
//! - **Sequential ephemeral nodes**: each contender creates one node under
//!   `<root>/nimbus/leadership`; the service removes it if the session dies
//! - **Creation order wins**: the live node with the lowest sequence number is
//!   the leader, regardless of listing order or clocks
//! - **No herd**: a waiting contender watches only its immediate predecessor
//! - **Ordered cleanup**: release deletes the node before closing the session
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nimbus_leadership::{LeaderElection, LeadershipConfig, ZooKeeperConnector};
//!
//! let config = LeadershipConfig::load()?;
//! let election = LeaderElection::new(&config, Arc::new(ZooKeeperConnector))?;
//!
//! // Blocks until this process is the leader
//! election.acquire()?;
//!
//! while election.is_leader() {
//!     // serve as the active master
//! }
//!
//! election.close();
//! ```
//!
//! # Leader Discovery
//!
//! ```ignore
//! use std::sync::Arc;
//! use nimbus_leadership::{LeadershipConfig, MembershipResolver, ZooKeeperConnector};
//!
//! let config = LeadershipConfig::load()?;
//! let resolver = MembershipResolver::new(&config, Arc::new(ZooKeeperConnector))?;
//!
//! if let Some(leader) = resolver.leader_address()? {
//!     println!("Leader at {}", leader);
//! }
//! for participant in resolver.participants()? {
//!     println!("Candidate {}", participant);
//! }
//! ```

pub mod address;
pub mod config;
pub mod coordination;
mod election;
mod error;
pub mod lifecycle;
mod membership;

pub use address::CandidateIdentity;
pub use config::LeadershipConfig;
pub use coordination::{
    ConnectOptions, Connector, MemoryEnsemble, NodeMode, Session, SessionState,
    ZooKeeperConnector,
};
pub use election::{ElectionState, LeaderElection, PayloadEncoder};
pub use error::{LeadershipError, Result};
pub use lifecycle::ManagedSession;
pub use membership::MembershipResolver;
