//! Leader-aware routing of redo entries across a cluster.
//!
//! Only the current write leader persists entries in its primary log.
//! Followers forward each entry to the leader over HTTP, and while no
//! leader is known entries are kept in a local staging log until one is
//! elected.
//!
//! ```text
//!                  ┌──────────── Leader ─────────────▶ local FileLogWriter
//! LeaderAwareWriter├──────────── Follower(id) ───────▶ HttpForwarder ──▶ POST /redolog
//!                  └──── Unknown / forward failed ───▶ LocalStagingWriter
//! ```

mod endpoint;
mod forwarder;
mod http;
mod router;
mod staging;

use std::fmt;

use parking_lot::{Mutex, RwLock};

pub use endpoint::{EndpointHandle, RedologEndpoint};
pub use forwarder::{HttpForwarder, LeaderDirectory, RemoteForwarder, StaticDirectory};
pub use http::HttpRequest;
pub use router::LeaderAwareWriter;
pub use staging::{DrainOutcome, DrainTarget, LocalStagingWriter};

/// Path of the leader-side redo endpoint.
pub const REDOLOG_PATH: &str = "/redolog";

/// Request header carrying the `synchronous` flag of a forwarded write.
pub const SYNC_HEADER: &str = "X-Redo-Synchronous";

/// Write leadership as seen by this node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LeadershipState {
    Leader,
    /// Another node leads; carries its session id.
    Follower(String),
    #[default]
    Unknown,
}

impl LeadershipState {
    /// Read the current state from an election collaborator.
    pub fn from_election(election: &dyn LeaderElection) -> Self {
        if election.is_leader() {
            return LeadershipState::Leader;
        }
        match election.leader_session_id() {
            Some(id) if !id.is_empty() => LeadershipState::Follower(id),
            _ => LeadershipState::Unknown,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader)
    }

    /// Whether entries have somewhere to go besides staging.
    pub fn leader_known(&self) -> bool {
        !matches!(self, LeadershipState::Unknown)
    }
}

impl fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadershipState::Leader => write!(f, "leader"),
            LeadershipState::Follower(id) => write!(f, "follower({})", id),
            LeadershipState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Listener registered with an election collaborator.
pub type LeadershipListener = Box<dyn Fn() + Send + Sync>;

/// External leader election, as consumed by the router.
pub trait LeaderElection: Send + Sync {
    /// Whether this node currently holds write leadership.
    fn is_leader(&self) -> bool;

    /// Session id of the current leader, if one is known.
    fn leader_session_id(&self) -> Option<String>;

    /// Register a listener invoked after every leadership change.
    ///
    /// Listeners may run on any thread and must return quickly.
    fn subscribe(&self, listener: LeadershipListener);
}

/// Election whose outcome is set by the embedding server.
///
/// Fits single-node deployments (always leader) and tests.
#[derive(Default)]
pub struct ManualElection {
    state: RwLock<LeadershipState>,
    listeners: Mutex<Vec<LeadershipListener>>,
}

impl ManualElection {
    pub fn new(initial: LeadershipState) -> Self {
        Self {
            state: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> LeadershipState {
        self.state.read().clone()
    }

    /// Change the state and notify every listener.
    pub fn set(&self, state: LeadershipState) {
        *self.state.write() = state;
        for listener in self.listeners.lock().iter() {
            listener();
        }
    }
}

impl LeaderElection for ManualElection {
    fn is_leader(&self) -> bool {
        self.state.read().is_leader()
    }

    fn leader_session_id(&self) -> Option<String> {
        match &*self.state.read() {
            LeadershipState::Follower(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn subscribe(&self, listener: LeadershipListener) {
        self.listeners.lock().push(listener);
    }
}
