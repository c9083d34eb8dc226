//! Replica role, leadership epoch, and membership.
//!
//! All transitions are pure functions over this struct; the node wraps it in
//! an `RwLock` and never holds the lock across IO.

/// Role a replica plays at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// What a received heartbeat did to the local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Accepted; lease renewed.
    Accepted,
    /// Accepted and this replica stepped down from leadership.
    SteppedDown,
    /// Ignored: sender's epoch is behind, or it lost the id tie-break.
    Stale,
}

/// Process-local cluster view.
///
/// Membership is the ordered address list including self; the replica at
/// index `i` has id `i + 1`, so the list order is the election rank order.
#[derive(Debug)]
pub struct ClusterState {
    pub self_id: u64,
    pub self_address: String,
    pub role: Role,
    /// Bumped on every leadership assumption; carried on heartbeats.
    pub epoch: u64,
    pub leader_id: Option<u64>,
    pub leader_address: Option<String>,
    pub replicas: Vec<String>,
}

impl ClusterState {
    pub fn new(self_id: u64, self_address: String, replicas: Vec<String>, leader: bool) -> Self {
        let mut state = Self {
            self_id,
            self_address,
            role: Role::Follower,
            epoch: 0,
            leader_id: None,
            leader_address: None,
            replicas,
        };
        if leader {
            state.become_leader();
        }
        state
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Assume leadership: install self as leader and open a new epoch.
    pub fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.epoch += 1;
        self.leader_id = Some(self.self_id);
        self.leader_address = Some(self.self_address.clone());
    }

    /// Accept a heartbeat from `leader_id` at `leader_address` with `epoch`.
    ///
    /// Epoch ordering decides between dueling leaders; equal epochs fall back
    /// to the lowest-id rule.
    pub fn observe_heartbeat(
        &mut self,
        leader_id: u64,
        leader_address: &str,
        epoch: u64,
    ) -> HeartbeatOutcome {
        if epoch < self.epoch {
            return HeartbeatOutcome::Stale;
        }
        let outcome = if self.role == Role::Leader {
            if epoch > self.epoch || leader_id < self.self_id {
                self.role = Role::Follower;
                HeartbeatOutcome::SteppedDown
            } else {
                // Same epoch, higher id: the sender loses the tie-break.
                return HeartbeatOutcome::Stale;
            }
        } else {
            HeartbeatOutcome::Accepted
        };

        self.epoch = epoch;
        self.leader_id = Some(leader_id);
        self.leader_address = Some(leader_address.to_string());
        outcome
    }

    /// Addresses of peers whose id ranks below ours: the set an election must
    /// fail to reach before we may lead.
    pub fn lower_peers(&self) -> Vec<String> {
        let upto = (self.self_id as usize).saturating_sub(1).min(self.replicas.len());
        self.replicas[..upto]
            .iter()
            .filter(|addr| **addr != self.self_address)
            .cloned()
            .collect()
    }

    /// Every member except self; heartbeat and replication targets.
    pub fn follower_addresses(&self) -> Vec<String> {
        self.replicas
            .iter()
            .filter(|addr| **addr != self.self_address)
            .cloned()
            .collect()
    }

    /// Append a joiner at the tail (next id). Idempotent.
    pub fn add_replica(&mut self, address: &str) -> bool {
        if self.replicas.iter().any(|addr| addr == address) {
            return false;
        }
        self.replicas.push(address.to_string());
        true
    }

    /// Adopt a membership list broadcast by the leader.
    pub fn replace_replicas(&mut self, replicas: Vec<String>, leader_address: Option<String>) {
        self.replicas = replicas;
        if let Some(addr) = leader_address {
            self.leader_address = Some(addr);
        }
    }
}
