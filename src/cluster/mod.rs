pub mod election;
pub mod join;
pub mod node;
pub mod replicate;
pub mod state;

pub use node::ReplicaNode;
pub use replicate::Operation;
pub use state::{ClusterState, HeartbeatOutcome, Role};
