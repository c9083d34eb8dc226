use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, VigilError};

/// Per-replica configuration.
///
/// Timing fields are fractional seconds so tests can run whole clusters with
/// sub-second leases.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Election rank; the replica at index `self_id - 1` of the membership
    /// list. Lower ids win elections.
    pub self_id: u64,
    pub self_host: String,
    pub self_port: u16,
    /// Ordered membership, including self. Empty means standalone.
    #[serde(default)]
    pub initial_replica_addresses: Vec<String>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: f64,
    #[serde(default = "default_lease_timeout_s")]
    pub lease_timeout_s: f64,
    #[serde(default)]
    pub initial_leader: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("vigil.db")
}

fn default_heartbeat_interval_s() -> f64 {
    3.0
}

fn default_lease_timeout_s() -> f64 {
    10.0
}

impl ServerConfig {
    pub fn self_address(&self) -> String {
        format!("{}:{}", self.self_host, self.self_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_s)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.lease_timeout_s)
    }

    /// Membership this replica starts from: the configured list, or just
    /// itself when none was given.
    pub fn initial_replicas(&self) -> Vec<String> {
        if self.initial_replica_addresses.is_empty() {
            vec![self.self_address()]
        } else {
            self.initial_replica_addresses.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.self_id == 0 {
            return Err(VigilError::Internal("self_id must be >= 1".into()));
        }
        if self.heartbeat_interval_s <= 0.0 {
            return Err(VigilError::Internal(
                "heartbeat_interval_s must be positive".into(),
            ));
        }
        // The lease must survive a couple of dropped heartbeats, or followers
        // will call elections against a healthy leader.
        if self.lease_timeout_s < 3.0 * self.heartbeat_interval_s {
            return Err(VigilError::Internal(format!(
                "lease_timeout_s ({}) must be >= 3x heartbeat_interval_s ({})",
                self.lease_timeout_s, self.heartbeat_interval_s
            )));
        }
        if !self.initial_replica_addresses.is_empty() {
            let idx = (self.self_id - 1) as usize;
            match self.initial_replica_addresses.get(idx) {
                Some(addr) if *addr == self.self_address() => {}
                _ => {
                    return Err(VigilError::Internal(format!(
                        "initial_replica_addresses[{}] must be self address {}",
                        idx,
                        self.self_address()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Client runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub preferred_leader_address: String,
    #[serde(default)]
    pub fallback_addresses: Vec<String>,
    #[serde(default = "default_rpc_timeout_s")]
    pub rpc_timeout_s: f64,
    #[serde(default = "default_fallback_timeout_s")]
    pub fallback_timeout_s: f64,
    #[serde(default = "default_leader_lookup_timeout_s")]
    pub overall_leader_lookup_timeout_s: f64,
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: f64,
    #[serde(default = "default_client_heartbeat_interval_s")]
    pub client_heartbeat_interval_s: f64,
    #[serde(default = "default_green_threshold")]
    pub green_threshold: f64,
    #[serde(default = "default_amber_threshold")]
    pub amber_threshold: f64,
}

fn default_rpc_timeout_s() -> f64 {
    10.0
}

fn default_fallback_timeout_s() -> f64 {
    1.0
}

fn default_leader_lookup_timeout_s() -> f64 {
    6.0
}

fn default_retry_delay_s() -> f64 {
    1.0
}

fn default_client_heartbeat_interval_s() -> f64 {
    5.0
}

fn default_green_threshold() -> f64 {
    0.30
}

fn default_amber_threshold() -> f64 {
    0.60
}

impl ClientConfig {
    pub fn new(preferred_leader_address: impl Into<String>) -> Self {
        Self {
            preferred_leader_address: preferred_leader_address.into(),
            fallback_addresses: Vec::new(),
            rpc_timeout_s: default_rpc_timeout_s(),
            fallback_timeout_s: default_fallback_timeout_s(),
            overall_leader_lookup_timeout_s: default_leader_lookup_timeout_s(),
            retry_delay_s: default_retry_delay_s(),
            client_heartbeat_interval_s: default_client_heartbeat_interval_s(),
            green_threshold: default_green_threshold(),
            amber_threshold: default_amber_threshold(),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.rpc_timeout_s)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fallback_timeout_s)
    }

    pub fn leader_lookup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.overall_leader_lookup_timeout_s)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_s)
    }

    pub fn client_heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.client_heartbeat_interval_s)
    }
}
