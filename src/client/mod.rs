//! Client runtime: leader discovery with parallel fallback probing, writes
//! with retry and an in-memory FIFO queue, and a background heartbeat that
//! keeps leader knowledge fresh and drains the queue.
//!
//! The producer of vitals and the model that scores them live outside this
//! crate; callers hand in a patient id, the five inputs, and a probability,
//! and this module classifies, stamps, and delivers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::ClientConfig;
use crate::error::{Result, VigilError};
use crate::proto::monitor_client::MonitorClient as MonitorRpcClient;
use crate::proto::{GetLeaderInfoRequest, ListRiskReportsRequest, RiskReportRequest, RiskReportResponse};
use crate::store::{RiskReport, Tier};

const SEND_ATTEMPTS: usize = 3;

/// The five measurements a report carries.
#[derive(Debug, Clone, Copy)]
pub struct Vitals {
    pub age: f64,
    pub serum_sodium: f64,
    pub serum_creatinine: f64,
    pub ejection_fraction: f64,
    pub day: i64,
}

/// What happened to a submitted report.
#[derive(Debug)]
pub enum SubmitOutcome {
    Sent { alert_sent: bool },
    /// Held in the retry queue; a later flush will deliver it.
    Queued,
    /// Client error; never retried.
    Rejected(VigilError),
}

struct ClientInner {
    leader_address: String,
    /// Preferred address plus every fallback and every replica the cluster
    /// has advertised since.
    known_addresses: Vec<String>,
    queue: VecDeque<RiskReport>,
}

pub struct MonitorClient {
    config: ClientConfig,
    inner: Mutex<ClientInner>,
}

impl MonitorClient {
    pub fn new(config: ClientConfig) -> Self {
        let mut known_addresses = vec![config.preferred_leader_address.clone()];
        for addr in &config.fallback_addresses {
            if !known_addresses.contains(addr) {
                known_addresses.push(addr.clone());
            }
        }
        Self {
            inner: Mutex::new(ClientInner {
                leader_address: config.preferred_leader_address.clone(),
                known_addresses,
                queue: VecDeque::new(),
            }),
            config,
        }
    }

    /// Classify a model probability into a tier. Thresholds are inclusive
    /// lower bounds: 0.30 is AMBER, 0.60 is RED.
    pub fn classify(&self, probability: f64) -> Tier {
        if probability < self.config.green_threshold {
            Tier::Green
        } else if probability < self.config.amber_threshold {
            Tier::Amber
        } else {
            Tier::Red
        }
    }

    /// Stamp and classify a report. GREEN results stay with the caller and
    /// never travel to the cluster.
    pub fn prepare_report(
        &self,
        patient_id: &str,
        vitals: &Vitals,
        probability: f64,
    ) -> Option<RiskReport> {
        let tier = self.classify(probability);
        if tier == Tier::Green {
            return None;
        }
        Some(RiskReport {
            patient_id: patient_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            age: vitals.age,
            serum_sodium: vitals.serum_sodium,
            serum_creatinine: vitals.serum_creatinine,
            ejection_fraction: vitals.ejection_fraction,
            day: vitals.day,
            probability,
            tier,
            alert_sent: false,
        })
    }

    /// Deliver one report, retrying through leader changes; on persistent
    /// failure the report is parked in the retry queue.
    pub async fn submit(&self, report: RiskReport) -> SubmitOutcome {
        match self.try_send(&report).await {
            Ok(alert_sent) => SubmitOutcome::Sent { alert_sent },
            Err(e) if !e.is_retriable() => SubmitOutcome::Rejected(e),
            Err(e) => {
                tracing::debug!(
                    patient_id = %report.patient_id,
                    error = %e,
                    "report queued for retry"
                );
                self.inner.lock().await.queue.push_back(report);
                SubmitOutcome::Queued
            }
        }
    }

    /// Drain the retry queue FIFO. Duplicates are harmless: the cluster
    /// deduplicates on `(patient_id, timestamp)`.
    pub async fn flush(&self) -> usize {
        let pending: Vec<RiskReport> = {
            let mut inner = self.inner.lock().await;
            inner.queue.drain(..).collect()
        };
        if pending.is_empty() {
            return 0;
        }

        tracing::debug!(pending = pending.len(), "flushing queued reports");
        let mut sent = 0;
        for report in pending {
            match self.try_send(&report).await {
                Ok(_) => sent += 1,
                Err(e) if !e.is_retriable() => {
                    tracing::warn!(
                        patient_id = %report.patient_id,
                        error = %e,
                        "dropping rejected queued report"
                    );
                }
                Err(_) => self.inner.lock().await.queue.push_back(report),
            }
        }
        sent
    }

    pub async fn queued(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Most recent `count` reports for a patient (0 = all), served by the
    /// current leader.
    pub async fn list_reports(&self, patient_id: &str, count: u32) -> Result<Vec<RiskReport>> {
        let addr = self.current_leader().await;
        let mut client = rpc_client(&addr)?;
        let request = ListRiskReportsRequest {
            patient_id: patient_id.to_string(),
            count,
        };
        let response = timeout(self.config.rpc_timeout(), client.list_risk_reports(request))
            .await
            .map_err(|_| VigilError::DeadlineExpired)??
            .into_inner();
        if !response.success {
            return Err(VigilError::Internal(response.message));
        }
        response
            .reports
            .into_iter()
            .map(|row| {
                if row.inputs.len() != 5 {
                    return Err(VigilError::MalformedInput(format!(
                        "expected 5 inputs, got {}",
                        row.inputs.len()
                    )));
                }
                Ok(RiskReport {
                    patient_id: row.patient_id,
                    timestamp: row.timestamp,
                    age: row.inputs[0],
                    serum_sodium: row.inputs[1],
                    serum_creatinine: row.inputs[2],
                    ejection_fraction: row.inputs[3],
                    day: row.inputs[4] as i64,
                    probability: row.probability,
                    tier: row.tier.parse()?,
                    alert_sent: row.alert_sent,
                })
            })
            .collect()
    }

    /// Background heartbeat: refresh leader knowledge and drain the queue at
    /// `client_heartbeat_interval`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.config.client_heartbeat_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.refresh_leader().await {
                        tracing::debug!(error = %e, "leader refresh failed");
                    }
                    if self.queued().await > 0 {
                        let sent = self.flush().await;
                        if sent > 0 {
                            tracing::info!(sent, "delivered queued reports");
                        }
                    }
                }
            }
        }
    }

    pub async fn current_leader(&self) -> String {
        self.inner.lock().await.leader_address.clone()
    }

    /// Ask the current leader who leads; fall back to a full probe when it
    /// does not answer convincingly.
    pub async fn refresh_leader(&self) -> Result<String> {
        let addr = self.current_leader().await;
        match probe_leader(addr, self.config.rpc_timeout()).await {
            Some((leader, replicas)) => {
                self.adopt_leader(leader.clone(), replicas).await;
                Ok(leader)
            }
            None => self.locate_leader().await,
        }
    }

    /// Probe every known address in parallel under one overall deadline and
    /// adopt the first leader reported.
    pub async fn locate_leader(&self) -> Result<String> {
        let addrs = self.inner.lock().await.known_addresses.clone();
        let (tx, mut rx) = mpsc::channel(addrs.len().max(1));
        let probe_deadline = self.config.fallback_timeout();

        for addr in addrs {
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(found) = probe_leader(addr, probe_deadline).await {
                    let _ = tx.send(found).await;
                }
            });
        }
        drop(tx);

        match timeout(self.config.leader_lookup_timeout(), rx.recv()).await {
            Ok(Some((leader, replicas))) => {
                tracing::info!(leader = %leader, "leader located");
                self.adopt_leader(leader.clone(), replicas).await;
                Ok(leader)
            }
            _ => {
                tracing::warn!("leader lookup failed");
                Err(VigilError::DeadlineExpired)
            }
        }
    }

    async fn adopt_leader(&self, leader: String, replicas: Vec<String>) {
        let mut inner = self.inner.lock().await;
        inner.leader_address = leader;
        for addr in replicas {
            if !inner.known_addresses.contains(&addr) {
                inner.known_addresses.push(addr);
            }
        }
    }

    async fn try_send(&self, report: &RiskReport) -> Result<bool> {
        let mut last_error = VigilError::DeadlineExpired;
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                sleep(self.config.retry_delay()).await;
            }
            let addr = self.current_leader().await;
            match self.send_once(&addr, report).await {
                Ok(response) if response.success => return Ok(response.alert_sent),
                Ok(response) => {
                    let failure = classify_failure(&response.message);
                    if !failure.is_retriable() {
                        return Err(failure);
                    }
                    if let VigilError::NotLeader(Some(hint)) = &failure {
                        self.adopt_leader(hint.clone(), Vec::new()).await;
                    } else {
                        let _ = self.locate_leader().await;
                    }
                    last_error = failure;
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "send failed");
                    let _ = self.locate_leader().await;
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn send_once(&self, addr: &str, report: &RiskReport) -> Result<RiskReportResponse> {
        let mut client = rpc_client(addr)?;
        let request = RiskReportRequest {
            patient_id: report.patient_id.clone(),
            timestamp: report.timestamp,
            inputs: vec![
                report.age,
                report.serum_sodium,
                report.serum_creatinine,
                report.ejection_fraction,
                report.day as f64,
            ],
            probability: report.probability,
            tier: report.tier.to_string(),
        };
        let response = timeout(self.config.rpc_timeout(), client.send_risk_report(request))
            .await
            .map_err(|_| VigilError::DeadlineExpired)??;
        Ok(response.into_inner())
    }
}

fn rpc_client(addr: &str) -> Result<MonitorRpcClient<Channel>> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|_| VigilError::InvalidAddress(addr.to_string()))?;
    Ok(MonitorRpcClient::new(endpoint.connect_lazy()))
}

async fn probe_leader(addr: String, deadline: Duration) -> Option<(String, Vec<String>)> {
    let mut client = rpc_client(&addr).ok()?;
    let response = timeout(deadline, client.get_leader_info(GetLeaderInfoRequest {}))
        .await
        .ok()?
        .ok()?
        .into_inner();
    if response.success && !response.leader_address.is_empty() {
        Some((response.leader_address, response.replica_addresses))
    } else {
        None
    }
}

/// Map an in-band failure message back onto the error taxonomy. Validation
/// failures must not be retried; everything else is leadership churn.
fn classify_failure(message: &str) -> VigilError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("tier") {
        VigilError::InvalidTier(message.to_string())
    } else if lower.contains("malformed") {
        VigilError::MalformedInput(message.to_string())
    } else if lower.contains("not the leader") {
        let hint = message
            .split_once("try ")
            .map(|(_, addr)| addr.trim().to_string());
        VigilError::NotLeader(hint)
    } else {
        VigilError::Internal(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MonitorClient {
        MonitorClient::new(ClientConfig::new("127.0.0.1:50051"))
    }

    #[test]
    fn test_classification_thresholds_are_inclusive() {
        let client = client();
        assert_eq!(client.classify(0.0), Tier::Green);
        assert_eq!(client.classify(0.29), Tier::Green);
        assert_eq!(client.classify(0.30), Tier::Amber);
        assert_eq!(client.classify(0.59), Tier::Amber);
        assert_eq!(client.classify(0.60), Tier::Red);
        assert_eq!(client.classify(1.0), Tier::Red);
    }

    #[test]
    fn test_green_reports_stay_local() {
        let client = client();
        let vitals = Vitals {
            age: 55.0,
            serum_sodium: 140.0,
            serum_creatinine: 0.9,
            ejection_fraction: 60.0,
            day: 3,
        };
        assert!(client.prepare_report("P1", &vitals, 0.1).is_none());

        let report = client.prepare_report("P1", &vitals, 0.75).unwrap();
        assert_eq!(report.tier, Tier::Red);
        assert!(report.timestamp > 0);
    }

    #[test]
    fn test_failure_classification() {
        assert!(!classify_failure("invalid tier \"GREEN\"").is_retriable());
        assert!(!classify_failure("malformed report: empty patient_id").is_retriable());

        let not_leader = classify_failure("not the leader, try 127.0.0.1:50052");
        assert!(not_leader.is_retriable());
        assert!(matches!(
            not_leader,
            VigilError::NotLeader(Some(ref addr)) if addr == "127.0.0.1:50052"
        ));

        assert!(classify_failure("unavailable: storage failed").is_retriable());
    }

    #[tokio::test]
    async fn test_fallback_addresses_are_merged_without_duplicates() {
        let mut config = ClientConfig::new("127.0.0.1:50051");
        config.fallback_addresses = vec![
            "127.0.0.1:50051".to_string(),
            "127.0.0.1:50052".to_string(),
        ];
        let client = MonitorClient::new(config);

        client
            .adopt_leader(
                "127.0.0.1:50052".to_string(),
                vec!["127.0.0.1:50052".to_string(), "127.0.0.1:50053".to_string()],
            )
            .await;

        let inner = client.inner.lock().await;
        assert_eq!(inner.leader_address, "127.0.0.1:50052");
        assert_eq!(
            inner.known_addresses,
            vec!["127.0.0.1:50051", "127.0.0.1:50052", "127.0.0.1:50053"]
        );
    }
}
