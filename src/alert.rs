//! Leader-side alert delivery for RED reports.

use async_trait::async_trait;

use crate::error::Result;
use crate::store::RiskReport;

/// External collaborator notified when the leader commits a RED report.
///
/// Delivery failures are logged and never fail the client write; the row's
/// alert flag stays unset so the failure is visible.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, report: &RiskReport) -> Result<()>;
}

/// Default sink: a structured warning on the server log.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, report: &RiskReport) -> Result<()> {
        tracing::warn!(
            patient_id = %report.patient_id,
            timestamp = report.timestamp,
            probability = report.probability,
            "RED risk detected, immediate attention required"
        );
        Ok(())
    }
}
