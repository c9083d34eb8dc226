//! Replication payloads.
//!
//! On the wire an operation is `{operation_type, data}` with a JSON body kept
//! as a string for forward compatibility; in process it is a tagged enum.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};
use crate::proto::ReplicateOperationRequest;
use crate::store::RiskReport;

pub const OP_RISK_REPORT: &str = "risk_report";
pub const OP_MEMBERSHIP_UPDATE: &str = "membership_update";

/// An operation the leader fans out to followers.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    RiskReport(RiskReport),
    MembershipUpdate {
        replicas: Vec<String>,
        leader_address: String,
    },
}

#[derive(Serialize, Deserialize)]
struct MembershipBody {
    replicas: Vec<String>,
    leader_address: String,
}

impl Operation {
    pub fn operation_type(&self) -> &'static str {
        match self {
            Operation::RiskReport(_) => OP_RISK_REPORT,
            Operation::MembershipUpdate { .. } => OP_MEMBERSHIP_UPDATE,
        }
    }

    pub fn to_wire(&self) -> Result<ReplicateOperationRequest> {
        let data = match self {
            Operation::RiskReport(report) => serde_json::to_string(report),
            Operation::MembershipUpdate {
                replicas,
                leader_address,
            } => serde_json::to_string(&MembershipBody {
                replicas: replicas.clone(),
                leader_address: leader_address.clone(),
            }),
        }
        .map_err(|e| VigilError::Internal(format!("encoding replication payload: {e}")))?;

        Ok(ReplicateOperationRequest {
            operation_type: self.operation_type().to_string(),
            data,
        })
    }

    pub fn from_wire(operation_type: &str, data: &str) -> Result<Self> {
        match operation_type {
            OP_RISK_REPORT => {
                let report: RiskReport = serde_json::from_str(data).map_err(|e| {
                    VigilError::MalformedInput(format!("risk_report payload: {e}"))
                })?;
                Ok(Operation::RiskReport(report))
            }
            OP_MEMBERSHIP_UPDATE => {
                let body: MembershipBody = serde_json::from_str(data).map_err(|e| {
                    VigilError::MalformedInput(format!("membership_update payload: {e}"))
                })?;
                Ok(Operation::MembershipUpdate {
                    replicas: body.replicas,
                    leader_address: body.leader_address,
                })
            }
            other => Err(VigilError::MalformedInput(format!(
                "unknown operation_type {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Tier;

    #[test]
    fn test_risk_report_envelope_round_trip() {
        let op = Operation::RiskReport(RiskReport {
            patient_id: "P1".to_string(),
            timestamp: 1000,
            age: 72.0,
            serum_sodium: 134.0,
            serum_creatinine: 1.9,
            ejection_fraction: 30.0,
            day: 4,
            probability: 0.81,
            tier: Tier::Red,
            alert_sent: false,
        });

        let wire = op.to_wire().unwrap();
        assert_eq!(wire.operation_type, "risk_report");

        let decoded = Operation::from_wire(&wire.operation_type, &wire.data).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_membership_envelope_round_trip() {
        let op = Operation::MembershipUpdate {
            replicas: vec!["127.0.0.1:50051".to_string(), "127.0.0.1:50052".to_string()],
            leader_address: "127.0.0.1:50051".to_string(),
        };

        let wire = op.to_wire().unwrap();
        assert_eq!(wire.operation_type, "membership_update");
        assert_eq!(Operation::from_wire(&wire.operation_type, &wire.data).unwrap(), op);
    }

    #[test]
    fn test_unknown_operation_type_is_rejected() {
        let err = Operation::from_wire("update_alert_sent", "{}").unwrap_err();
        assert!(matches!(err, VigilError::MalformedInput(_)));
    }

    #[test]
    fn test_garbled_payload_is_rejected() {
        let err = Operation::from_wire(OP_RISK_REPORT, "not json").unwrap_err();
        assert!(matches!(err, VigilError::MalformedInput(_)));
    }
}
