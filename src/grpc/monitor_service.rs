//! Client-facing API. Domain failures are reported in-band with
//! `success = false` so clients can act on the message; only transport-level
//! problems surface as gRPC status codes.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::cluster::ReplicaNode;
use crate::error::VigilError;
use crate::proto::monitor_server::Monitor;
use crate::proto::{
    GetLeaderInfoRequest, GetLeaderInfoResponse, ListRiskReportsRequest, ListRiskReportsResponse,
    ReportRow, RiskReportRequest, RiskReportResponse,
};
use crate::store::{RiskReport, Tier};

pub struct MonitorService {
    node: Arc<ReplicaNode>,
}

impl MonitorService {
    pub fn new(node: Arc<ReplicaNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl Monitor for MonitorService {
    async fn send_risk_report(
        &self,
        request: Request<RiskReportRequest>,
    ) -> Result<Response<RiskReportResponse>, Status> {
        let report = match decode_report(request.into_inner()) {
            Ok(report) => report,
            Err(e) => return Ok(Response::new(failure(&e))),
        };

        match self.node.submit_report(report).await {
            Ok(alert_sent) => Ok(Response::new(RiskReportResponse {
                success: true,
                message: "risk report stored".to_string(),
                alert_sent,
            })),
            Err(e) => Ok(Response::new(failure(&e))),
        }
    }

    async fn list_risk_reports(
        &self,
        request: Request<ListRiskReportsRequest>,
    ) -> Result<Response<ListRiskReportsResponse>, Status> {
        let req = request.into_inner();
        if req.patient_id.is_empty() {
            return Ok(Response::new(ListRiskReportsResponse {
                success: false,
                message: "patient_id is required".to_string(),
                reports: Vec::new(),
            }));
        }

        match self
            .node
            .store()
            .list_by_patient(req.patient_id, req.count)
            .await
        {
            Ok(reports) => Ok(Response::new(ListRiskReportsResponse {
                success: true,
                message: String::new(),
                reports: reports.iter().map(report_to_row).collect(),
            })),
            Err(e) => {
                tracing::error!(error = %e, "query failed");
                Ok(Response::new(ListRiskReportsResponse {
                    success: false,
                    message: "unavailable: query failed".to_string(),
                    reports: Vec::new(),
                }))
            }
        }
    }

    async fn get_leader_info(
        &self,
        _request: Request<GetLeaderInfoRequest>,
    ) -> Result<Response<GetLeaderInfoResponse>, Status> {
        let state = self.node.state.read().await;
        Ok(Response::new(GetLeaderInfoResponse {
            success: state.leader_address.is_some(),
            leader_address: state.leader_address.clone().unwrap_or_default(),
            replica_addresses: state.replicas.clone(),
        }))
    }
}

fn decode_report(req: RiskReportRequest) -> crate::error::Result<RiskReport> {
    let tier: Tier = req.tier.parse()?;
    if req.inputs.len() != 5 {
        return Err(VigilError::MalformedInput(format!(
            "expected 5 inputs, got {}",
            req.inputs.len()
        )));
    }
    let report = RiskReport {
        patient_id: req.patient_id,
        timestamp: req.timestamp,
        age: req.inputs[0],
        serum_sodium: req.inputs[1],
        serum_creatinine: req.inputs[2],
        ejection_fraction: req.inputs[3],
        day: req.inputs[4] as i64,
        probability: req.probability,
        tier,
        alert_sent: false,
    };
    report.validate()?;
    Ok(report)
}

fn report_to_row(report: &RiskReport) -> ReportRow {
    ReportRow {
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
        alert_sent: report.alert_sent,
    }
}

fn failure(e: &VigilError) -> RiskReportResponse {
    let message = match e {
        VigilError::NotLeader(Some(addr)) => format!("not the leader, try {addr}"),
        VigilError::NotLeader(None) => "not the leader, leader unknown".to_string(),
        VigilError::Storage(_) => "unavailable: storage failed".to_string(),
        other => other.to_string(),
    };
    RiskReportResponse {
        success: false,
        message,
        alert_sent: false,
    }
}
