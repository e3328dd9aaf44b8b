//! Manual gate bookkeeping for `when: manual` jobs.

use crate::ids::InstanceKey;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Waiting,
    Approved,
    /// The run finished before anyone approved.
    Abandoned,
}

/// A manual gate held by the scheduler for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ManualGate {
    pub key: InstanceKey,
    pub status: GateStatus,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
}

impl ManualGate {
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            status: GateStatus::Waiting,
            requested_at: Utc::now(),
            approved_at: None,
            approved_by: None,
        }
    }

    /// Approve the gate. Returns false if it was not waiting.
    pub fn approve(&mut self, approver: Option<String>) -> bool {
        if self.status != GateStatus::Waiting {
            return false;
        }
        self.status = GateStatus::Approved;
        self.approved_at = Some(Utc::now());
        self.approved_by = approver;
        true
    }

    pub fn abandon(&mut self) {
        if self.status == GateStatus::Waiting {
            self.status = GateStatus::Abandoned;
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.status == GateStatus::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approve_once() {
        let mut gate = ManualGate::new(InstanceKey::new("deploy"));
        assert!(gate.is_waiting());
        assert!(gate.approve(Some("alice".to_string())));
        assert!(!gate.approve(None));
        assert_eq!(gate.approved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_abandon_keeps_approved() {
        let mut gate = ManualGate::new(InstanceKey::new("deploy"));
        gate.approve(None);
        gate.abandon();
        assert_eq!(gate.status, GateStatus::Approved);
    }
}
