//! Cluster health checks
//!
//! Checks report problems as `Condition` values rather than errors, so a
//! caller can persist them next to the resource they describe.

pub mod etcd;

pub use etcd::{
    can_scale_down, check_etcd, etcd_status, optimal_members, quorum, EtcdCheckOptions,
    EtcdMemberStatus, EtcdStatusError, EtcdStatusResult, ScaleDownDenied,
};

use keelson_common::{ConditionReason, ConditionRecord, ConditionStatus, Severity};
use std::fmt;

/// Outcome of a failed check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Error {
        reason: ConditionReason,
        interrupt: bool,
        message: String,
    },
    Warning {
        reason: ConditionReason,
        interrupt: bool,
        message: String,
    },
}

impl Condition {
    pub fn error(reason: ConditionReason, message: impl Into<String>) -> Self {
        Condition::Error {
            reason,
            interrupt: false,
            message: message.into(),
        }
    }

    pub fn warning(reason: ConditionReason, message: impl Into<String>) -> Self {
        Condition::Warning {
            reason,
            interrupt: false,
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Condition::Error { .. } => Severity::Error,
            Condition::Warning { .. } => Severity::Warning,
        }
    }

    /// Any reported condition means not ready
    pub fn status(&self) -> ConditionStatus {
        ConditionStatus::NotReady
    }

    pub fn reason(&self) -> ConditionReason {
        match self {
            Condition::Error { reason, .. } | Condition::Warning { reason, .. } => *reason,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Condition::Error { message, .. } | Condition::Warning { message, .. } => message,
        }
    }

    /// Whether the condition should stop an in-flight operation
    pub fn interrupt(&self) -> bool {
        match self {
            Condition::Error { interrupt, .. } | Condition::Warning { interrupt, .. } => *interrupt,
        }
    }

    pub fn to_record(&self) -> ConditionRecord {
        ConditionRecord {
            reason: self.reason(),
            status: self.status(),
            severity: self.severity(),
            interrupt: self.interrupt(),
            message: self.message().to_string(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
