//! The remote-command gate.
//!
//! Operator consoles submit engine-bound commands over the wire. Only an
//! allow-listed set of request shapes is accepted, and the self-service
//! ones must target the submitting operator's own identity. Everything
//! else is rejected before it can become an action.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::action::Action;
use crate::chat::Locale;
use crate::operator::{OperatorId, OperatorStatus};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("unrecognized remote request: {0}")]
    Unrecognized(String),
    #[error("operator {submitted_by} may not modify operator {target}")]
    NotOwnIdentity {
        submitted_by: OperatorId,
        target: OperatorId,
    },
}

/// Requests a connected operator may submit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteRequest {
    #[serde(rename_all = "camelCase")]
    SetCapacity {
        operator_id: OperatorId,
        locale: Locale,
        capacity: u32,
    },
    #[serde(rename_all = "camelCase")]
    SetStatus {
        operator_id: OperatorId,
        status: OperatorStatus,
    },
    #[serde(rename_all = "camelCase")]
    SetRequestingChat {
        operator_id: OperatorId,
        requesting: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetAcceptsCustomers { accepts: bool },
}

impl RemoteRequest {
    pub fn parse(payload: &Value) -> Result<Self, RemoteError> {
        serde_json::from_value(payload.clone()).map_err(|_| {
            let kind = payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("<missing type>");
            RemoteError::Unrecognized(kind.to_string())
        })
    }

    /// Self-service requests may only target the submitter; toggling
    /// customer intake is open to any operator.
    pub fn authorize(&self, submitted_by: &OperatorId) -> Result<(), RemoteError> {
        let target = match self {
            Self::SetCapacity { operator_id, .. }
            | Self::SetStatus { operator_id, .. }
            | Self::SetRequestingChat { operator_id, .. } => operator_id,
            Self::SetAcceptsCustomers { .. } => return Ok(()),
        };
        if target == submitted_by {
            Ok(())
        } else {
            Err(RemoteError::NotOwnIdentity {
                submitted_by: submitted_by.clone(),
                target: target.clone(),
            })
        }
    }

    pub fn into_action(self) -> Action {
        match self {
            Self::SetCapacity {
                operator_id,
                locale,
                capacity,
            } => Action::SetOperatorCapacity {
                operator_id,
                locale,
                capacity,
            },
            Self::SetStatus {
                operator_id,
                status,
            } => Action::SetOperatorStatus {
                operator_id,
                status,
            },
            Self::SetRequestingChat {
                operator_id,
                requesting,
            } => Action::SetOperatorRequestingChat {
                operator_id,
                requesting,
            },
            Self::SetAcceptsCustomers { accepts } => Action::SetAcceptsCustomers { accepts },
        }
    }
}
