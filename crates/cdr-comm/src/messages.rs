//! Wire messages exchanged between registries
//!
//! Framing and encoding belong to the transport; these only derive serde.

use cdr_types::{ContextId, RequestId, ResourceBundle};
use serde::{Deserialize, Serialize};

/// Ask a node for the content of the unit behind `context_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub request_id: RequestId,
    pub context_id: ContextId,
    pub resource_name: String,
}

/// Messages of the deployment protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentMessage {
    FetchRequest(FetchRequest),
    FetchResponse {
        request_id: RequestId,
        result: Result<ResourceBundle, String>,
    },
    UndeployNotice {
        resource_name: String,
    },
}

impl DeploymentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentMessage::FetchRequest(_) => "fetch_request",
            DeploymentMessage::FetchResponse { .. } => "fetch_response",
            DeploymentMessage::UndeployNotice { .. } => "undeploy_notice",
        }
    }
}
