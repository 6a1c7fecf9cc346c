//! CDR Types - Core types for the cluster deployment registry
//!
//! The registry resolves a resource name plus an optional loading context to a
//! deployed unit, and keeps that resolution consistent across the nodes of a
//! cluster.
//!
//! ## Key Concepts
//!
//! - **DeploymentMode**: sharing (`Shared`, `Continuous`) or isolation
//!   (`Private`, `Isolated`) semantics for a node
//! - **DeploymentMetadata**: one resolution request
//! - **DeploymentUnit**: a deployed resource set with a reference-counted
//!   lifecycle
//! - **Participants**: which node uses which context id for a shared unit

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod ids;
pub mod metadata;
pub mod mode;
pub mod participants;
pub mod resource;
pub mod unit;

// Re-export main types
pub use ids::{ContextId, NodeId, RequestId};
pub use metadata::{DeploymentMetadata, NodeFilter};
pub use mode::{DeploymentMode, ParseModeError};
pub use participants::{ParticipantMap, Participants};
pub use resource::{
    DeployedResource, LoadingContext, ResourceBundle, ResourceHandle, ResourceKind, ResourceMap,
};
pub use unit::{DeploymentUnit, DeploymentUnitBuilder, ObsoleteHook, UnitOrigin, UnitState};
