//! CDR Store - Deployment unit storage strategies
//!
//! Three stores sit behind one [`DeploymentStore`] contract:
//!
//! - [`LocalStore`]: units from the node's own resource path, keyed by alias
//! - [`ContextStore`]: isolation-mode units, one per loading context
//! - [`VersionStore`]: sharing-mode units, one per alias and user version
//!
//! Stores synchronize per key only. Remote fetches run without any map lock
//! held and concurrent fetches for one key share a single request.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod context;
pub mod error;
mod inflight;
pub mod local;
pub mod provider;
pub mod store;
pub mod version;

// Re-exports
pub use context::ContextStore;
pub use error::{Result, StoreError};
pub use local::LocalStore;
pub use provider::{content_version, InMemoryResourceProvider, ProvidedResource, ResourceProvider};
pub use store::{DeploymentStore, StoreKind};
pub use version::{VersionKey, VersionStore};
