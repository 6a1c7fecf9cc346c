//! CDR Registry - Cluster deployment registry
//!
//! The registry resolves code and resources for task execution across a
//! cluster. Requests are routed by deployment mode:
//!
//! - Private and Isolated: one unit per loading context, fetched from the
//!   node that originated the execution
//! - Shared and Continuous: one unit per alias and user version, reused from
//!   the local resource path when compatible
//!
//! # Example
//!
//! ```rust,ignore
//! use cdr_registry::{DeploymentRegistryBuilder, RegistryConfig};
//!
//! let config = RegistryConfig::load(Some("cdr.toml"))?;
//! cdr_registry::init_tracing(&config.logging);
//!
//! let registry = DeploymentRegistryBuilder::new(config)
//!     .with_communication(comm)
//!     .with_resource_provider(provider)
//!     .build()?;
//! registry.start().await?;
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod builder;
pub mod config;
pub mod error;
pub mod exclusions;
pub mod registry;
pub mod telemetry;

// Re-exports
pub use builder::DeploymentRegistryBuilder;
pub use config::{LoggingConfig, RegistryConfig};
pub use error::{RegistryError, ResolveRejection, Result};
pub use exclusions::LocalExclusions;
pub use registry::{
    DeploymentRegistry, RegistrySnapshot, StoreSnapshot, UnitSummary, IMMORTAL_SAMPLE_RESOURCE,
};
pub use telemetry::init_tracing;
