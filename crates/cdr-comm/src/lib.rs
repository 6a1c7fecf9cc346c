//! CDR Comm - Cluster communication for the deployment registry
//!
//! Two operations cross the network: fetching the content of a unit that a
//! remote node holds, and telling remote nodes to undeploy a resource. Both
//! ride on a pluggable [`ClusterTransport`]; membership comes from a
//! [`TopologyProvider`]. Inbound requests are dispatched into whatever
//! [`InboundHandler`] is currently registered.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod communication;
pub mod error;
pub mod memory;
pub mod messages;
pub mod transport;

// Re-exports
pub use communication::{DeploymentCommunication, HandlerRegistration};
pub use error::{CommError, Result, TransportError};
pub use memory::{InMemoryNetwork, InMemoryTopology, InMemoryTransport};
pub use messages::{DeploymentMessage, FetchRequest};
pub use transport::{ClusterTransport, InboundHandler, TopologyProvider};
