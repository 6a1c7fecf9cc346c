//! Builder for the deployment registry

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::registry::DeploymentRegistry;
use cdr_comm::DeploymentCommunication;
use cdr_store::{InMemoryResourceProvider, ResourceProvider};
use std::sync::Arc;

/// Assembles a [`DeploymentRegistry`] from its collaborators
pub struct DeploymentRegistryBuilder {
    config: RegistryConfig,
    comm: Option<Arc<DeploymentCommunication>>,
    provider: Option<Arc<dyn ResourceProvider>>,
}

impl DeploymentRegistryBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            comm: None,
            provider: None,
        }
    }

    /// Communication layer; also supplies the local node id
    pub fn with_communication(mut self, comm: Arc<DeploymentCommunication>) -> Self {
        self.comm = Some(comm);
        self
    }

    /// Local resource path. Defaults to an empty in-memory provider.
    pub fn with_resource_provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Validate the configuration and build the registry
    pub fn build(self) -> Result<Arc<DeploymentRegistry>> {
        let mode = self.config.validate()?;
        let comm = self.comm.ok_or_else(|| {
            RegistryError::Configuration("communication layer is required".into())
        })?;
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(InMemoryResourceProvider::new()));

        Ok(Arc::new(DeploymentRegistry::new(
            self.config,
            mode,
            comm,
            provider,
        )))
    }
}
