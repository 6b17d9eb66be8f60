//! Persistence interface owned by the CRUD backend

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::deploy::model::ExecutionRecord;
use crate::errors::EngineError;
use crate::http::client::HttpClient;
use crate::ssh::Target;
use crate::vault::CredentialHandle;

/// A managed host as the backend stores it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host_address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_username: String,
    pub credential_handle: CredentialHandle,
}

fn default_ssh_port() -> u16 {
    22
}

impl Resource {
    pub fn target(&self) -> Target {
        let target = Target::new(
            self.host_address.clone(),
            self.ssh_port,
            self.ssh_username.clone(),
            self.credential_handle.clone(),
        );
        match &self.name {
            Some(name) if !name.is_empty() => target.with_label(name.clone()),
            _ => target,
        }
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_resource(&self, id: &str) -> Result<Resource, EngineError>;

    async fn get_credential(&self, id: &str) -> Result<CredentialHandle, EngineError> {
        Ok(self.get_resource(id).await?.credential_handle)
    }

    async fn append_execution_record(&self, record: &ExecutionRecord) -> Result<(), EngineError>;
}

/// In-process store for development and tests
#[derive(Default)]
pub struct MemoryStore {
    resources: RwLock<HashMap<String, Resource>>,
    records: RwLock<Vec<ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_resource(&self, resource: Resource) {
        self.resources.write().await.insert(resource.id.clone(), resource);
    }

    pub async fn records(&self) -> Vec<ExecutionRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_resource(&self, id: &str) -> Result<Resource, EngineError> {
        self.resources
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", id)))
    }

    async fn append_execution_record(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

/// Store backed by the dashboard's internal API
pub struct HttpStore {
    client: HttpClient,
}

impl HttpStore {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

fn check_id(id: &str) -> Result<(), EngineError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(EngineError::ValidationError(format!("invalid resource id '{}'", id)));
    }
    Ok(())
}

#[async_trait]
impl ResourceStore for HttpStore {
    async fn get_resource(&self, id: &str) -> Result<Resource, EngineError> {
        check_id(id)?;
        self.client.get(&format!("/internal/resources/{}", id)).await
    }

    async fn append_execution_record(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        debug!(record = %record.id, operation = %record.operation, "Appending execution record");
        self.client.post("/internal/executions", record).await
    }
}
