//! Application state management

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::artifact::ArtifactStore;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::http::client::HttpClient;
use crate::jobs::{JobQueue, LocalJobQueue};
use crate::probe::ProbeEngine;
use crate::relay::Relay;
use crate::server::state::ServerState;
use crate::ssh::client::RusshConnector;
use crate::ssh::{Connector, SessionManager};
use crate::storage::store::{HttpStore, MemoryStore, ResourceStore};
use crate::vault::CredentialVault;

/// Long-lived engine components
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub store: Arc<dyn ResourceStore>,
    pub probe: Arc<ProbeEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub relay: Arc<Relay>,
    pub jobs: Arc<LocalJobQueue>,
}

impl AppState {
    /// Build the production state: vault key and tokens from the
    /// environment, russh transport, backend or in-memory store
    pub async fn init(options: &AppOptions) -> Result<Self, EngineError> {
        options.layout.setup().await?;

        let vault = Arc::new(CredentialVault::from_env(&options.vault_key_env)?);
        let connector = Arc::new(RusshConnector::new(
            options.connector.host_key_policy,
            options.connector.known_hosts_path(),
            options.connector.inactivity_timeout,
        ));
        let store = init_store(options)?;

        let mut options = options.clone();
        options.orchestrator.agent_token_secret = env_secret(&options.orchestrator.agent.token_secret_env);
        if options.orchestrator.agent_token_secret.is_none() {
            warn!(
                "{} is not set, agent installs are disabled",
                options.orchestrator.agent.token_secret_env
            );
        }

        Ok(Self::with_parts(&options, connector, vault, store))
    }

    /// Assemble the state around an explicit transport, vault and store
    pub fn with_parts(
        options: &AppOptions,
        connector: Arc<dyn Connector>,
        vault: Arc<CredentialVault>,
        store: Arc<dyn ResourceStore>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(connector, vault, options.ssh.clone()));
        let probe = Arc::new(ProbeEngine::new(sessions.clone(), options.probe.clone()));

        let artifacts = Arc::new(ArtifactStore::new(options.layout.uploads_dir()));
        let bundle_dir = match &options.orchestrator.agent.bundle_dir {
            Some(path) => Dir::new(path),
            None => options.layout.agent_bundle_dir(),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            sessions.clone(),
            store.clone(),
            artifacts,
            bundle_dir,
            options.orchestrator.clone(),
        ));

        let relay = Arc::new(Relay::new(sessions.clone(), options.relay.clone()));
        let jobs = Arc::new(LocalJobQueue::new(&options.jobs));

        Self {
            sessions,
            store,
            probe,
            orchestrator,
            relay,
            jobs,
        }
    }

    pub fn server_state(&self) -> ServerState {
        ServerState::new(
            self.sessions.clone(),
            self.store.clone(),
            self.probe.clone(),
            self.orchestrator.clone(),
            self.relay.clone(),
            self.jobs.clone(),
        )
    }

    /// Stop accepting jobs and wait for the running ones
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        info!("Shutting down app state...");
        self.jobs.shutdown().await;
        Ok(())
    }
}

fn env_secret(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .map(SecretString::from)
}

fn init_store(options: &AppOptions) -> Result<Arc<dyn ResourceStore>, EngineError> {
    match &options.backend {
        Some(backend) => {
            info!("Using backend resource store at {}", backend.base_url);
            let client = HttpClient::new(&backend.base_url, env_secret(&backend.token_env))?;
            Ok(Arc::new(HttpStore::new(client)))
        }
        None => {
            warn!("No backend configured, resources are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
