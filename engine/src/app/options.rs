//! Application configuration options

use std::time::Duration;

use crate::deploy::orchestrator::OrchestratorOptions;
use crate::jobs::local;
use crate::probe::ProbeOptions;
use crate::relay::RelayOptions;
use crate::ssh::client::{default_known_hosts_path, HostKeyPolicy};
use crate::ssh::SshOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{BackendSettings, Settings};
use crate::utils::CooldownOptions;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub lifecycle: LifecycleOptions,

    /// On-disk layout
    pub layout: StorageLayout,

    pub server: ServerOptions,

    /// Environment variable holding the vault master secret
    pub vault_key_env: String,

    /// CRUD backend; `None` keeps resources in memory
    pub backend: Option<BackendSettings>,

    pub ssh: SshOptions,

    pub connector: ConnectorOptions,

    pub probe: ProbeOptions,

    pub orchestrator: OrchestratorOptions,

    pub relay: RelayOptions,

    pub jobs: local::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let ssh = &settings.ssh;
        let probe = &settings.probe;
        let deploy = &settings.deploy;

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                ..Default::default()
            },
            vault_key_env: settings.vault.key_env.clone(),
            backend: settings.backend.clone(),
            ssh: SshOptions {
                connect_timeout: Duration::from_secs(ssh.connect_timeout_secs),
                per_host_cap: ssh.per_host_cap,
            },
            connector: ConnectorOptions {
                host_key_policy: ssh.host_key_policy,
                known_hosts_path: ssh.known_hosts_path.clone(),
                inactivity_timeout: Duration::from_secs(ssh.inactivity_timeout_secs),
            },
            probe: ProbeOptions {
                reachability_timeout: Duration::from_secs(probe.reachability_timeout_secs),
                check_timeout: Duration::from_secs(probe.check_timeout_secs),
                reachability_retry: CooldownOptions {
                    base_delay: Duration::from_millis(probe.retry_base_delay_ms),
                    max_delay: Duration::from_millis(probe.retry_max_delay_ms),
                    multiplier: 2.0,
                },
            },
            orchestrator: OrchestratorOptions {
                step_timeout: Duration::from_secs(deploy.step_timeout_secs),
                batch_deadline: Duration::from_secs(deploy.batch_deadline_secs),
                max_batch_size: deploy.max_batch_size,
                site: deploy.site.clone(),
                agent: settings.agent.clone(),
                // read from the environment when the state is built
                agent_token_secret: None,
            },
            relay: RelayOptions::from(&settings.relay),
            jobs: local::Options::from(&settings.jobs),
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// russh connector options
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub host_key_policy: HostKeyPolicy,

    /// `~/.ssh/known_hosts` when unset
    pub known_hosts_path: Option<std::path::PathBuf>,

    pub inactivity_timeout: Duration,
}

impl ConnectorOptions {
    pub fn known_hosts_path(&self) -> std::path::PathBuf {
        self.known_hosts_path.clone().unwrap_or_else(default_known_hosts_path)
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Largest accepted package upload
    pub max_upload_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
            max_upload_bytes: 256 * 1024 * 1024,
        }
    }
}
