//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::ssh::client::HostKeyPolicy;

/// Engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    /// Credential vault
    #[serde(default)]
    pub vault: VaultSettings,

    /// CRUD backend; an in-memory store is used when absent
    #[serde(default)]
    pub backend: Option<BackendSettings>,

    #[serde(default)]
    pub ssh: SshSettings,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub jobs: JobSettings,
}

impl Settings {
    /// Read settings from `file`, falling back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, EngineError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json()
            .await
            .map_err(|e| EngineError::ConfigError(format!("{}: {}", file.path().display(), e)))
    }
}

fn default_true() -> bool {
    true
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8470
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    /// Environment variable holding the master secret
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

fn default_key_env() -> String {
    "OPSPRO_SECRET_KEY".to_string()
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
        }
    }
}

/// Backend API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL for the backend API
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_backend_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}

fn default_token_env() -> String {
    "OPSPRO_BACKEND_TOKEN".to_string()
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            token_env: default_token_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Concurrent sessions allowed per host
    #[serde(default = "default_per_host_cap")]
    pub per_host_cap: usize,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// OpenSSH known_hosts file; `~/.ssh/known_hosts` when unset
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_per_host_cap() -> usize {
    4
}

fn default_inactivity_timeout() -> u64 {
    300
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            per_host_cap: default_per_host_cap(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_secs: u64,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Delay before the single reachability retry
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max")]
    pub retry_max_delay_ms: u64,
}

fn default_reachability_timeout() -> u64 {
    5
}

fn default_check_timeout() -> u64 {
    15
}

fn default_retry_base() -> u64 {
    1000
}

fn default_retry_max() -> u64 {
    5000
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            reachability_timeout_secs: default_reachability_timeout(),
            check_timeout_secs: default_check_timeout(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Overall deadline for one batch, checked before each step
    #[serde(default = "default_batch_deadline")]
    pub batch_deadline_secs: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default)]
    pub site: SiteLayout,
}

fn default_step_timeout() -> u64 {
    120
}

fn default_batch_deadline() -> u64 {
    15 * 60
}

fn default_max_batch_size() -> usize {
    10
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            batch_deadline_secs: default_batch_deadline(),
            max_batch_size: default_max_batch_size(),
            site: SiteLayout::default(),
        }
    }
}

/// Remote layout of a static site served from a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteLayout {
    #[serde(default = "default_site_base")]
    pub base_dir: String,

    /// Document root, relative to `base_dir`
    #[serde(default = "default_html_dir")]
    pub html_dir: String,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,

    /// Compose service serving the site
    #[serde(default = "default_container")]
    pub container: String,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// systemd unit restarted by the HA step
    #[serde(default = "default_failover_unit")]
    pub failover_unit: String,
}

fn default_site_base() -> String {
    "/usr/local/nginx".to_string()
}

fn default_html_dir() -> String {
    "html".to_string()
}

fn default_backup_dir() -> String {
    "/usr/local/nginx/backup".to_string()
}

fn default_container() -> String {
    "start_nginx".to_string()
}

fn default_retention_days() -> u32 {
    3
}

fn default_failover_unit() -> String {
    "keepalived".to_string()
}

impl SiteLayout {
    pub fn html_path(&self) -> String {
        format!("{}/{}", self.base_dir.trim_end_matches('/'), self.html_dir)
    }
}

impl Default for SiteLayout {
    fn default() -> Self {
        Self {
            base_dir: default_site_base(),
            html_dir: default_html_dir(),
            backup_dir: default_backup_dir(),
            container: default_container(),
            retention_days: default_retention_days(),
            failover_unit: default_failover_unit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Lines queued for a slow client before the oldest are dropped
    #[serde(default = "default_buffer_lines")]
    pub buffer_lines: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lines of history sent when a stream opens
    #[serde(default = "default_initial_lines")]
    pub initial_lines: u32,
}

fn default_buffer_lines() -> usize {
    5000
}

fn default_poll_interval() -> u64 {
    250
}

fn default_initial_lines() -> u32 {
    100
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_lines: default_buffer_lines(),
            poll_interval_ms: default_poll_interval(),
            initial_lines: default_initial_lines(),
        }
    }
}

impl RelaySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Monitoring agent rollout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Directory of `*linux-<arch>*.zip` bundles; the layout's bundle dir when unset
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,

    /// Config template; the built-in one when unset
    #[serde(default)]
    pub config_template: Option<PathBuf>,

    #[serde(default = "default_agent_service")]
    pub service_name: String,

    /// Name pattern of the executable inside a bundle
    #[serde(default = "default_agent_binary")]
    pub binary_pattern: String,

    #[serde(default = "default_agent_backend")]
    pub backend_url: String,

    /// Remote-write endpoint; derived from `backend_url` when unset
    #[serde(default)]
    pub metrics_push_url: Option<String>,

    /// Log push endpoint; derived from `backend_url` when unset
    #[serde(default)]
    pub logs_push_url: Option<String>,

    /// Environment variable holding the token signing secret
    #[serde(default = "default_token_secret_env")]
    pub token_secret_env: String,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_days: u32,
}

fn default_agent_service() -> String {
    "opspro-agent".to_string()
}

fn default_agent_binary() -> String {
    "alloy*".to_string()
}

fn default_agent_backend() -> String {
    "http://localhost".to_string()
}

fn default_token_secret_env() -> String {
    "OPSPRO_AGENT_TOKEN_SECRET".to_string()
}

fn default_token_ttl() -> u32 {
    365
}

impl AgentSettings {
    pub fn metrics_push_url(&self) -> String {
        self.metrics_push_url.clone().unwrap_or_else(|| {
            format!("{}/prometheus/api/v1/write", self.backend_url.trim_end_matches('/'))
        })
    }

    pub fn logs_push_url(&self) -> String {
        self.logs_push_url.clone().unwrap_or_else(|| {
            format!("{}/loki/api/v1/push", self.backend_url.trim_end_matches('/'))
        })
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            bundle_dir: None,
            config_template: None,
            service_name: default_agent_service(),
            binary_pattern: default_agent_binary(),
            backend_url: default_agent_backend(),
            metrics_push_url: None,
            logs_push_url: None,
            token_secret_env: default_token_secret_env(),
            token_ttl_days: default_token_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_job_concurrency")]
    pub concurrency: usize,

    /// Finished jobs kept for polling
    #[serde(default = "default_job_history")]
    pub history_limit: usize,
}

fn default_job_concurrency() -> usize {
    4
}

fn default_job_history() -> usize {
    200
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_job_concurrency(),
            history_limit: default_job_history(),
        }
    }
}
