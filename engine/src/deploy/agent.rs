//! Monitoring agent bundle, config and push token

use std::path::{Path, PathBuf};

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::settings::AgentSettings;

pub const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../../templates/config.alloy.tmpl");

/// Claims of the token an agent presents when pushing data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTokenClaims {
    /// Resource id
    pub sub: String,
    pub scope: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 push token for one resource
pub fn mint_agent_token(secret: &[u8], resource_id: &str, ttl_days: u32) -> Result<String, EngineError> {
    if secret.is_empty() {
        return Err(EngineError::ConfigError("agent token secret is empty".to_string()));
    }
    let now = Utc::now().timestamp();
    let claims = AgentTokenClaims {
        sub: resource_id.to_string(),
        scope: "agent:push".to_string(),
        iat: now,
        exp: now + i64::from(ttl_days) * 24 * 3600,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| EngineError::Internal(format!("failed to sign agent token: {}", e)))
}

/// Replace `{{name}}` placeholders
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{{{}}}}}", name), value)
    })
}

pub async fn load_template(agent: &AgentSettings) -> Result<String, EngineError> {
    match &agent.config_template {
        Some(path) => File::new(path).read_string().await,
        None => Ok(DEFAULT_CONFIG_TEMPLATE.to_string()),
    }
}

pub fn unit_file(service: &str) -> String {
    format!(
        "[Unit]\n\
         Description=OpsPro monitoring agent\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart=/usr/local/bin/{svc} run /etc/{svc}/config.alloy --storage.path=/var/lib/{svc}/data\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        svc = service
    )
}

/// `uname -m` to bundle naming
pub fn normalize_arch(raw: &str) -> String {
    match raw.trim() {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" | "armv8l" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// First zip bundle built for `linux-<arch>`
pub fn select_bundle<'a>(bundles: &'a [PathBuf], arch: &str) -> Option<&'a Path> {
    let marker = format!("linux-{}", arch);
    bundles
        .iter()
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.ends_with(".zip") && name.contains(&marker))
        })
        .map(PathBuf::as_path)
        .next()
}

pub async fn list_bundles(dir: &Dir) -> Result<Vec<PathBuf>, EngineError> {
    if !dir.exists().await {
        return Ok(Vec::new());
    }
    dir.list_files().await
}
