//! Middleware status and runtime metrics

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::probe::engine::VerifyRequest;
use crate::probe::middleware::MiddlewareKind;
use crate::ssh::command::shell_quote;
use crate::ssh::{ManagedSession, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Active,
    Inactive,
    Error,
    Stopped,
    Unknown,
}

impl ServiceState {
    /// Map `systemctl is-active` output
    pub fn from_systemctl(output: &str) -> Self {
        match output.trim() {
            "active" => ServiceState::Active,
            "inactive" | "dead" => ServiceState::Inactive,
            "failed" | "error" => ServiceState::Error,
            "" => ServiceState::Unknown,
            _ => ServiceState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MiddlewareStatus {
    pub status: ServiceState,
    pub metrics: BTreeMap<String, Value>,
}

/// Service state and, when active, metrics, over one session
pub async fn collect_status(
    sessions: &SessionManager,
    request: &VerifyRequest,
    timeout: Duration,
) -> Result<MiddlewareStatus, EngineError> {
    request.validate()?;
    let session = sessions.open(&request.target).await?;
    let status = collect(&session, request, timeout).await;
    session.close().await;
    Ok(status)
}

async fn collect(session: &ManagedSession, request: &VerifyRequest, timeout: Duration) -> MiddlewareStatus {
    let status = match &request.service_name {
        Some(unit) => {
            let command = format!("systemctl is-active {} 2>/dev/null", shell_quote(unit));
            match session.exec(&command, timeout).await {
                Ok(result) => ServiceState::from_systemctl(&result.stdout),
                Err(e) => {
                    warn!(host = %session.label(), error = %e, "Service status check failed");
                    ServiceState::Unknown
                }
            }
        }
        // nothing to ask systemd about; metrics decide
        None => ServiceState::Active,
    };

    let mut metrics = BTreeMap::new();
    if status == ServiceState::Active {
        let kind = request.kind;
        let password = request.password().unwrap_or("");
        let username = request.username.as_deref();
        for binary in kind.checks().client_binaries {
            let command = kind.metrics_command(binary, request.port(), username, password);
            match session.exec(&command, timeout).await {
                Ok(result) if result.success() && !result.stdout_trimmed().is_empty() => {
                    metrics = parse_metrics(kind, &result.stdout);
                    if !metrics.is_empty() {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(host = %session.label(), error = %e, "Metrics command failed");
                    break;
                }
            }
        }
    }

    MiddlewareStatus { status, metrics }
}

pub fn parse_metrics(kind: MiddlewareKind, output: &str) -> BTreeMap<String, Value> {
    match kind {
        MiddlewareKind::Mysql => parse_mysql_status(output),
        MiddlewareKind::Redis | MiddlewareKind::Sentinel => parse_redis_info(output),
    }
}

/// `Uptime: 3600  Threads: 2  Questions: 10  ...  Open tables: 40  Queries per second avg: 0.002`
fn parse_mysql_status(output: &str) -> BTreeMap<String, Value> {
    let mut metrics = BTreeMap::new();
    let fields = [
        ("uptime", r"Uptime:\s+(\d+)"),
        ("threads", r"Threads:\s+(\d+)"),
        ("open_tables", r"Open tables:\s+(\d+)"),
    ];
    for (key, pattern) in fields {
        if let Some(value) = capture(pattern, output).and_then(|v| v.parse::<u64>().ok()) {
            metrics.insert(key.to_string(), json!(value));
        }
    }
    if let Some(qps) = capture(r"Queries per second avg:\s+([\d.]+)", output).and_then(|v| v.parse::<f64>().ok()) {
        metrics.insert("qps".to_string(), json!(qps));
    }
    metrics
}

fn capture(pattern: &str, haystack: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(haystack)?.get(1).map(|m| m.as_str().to_string())
}

fn parse_redis_info(output: &str) -> BTreeMap<String, Value> {
    let mut metrics = BTreeMap::new();
    let mut hits = None;
    let mut misses = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "connected_clients" | "instantaneous_ops_per_sec" | "uptime_in_seconds" => {
                if let Ok(n) = value.parse::<u64>() {
                    metrics.insert(key.to_string(), json!(n));
                }
            }
            "used_memory_human" | "redis_version" => {
                metrics.insert(key.to_string(), json!(value));
            }
            "keyspace_hits" => hits = value.parse::<u64>().ok(),
            "keyspace_misses" => misses = value.parse::<u64>().ok(),
            _ => {}
        }
    }

    if let (Some(hits), Some(misses)) = (hits, misses) {
        if hits + misses > 0 {
            let rate = hits as f64 / (hits + misses) as f64 * 100.0;
            metrics.insert("hit_rate".to_string(), json!((rate * 100.0).round() / 100.0));
        }
    }
    metrics
}
