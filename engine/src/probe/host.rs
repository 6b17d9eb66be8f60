//! Host facts probe

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::errors::EngineError;
use crate::ssh::{ManagedSession, SessionManager, Target};

const SECTION: &str = "@@opspro:";

/// Hardware and OS facts gathered over one session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostFacts {
    pub hostname: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_gb: Option<f64>,
    pub disk_gb: Option<u64>,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
}

/// One script, sections delimited by markers so a single missing tool
/// only blanks its own fact.
fn facts_command() -> String {
    [
        ("hostname", "hostname"),
        ("nproc", "nproc"),
        ("meminfo", "grep MemTotal /proc/meminfo"),
        ("df", "df -BG / | tail -1"),
        ("os-release", "cat /etc/os-release"),
        ("kernel", "uname -r"),
    ]
    .iter()
    .map(|(name, cmd)| format!("echo '{}{}'; {} 2>/dev/null", SECTION, name, cmd))
    .collect::<Vec<_>>()
    .join("; ")
}

pub async fn probe_host_facts(
    sessions: &SessionManager,
    target: &Target,
    timeout: Duration,
) -> Result<HostFacts, EngineError> {
    let session = sessions.open(target).await?;
    let result = collect(&session, timeout).await;
    session.close().await;
    result
}

async fn collect(session: &ManagedSession, timeout: Duration) -> Result<HostFacts, EngineError> {
    let result = session.exec(&facts_command(), timeout).await?;
    let facts = parse_facts(&result.stdout);
    debug!(host = %session.label(), ?facts, "Collected host facts");
    Ok(facts)
}

pub fn parse_facts(output: &str) -> HostFacts {
    let mut facts = HostFacts::default();
    let mut section = "";
    let mut os_release = String::new();

    for line in output.lines() {
        if let Some(name) = line.strip_prefix(SECTION) {
            section = name.trim();
            continue;
        }
        let value = line.trim();
        if value.is_empty() {
            continue;
        }
        match section {
            "hostname" if facts.hostname.is_none() => facts.hostname = Some(value.to_string()),
            "nproc" if facts.cpu_cores.is_none() => facts.cpu_cores = value.parse().ok(),
            "meminfo" if facts.memory_gb.is_none() => facts.memory_gb = parse_meminfo_gb(value),
            "df" if facts.disk_gb.is_none() => facts.disk_gb = parse_df_gb(value),
            "os-release" => {
                os_release.push_str(value);
                os_release.push('\n');
            }
            "kernel" if facts.kernel_version.is_none() => facts.kernel_version = Some(value.to_string()),
            _ => {}
        }
    }

    let (os_type, os_version) = parse_os_release(&os_release);
    facts.os_type = os_type;
    facts.os_version = os_version;
    facts
}

/// `MemTotal:  16314568 kB` → GiB rounded to two decimals
fn parse_meminfo_gb(line: &str) -> Option<f64> {
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kb / 1024.0 / 1024.0 * 100.0).round() / 100.0)
}

/// Second column of a `df -BG` row, e.g. `50G`
fn parse_df_gb(line: &str) -> Option<u64> {
    line.split_whitespace()
        .nth(1)?
        .trim_end_matches('G')
        .parse()
        .ok()
}

fn parse_os_release(contents: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut version = None;
    let mut pretty = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "NAME" => name = Some(value),
            "VERSION_ID" => version = Some(value),
            "PRETTY_NAME" => pretty = Some(value),
            _ => {}
        }
    }
    (name.or(pretty), version)
}
