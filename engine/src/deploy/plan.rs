//! Step plans for each operation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::deploy::artifact::ArtifactFormat;
use crate::ssh::command::shell_quote;
use crate::storage::settings::{AgentSettings, SiteLayout};

pub const CONNECT: &str = "connect";
pub const BACKUP_CURRENT: &str = "backup-current";
pub const PRUNE_BACKUPS: &str = "prune-backups";
pub const UPLOAD_ARTIFACT: &str = "upload-artifact";
pub const EXTRACT_INSTALL: &str = "extract-install";
pub const START_SERVICE: &str = "start-service";
pub const HEALTH_CHECK: &str = "health-check";
pub const RESTART_FAILOVER_DAEMON: &str = "restart-failover-daemon";
pub const LOCATE_BACKUP: &str = "locate-backup";
pub const STOP_SERVICE: &str = "stop-service";
pub const RESTORE_ARTIFACT: &str = "restore-artifact";
pub const DETECT_ARCH: &str = "detect-arch";
pub const CONFIGURE: &str = "configure";

/// What a step does on the remote host
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Run as the login user; non-zero exit fails the step
    Exec(String),

    /// Run with `sudo -n` unless the login user is root
    Privileged(String),

    Upload {
        contents: Arc<Vec<u8>>,
        remote_path: String,
    },

    /// Privileged command whose trimmed stdout must equal `expected`
    Expect { command: String, expected: String },

    /// [`StepAction::Expect`] polled until it holds
    HealthCheck {
        command: String,
        expected: String,
        attempts: u32,
        interval: Duration,
    },

    /// Record the normalized `uname -m` for later steps
    DetectArch,

    /// Upload the bundle whose file name carries `linux-<arch>`
    UploadArchBundle {
        bundles: Vec<PathBuf>,
        remote_path: String,
    },

    /// Privileged command; on failure `restore` runs and the step still fails
    WithRestore { command: String, restore: String },

    Sequence(Vec<StepAction>),
}

#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub name: &'static str,
    pub action: StepAction,
    pub timeout: Duration,
}

impl PlannedStep {
    pub fn new(name: &'static str, action: StepAction, timeout: Duration) -> Self {
        Self { name, action, timeout }
    }
}

fn q(value: &str) -> String {
    shell_quote(value)
}

fn container_running(site: &SiteLayout) -> String {
    format!("docker inspect -f '{{{{.State.Running}}}}' {}", q(&site.container))
}

fn compose(site: &SiteLayout, verb: &str) -> String {
    format!("cd {} && docker-compose {} {}", q(&site.base_dir), verb, q(&site.container))
}

fn restore_command(site: &SiteLayout, backup_name: &str) -> String {
    format!(
        "rm -rf {html}/* && tar -xzf {backup}/{name} -C {base}",
        html = q(&site.html_path()),
        backup = q(&site.backup_dir),
        name = q(backup_name),
        base = q(&site.base_dir),
    )
}

fn site_health(site: &SiteLayout, timeout: Duration) -> PlannedStep {
    PlannedStep::new(
        HEALTH_CHECK,
        StepAction::HealthCheck {
            command: container_running(site),
            expected: "true".to_string(),
            attempts: 3,
            interval: Duration::from_secs(2),
        },
        timeout,
    )
}

/// Remote package path for a deployment id
pub fn package_path(deploy_id: &str) -> String {
    format!("/tmp/deploy_{}.pkg", deploy_id)
}

/// Static site rollout, after `connect`
pub fn site_plan(
    site: &SiteLayout,
    format: ArtifactFormat,
    contents: Arc<Vec<u8>>,
    deploy_id: &str,
    backup_name: &str,
    timeout: Duration,
) -> Vec<PlannedStep> {
    let html = site.html_path();
    let package = package_path(deploy_id);
    let extract_dir = format!("/tmp/deploy_extract_{}", deploy_id);

    let backup = format!(
        "mkdir -p {backup} {html} && tar -czf {backup}/{name} -C {base} {dir}/",
        backup = q(&site.backup_dir),
        html = q(&html),
        name = q(backup_name),
        base = q(&site.base_dir),
        dir = q(&site.html_dir),
    );

    let prune = format!(
        "find {} -maxdepth 1 -name 'html_*.tar.gz' -mtime +{} -delete",
        q(&site.backup_dir),
        site.retention_days
    );

    let extract = [
        "set -e".to_string(),
        format!("d={}; p={}; html={}", q(&extract_dir), q(&package), q(&html)),
        "rm -rf \"$d\"; mkdir -p \"$d\"".to_string(),
        format.extract_command("\"$p\"", "\"$d\""),
        "src=''".to_string(),
        "if [ -f \"$d/index.html\" ]; then src=\"$d\"; else for f in \"$d\"/*/index.html; do if [ -f \"$f\" ]; then src=\"${f%/index.html}\"; break; fi; done; fi".to_string(),
        "if [ -z \"$src\" ]; then rm -rf \"$d\" \"$p\"; echo 'index.html not found in package' >&2; exit 1; fi".to_string(),
        "rm -rf \"$html\"/*; cp -a \"$src\"/. \"$html\"/".to_string(),
        "rm -rf \"$d\" \"$p\"".to_string(),
    ]
    .join("; ");

    vec![
        PlannedStep::new(BACKUP_CURRENT, StepAction::Privileged(backup), timeout),
        PlannedStep::new(PRUNE_BACKUPS, StepAction::Privileged(prune), timeout),
        PlannedStep::new(
            UPLOAD_ARTIFACT,
            StepAction::Upload {
                contents,
                remote_path: package,
            },
            timeout,
        ),
        PlannedStep::new(
            EXTRACT_INSTALL,
            StepAction::WithRestore {
                command: extract,
                restore: restore_command(site, backup_name),
            },
            timeout,
        ),
        PlannedStep::new(START_SERVICE, StepAction::Privileged(compose(site, "restart")), timeout),
        site_health(site, timeout),
    ]
}

/// Appended to both hosts of an HA pair once both rollouts succeeded
pub fn failover_step(site: &SiteLayout, timeout: Duration) -> PlannedStep {
    PlannedStep::new(
        RESTART_FAILOVER_DAEMON,
        StepAction::Privileged(format!("systemctl restart {}", q(&site.failover_unit))),
        timeout,
    )
}

/// Restore a named backup, after `connect`. The name is validated by the caller.
pub fn rollback_plan(site: &SiteLayout, backup_name: &str, timeout: Duration) -> Vec<PlannedStep> {
    vec![
        PlannedStep::new(
            LOCATE_BACKUP,
            StepAction::Expect {
                command: format!(
                    "if [ -f {}/{} ]; then echo found; else echo missing; fi",
                    q(&site.backup_dir),
                    q(backup_name)
                ),
                expected: "found".to_string(),
            },
            timeout,
        ),
        PlannedStep::new(STOP_SERVICE, StepAction::Privileged(compose(site, "stop")), timeout),
        PlannedStep::new(
            RESTORE_ARTIFACT,
            StepAction::Privileged(restore_command(site, backup_name)),
            timeout,
        ),
        PlannedStep::new(START_SERVICE, StepAction::Privileged(compose(site, "start")), timeout),
        site_health(site, timeout),
    ]
}

/// Monitoring agent install, after `connect`
pub fn agent_plan(
    agent: &AgentSettings,
    bundles: Vec<PathBuf>,
    config: String,
    unit: String,
    timeout: Duration,
) -> Vec<PlannedStep> {
    let service = &agent.service_name;
    let bundle_path = format!("/tmp/{}.zip", service);
    let extract_dir = format!("/tmp/{}_extract", service);
    let staged_config = format!("/tmp/{}.config", service);
    let staged_unit = format!("/tmp/{}.service", service);

    let install = [
        "set -e".to_string(),
        format!("d={}; p={}", q(&extract_dir), q(&bundle_path)),
        "rm -rf \"$d\"; mkdir -p \"$d\"; unzip -oq \"$p\" -d \"$d\"".to_string(),
        format!(
            "bin=$(find \"$d\" -maxdepth 2 -type f -name {} | head -n 1)",
            q(&agent.binary_pattern)
        ),
        "if [ -z \"$bin\" ]; then echo 'agent binary not found in bundle' >&2; exit 1; fi".to_string(),
        format!("install -m 0755 \"$bin\" /usr/local/bin/{}", q(service)),
        "rm -rf \"$d\" \"$p\"".to_string(),
    ]
    .join("; ");

    let place = format!(
        "install -D -m 0600 {cfg} /etc/{svc}/config.alloy && install -D -m 0644 {unit} /etc/systemd/system/{svc}.service \
         && mkdir -p /var/lib/{svc}/data && rm -f {cfg} {unit}",
        cfg = q(&staged_config),
        unit = q(&staged_unit),
        svc = q(service),
    );

    vec![
        PlannedStep::new(DETECT_ARCH, StepAction::DetectArch, timeout),
        PlannedStep::new(
            UPLOAD_ARTIFACT,
            StepAction::UploadArchBundle {
                bundles,
                remote_path: bundle_path,
            },
            timeout,
        ),
        PlannedStep::new(EXTRACT_INSTALL, StepAction::Privileged(install), timeout),
        PlannedStep::new(
            CONFIGURE,
            StepAction::Sequence(vec![
                StepAction::Upload {
                    contents: Arc::new(config.into_bytes()),
                    remote_path: staged_config,
                },
                StepAction::Upload {
                    contents: Arc::new(unit.into_bytes()),
                    remote_path: staged_unit,
                },
                StepAction::Privileged(place),
            ]),
            timeout,
        ),
        PlannedStep::new(
            START_SERVICE,
            StepAction::Privileged(format!(
                "systemctl daemon-reload && systemctl enable {svc} && systemctl restart {svc}",
                svc = q(service)
            )),
            timeout,
        ),
        PlannedStep::new(
            HEALTH_CHECK,
            StepAction::HealthCheck {
                command: format!("systemctl is-active {}", q(service)),
                expected: "active".to_string(),
                attempts: 5,
                interval: Duration::from_secs(2),
            },
            timeout,
        ),
    ]
}
