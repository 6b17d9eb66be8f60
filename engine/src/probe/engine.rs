//! Middleware verification

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::probe::middleware::{AuthOutcome, MiddlewareKind};
use crate::probe::report::{ReportBuilder, VerificationReport};
use crate::ssh::command::shell_quote;
use crate::ssh::{ManagedSession, SessionManager, Target};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Probe engine options
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Deadline for the SSH `echo ok` and the loopback port check
    pub reachability_timeout: Duration,

    /// Deadline for every other remote check
    pub check_timeout: Duration,

    /// Backoff before the single reachability retry
    pub reachability_retry: CooldownOptions,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            reachability_timeout: Duration::from_secs(5),
            check_timeout: Duration::from_secs(15),
            reachability_retry: CooldownOptions {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
            },
        }
    }
}

/// What to verify on a target
#[derive(Debug)]
pub struct VerifyRequest {
    pub target: Target,
    pub kind: MiddlewareKind,
    /// Middleware port; the kind's default when unset
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Expected systemd unit; discovered when unset
    pub service_name: Option<String>,
}

impl VerifyRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.target.validate()?;
        if self.port == Some(0) {
            return Err(EngineError::ValidationError("middleware port must be non-zero".to_string()));
        }
        if let Some(name) = &self.service_name {
            validate_unit_name(name)?;
        }
        Ok(())
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.unwrap_or(self.kind.checks().default_port)
    }

    pub(crate) fn password(&self) -> Option<&str> {
        self.password
            .as_ref()
            .map(|p| p.expose_secret())
            .filter(|p| !p.is_empty())
    }
}

/// systemd unit names as accepted from callers
pub fn validate_unit_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-' | ':'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::ValidationError(format!("invalid service name '{}'", name)))
    }
}

pub struct ProbeEngine {
    sessions: Arc<SessionManager>,
    options: ProbeOptions,
}

impl ProbeEngine {
    pub fn new(sessions: Arc<SessionManager>, options: ProbeOptions) -> Self {
        Self { sessions, options }
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Run every check against one target over a single session.
    ///
    /// Only malformed input is an error; remote failures are recorded on the
    /// report.
    pub async fn verify(&self, request: VerifyRequest) -> Result<VerificationReport, EngineError> {
        request.validate()?;

        let kind = request.kind;
        let port = request.port();
        let label = request.target.label().to_string();
        let mut report = ReportBuilder::default();
        report.detail("middleware_type", kind);
        report.detail("port", port);

        info!(target = %label, middleware = %kind, port, "Verifying middleware");

        let session = match self.open_reachable(&request.target).await {
            Ok(session) => session,
            Err(e) => {
                warn!(target = %label, error = %e, "SSH unreachable, skipping remaining checks");
                report.detail("ssh", &e);
                return Ok(report.finish(format!("SSH connection failed: {}", e)));
            }
        };
        report.ssh_ok = true;
        report.detail("ssh", "ok");

        self.check_port(&session, port, &mut report).await;
        let active_unit = self
            .check_service(&session, kind, request.service_name.as_deref(), &mut report)
            .await;
        self.check_auth(&session, &request, port, &mut report).await;
        self.discover_log_path(&session, kind, &mut report).await;
        if request.service_name.is_none() {
            self.discover_service_name(&session, kind, active_unit, &mut report).await;
        }

        session.close().await;

        let message = summarize(&report, port);
        let report = report.finish(message);
        info!(target = %label, success = report.success(), "Verification finished");
        Ok(report)
    }

    /// Open a session and run `echo ok`, retrying once after a backoff
    async fn open_reachable(&self, target: &Target) -> Result<ManagedSession, EngineError> {
        let mut last_error = None;
        for attempt in 0..2u32 {
            if attempt > 0 {
                let delay = calc_exp_backoff(&self.options.reachability_retry, attempt - 1);
                debug!(target = %target.label(), ?delay, "Retrying SSH reachability");
                tokio::time::sleep(delay).await;
            }
            match self.try_reach(target).await {
                Ok(session) => return Ok(session),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| EngineError::Internal("no reachability attempt".to_string())))
    }

    async fn try_reach(&self, target: &Target) -> Result<ManagedSession, EngineError> {
        let session = self.sessions.open(target).await?;
        match session.exec("echo ok", self.options.reachability_timeout).await {
            Ok(result) if result.success() && result.stdout_trimmed() == "ok" => Ok(session),
            Ok(result) => {
                session.close().await;
                Err(EngineError::ConnectionError(format!(
                    "shell check returned unexpected output: {}",
                    result.diagnostic()
                )))
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// TCP connect from the target to its own loopback
    async fn check_port(&self, session: &ManagedSession, port: u16, report: &mut ReportBuilder) {
        let secs = self.options.reachability_timeout.as_secs().max(1);
        let probe = format!("exec 3<>/dev/tcp/127.0.0.1/{}", port);
        let command = format!(
            "if timeout {secs} bash -c {probe} 2>/dev/null; then echo open; \
             elif command -v nc >/dev/null 2>&1 && nc -z -w {secs} 127.0.0.1 {port} 2>/dev/null; then echo open; \
             else echo closed; fi",
            secs = secs,
            probe = shell_quote(&probe),
            port = port
        );

        match session.exec(&command, self.options.reachability_timeout * 2 + Duration::from_secs(1)).await {
            Ok(result) => {
                report.port_reachable = result.stdout_trimmed() == "open";
                report.detail("port_check", result.stdout_trimmed());
            }
            Err(e) => report.detail("port_check", format!("error: {}", e)),
        }
    }

    /// Returns the active unit when one was found among the candidates
    async fn check_service(
        &self,
        session: &ManagedSession,
        kind: MiddlewareKind,
        declared: Option<&str>,
        report: &mut ReportBuilder,
    ) -> Option<String> {
        let candidates: Vec<String> = match declared {
            Some(name) => vec![shell_quote(name)],
            None => kind.checks().service_candidates.iter().map(|s| shell_quote(s)).collect(),
        };
        let command = format!(
            "command -v systemctl >/dev/null 2>&1 || {{ echo no-systemd; exit 0; }}; \
             for s in {}; do if [ \"$(systemctl is-active \"$s\" 2>/dev/null)\" = active ]; then echo \"active $s\"; exit 0; fi; done; \
             echo inactive",
            candidates.join(" ")
        );

        match session.exec(&command, self.options.check_timeout).await {
            Ok(result) => {
                let out = result.stdout_trimmed();
                if out == "no-systemd" {
                    report.detail("service", "no service manager");
                    None
                } else if let Some(unit) = out.strip_prefix("active ") {
                    report.service_active = true;
                    report.detail("service", format!("{} active", unit));
                    Some(unit.trim().to_string())
                } else {
                    report.detail("service", "inactive");
                    None
                }
            }
            Err(e) => {
                report.detail("service", format!("error: {}", e));
                None
            }
        }
    }

    async fn check_auth(
        &self,
        session: &ManagedSession,
        request: &VerifyRequest,
        port: u16,
        report: &mut ReportBuilder,
    ) {
        let Some(password) = request.password() else {
            report.detail("auth", "not attempted: no credentials supplied");
            return;
        };
        report.auth_attempted = true;

        let kind = request.kind;
        let username = request.username.as_deref().filter(|u| !u.is_empty());
        for binary in kind.checks().client_binaries {
            let command = kind.auth_command(binary, port, username, password);
            let result = match session.exec(&command, self.options.check_timeout).await {
                Ok(result) => result,
                Err(e) => {
                    report.detail("auth", format!("error: {}", e));
                    return;
                }
            };

            match kind.classify_auth(&result) {
                AuthOutcome::ClientMissing => continue,
                AuthOutcome::Valid => {
                    report.auth_valid = true;
                    report.detail("auth", "valid");
                }
                AuthOutcome::Denied => {
                    report.auth_message = Some("access denied".to_string());
                    report.detail("auth", format!("denied: {}", result.diagnostic()));
                }
                AuthOutcome::Unreachable(detail) => {
                    report.detail("auth", format!("service unreachable: {}", detail));
                }
                AuthOutcome::Inconclusive(detail) => {
                    report.detail("auth", format!("inconclusive: {}", detail));
                }
            }
            report.detail("auth_client", binary);
            return;
        }

        report.detail("auth", "client not installed");
    }

    async fn discover_log_path(&self, session: &ManagedSession, kind: MiddlewareKind, report: &mut ReportBuilder) {
        let paths: Vec<String> = kind.checks().log_paths.iter().map(|p| shell_quote(p)).collect();
        let command = format!(
            "for p in {}; do if [ -f \"$p\" ]; then echo \"$p\"; exit 0; fi; done; exit 1",
            paths.join(" ")
        );

        match session.exec(&command, self.options.check_timeout).await {
            Ok(result) if result.success() && !result.stdout_trimmed().is_empty() => {
                let path = result.stdout_trimmed().to_string();
                report.detail("log_path", &path);
                report.suggested_log_path = Some(path);
            }
            Ok(_) => report.detail("log_path", "not found"),
            Err(e) => report.detail("log_path", format!("error: {}", e)),
        }
    }

    async fn discover_service_name(
        &self,
        session: &ManagedSession,
        kind: MiddlewareKind,
        active_unit: Option<String>,
        report: &mut ReportBuilder,
    ) {
        let from_processes = match session.exec("ps -eo args=", self.options.check_timeout).await {
            Ok(result) if result.success() => kind.match_process(&result.stdout).map(str::to_string),
            Ok(result) => {
                report.detail("service_discovery", format!("ps failed: {}", result.diagnostic()));
                None
            }
            Err(e) => {
                report.detail("service_discovery", format!("error: {}", e));
                None
            }
        };

        let suggestion = from_processes.or(active_unit);
        if let Some(name) = &suggestion {
            report.detail("service_discovery", name);
        }
        report.suggested_service_name = suggestion;
    }
}

fn summarize(report: &ReportBuilder, port: u16) -> String {
    let mut problems = Vec::new();
    if !report.port_reachable {
        problems.push(format!("port {} not reachable on loopback", port));
    }
    if !report.auth_valid {
        match &report.auth_message {
            Some(message) => problems.push(format!("authentication failed: {}", message)),
            None if !report.auth_attempted => {
                problems.push("authentication not attempted: no credentials supplied".to_string())
            }
            None => problems.push("authentication not confirmed".to_string()),
        }
    }

    if problems.is_empty() {
        "verification passed".to_string()
    } else {
        problems.join("; ")
    }
}
