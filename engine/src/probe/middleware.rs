//! Middleware kinds and their static check tables

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::ssh::command::{shell_quote, CommandResult};

/// Middleware the probe engine knows how to verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiddlewareKind {
    Mysql,
    Redis,
    Sentinel,
}

/// Per-kind facts used by every check
#[derive(Debug)]
pub struct CheckTable {
    pub default_port: u16,
    /// systemd units tried in order when no service name is declared
    pub service_candidates: &'static [&'static str],
    /// `(substring of a process command line, service it implies)`, in priority order
    pub process_patterns: &'static [(&'static str, &'static str)],
    /// Process lines containing any of these are ignored
    pub process_excludes: &'static [&'static str],
    pub log_paths: &'static [&'static str],
    pub client_binaries: &'static [&'static str],
}

static MYSQL_CHECKS: CheckTable = CheckTable {
    default_port: 3306,
    service_candidates: &["mysqld", "mysql", "mariadb"],
    process_patterns: &[("mysqld ", "mysqld"), ("/mysqld", "mysqld"), ("mariadbd", "mariadb")],
    process_excludes: &["mysqld_safe"],
    log_paths: &[
        "/var/log/mysql/error.log",
        "/var/log/mysqld.log",
        "/var/log/mysql/mysqld.log",
        "/var/log/mariadb/mariadb.log",
        "/usr/local/mysql/data/mysqld.err",
    ],
    client_binaries: &["mysqladmin", "/usr/bin/mysqladmin", "/usr/local/mysql/bin/mysqladmin"],
};

static REDIS_CHECKS: CheckTable = CheckTable {
    default_port: 6379,
    service_candidates: &["redis-server", "redis", "redis_6379"],
    process_patterns: &[("redis-server", "redis-server")],
    process_excludes: &["sentinel", "redis-cli"],
    log_paths: &[
        "/var/log/redis/redis-server.log",
        "/var/log/redis/redis.log",
        "/var/log/redis_6379.log",
        "/usr/local/redis/logs/redis.log",
    ],
    client_binaries: &["redis-cli", "/usr/bin/redis-cli", "/usr/local/bin/redis-cli"],
};

static SENTINEL_CHECKS: CheckTable = CheckTable {
    default_port: 26379,
    service_candidates: &["redis-sentinel", "sentinel"],
    process_patterns: &[("redis-sentinel", "redis-sentinel"), ("[sentinel]", "redis-sentinel")],
    process_excludes: &["redis-cli"],
    log_paths: &[
        "/var/log/redis/redis-sentinel.log",
        "/var/log/redis/sentinel.log",
        "/var/log/sentinel.log",
        "/usr/local/redis/logs/sentinel.log",
    ],
    client_binaries: &["redis-cli", "/usr/bin/redis-cli", "/usr/local/bin/redis-cli"],
};

/// Result of a login probe against the middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Valid,
    /// The service answered and refused the credentials
    Denied,
    /// The service did not answer; says nothing about the credentials
    Unreachable(String),
    /// This client binary is not installed
    ClientMissing,
    Inconclusive(String),
}

impl MiddlewareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiddlewareKind::Mysql => "mysql",
            MiddlewareKind::Redis => "redis",
            MiddlewareKind::Sentinel => "sentinel",
        }
    }

    pub fn checks(&self) -> &'static CheckTable {
        match self {
            MiddlewareKind::Mysql => &MYSQL_CHECKS,
            MiddlewareKind::Redis => &REDIS_CHECKS,
            MiddlewareKind::Sentinel => &SENTINEL_CHECKS,
        }
    }

    /// Default login name when the caller supplies none
    pub fn default_username(&self) -> Option<&'static str> {
        match self {
            MiddlewareKind::Mysql => Some("root"),
            MiddlewareKind::Redis | MiddlewareKind::Sentinel => None,
        }
    }

    /// Lightweight authenticated command. The password travels in the
    /// client's environment variable, not its argument list.
    pub fn auth_command(&self, binary: &str, port: u16, username: Option<&str>, password: &str) -> String {
        match self {
            MiddlewareKind::Mysql => self.mysqladmin(binary, port, username, password, "status"),
            MiddlewareKind::Redis | MiddlewareKind::Sentinel => {
                self.redis_cli(binary, port, username, password, "ping")
            }
        }
    }

    /// Command whose output carries runtime metrics
    pub fn metrics_command(&self, binary: &str, port: u16, username: Option<&str>, password: &str) -> String {
        match self {
            MiddlewareKind::Mysql => self.mysqladmin(binary, port, username, password, "status"),
            MiddlewareKind::Redis => self.redis_cli(binary, port, username, password, "info"),
            MiddlewareKind::Sentinel => self.redis_cli(binary, port, username, password, "info"),
        }
    }

    fn mysqladmin(&self, binary: &str, port: u16, username: Option<&str>, password: &str, verb: &str) -> String {
        let user = username.or(self.default_username()).unwrap_or("root");
        format!(
            "MYSQL_PWD={} {} --connect-timeout=5 -u {} -P {} -h 127.0.0.1 {}",
            shell_quote(password),
            binary,
            shell_quote(user),
            port,
            verb
        )
    }

    fn redis_cli(&self, binary: &str, port: u16, username: Option<&str>, password: &str, verb: &str) -> String {
        let auth = if password.is_empty() {
            String::new()
        } else {
            format!("REDISCLI_AUTH={} ", shell_quote(password))
        };
        let user = username
            .filter(|u| !u.is_empty())
            .map(|u| format!(" --user {}", shell_quote(u)))
            .unwrap_or_default();
        format!("{}{} -h 127.0.0.1 -p {}{} {}", auth, binary, port, user, verb)
    }

    /// Classify the output of [`auth_command`](Self::auth_command)
    pub fn classify_auth(&self, result: &CommandResult) -> AuthOutcome {
        let text = format!("{}\n{}", result.stdout, result.stderr).to_lowercase();
        if result.exit_code == Some(127)
            || text.contains("command not found")
            || text.contains("no such file or directory")
        {
            return AuthOutcome::ClientMissing;
        }

        match self {
            MiddlewareKind::Mysql => {
                if text.contains("access denied") {
                    AuthOutcome::Denied
                } else if text.contains("can't connect")
                    || text.contains("lost connection")
                    || text.contains("connection refused")
                {
                    AuthOutcome::Unreachable(result.diagnostic().to_string())
                } else if result.success() && text.contains("uptime") {
                    AuthOutcome::Valid
                } else {
                    AuthOutcome::Inconclusive(result.diagnostic().to_string())
                }
            }
            MiddlewareKind::Redis | MiddlewareKind::Sentinel => {
                if text.contains("wrongpass")
                    || text.contains("invalid password")
                    || text.contains("invalid username-password")
                    || text.contains("noauth")
                {
                    AuthOutcome::Denied
                } else if text.contains("could not connect") || text.contains("connection refused") {
                    AuthOutcome::Unreachable(result.diagnostic().to_string())
                } else if result.stdout_trimmed().eq_ignore_ascii_case("pong") {
                    AuthOutcome::Valid
                } else {
                    AuthOutcome::Inconclusive(result.diagnostic().to_string())
                }
            }
        }
    }

    /// First process pattern, in table order, found in `ps -eo args=` output
    pub fn match_process(&self, ps_output: &str) -> Option<&'static str> {
        let table = self.checks();
        let lines: Vec<&str> = ps_output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| !table.process_excludes.iter().any(|ex| line.contains(ex)))
            .collect();

        table
            .process_patterns
            .iter()
            .find(|(pattern, _)| lines.iter().any(|line| line.contains(pattern) || line.ends_with(pattern.trim_end())))
            .map(|(_, service)| *service)
    }
}

impl std::fmt::Display for MiddlewareKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MiddlewareKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" => Ok(MiddlewareKind::Mysql),
            "redis" => Ok(MiddlewareKind::Redis),
            "sentinel" | "redis-sentinel" => Ok(MiddlewareKind::Sentinel),
            other => Err(EngineError::ValidationError(format!(
                "unsupported middleware type '{}'",
                other
            ))),
        }
    }
}
