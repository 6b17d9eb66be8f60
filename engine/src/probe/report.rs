//! Verification report

use std::collections::BTreeMap;

use serde::Serialize;

/// Aggregated probe results for one target and middleware.
///
/// Only built through [`ReportBuilder::finish`], which derives `success`
/// from the blocking checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    ssh_ok: bool,
    port_reachable: bool,
    service_active: bool,
    auth_valid: bool,
    auth_message: Option<String>,
    log_path_found: bool,
    suggested_log_path: Option<String>,
    suggested_service_name: Option<String>,
    success: bool,
    message: String,
    raw_details: BTreeMap<String, String>,
}

impl VerificationReport {
    pub fn ssh_ok(&self) -> bool {
        self.ssh_ok
    }

    pub fn port_reachable(&self) -> bool {
        self.port_reachable
    }

    pub fn service_active(&self) -> bool {
        self.service_active
    }

    pub fn auth_valid(&self) -> bool {
        self.auth_valid
    }

    pub fn auth_message(&self) -> Option<&str> {
        self.auth_message.as_deref()
    }

    pub fn log_path_found(&self) -> bool {
        self.log_path_found
    }

    pub fn suggested_log_path(&self) -> Option<&str> {
        self.suggested_log_path.as_deref()
    }

    pub fn suggested_service_name(&self) -> Option<&str> {
        self.suggested_service_name.as_deref()
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn raw_details(&self) -> &BTreeMap<String, String> {
        &self.raw_details
    }
}

/// Mutable accumulator used while checks run
#[derive(Debug, Default)]
pub struct ReportBuilder {
    pub ssh_ok: bool,
    pub port_reachable: bool,
    pub service_active: bool,
    pub auth_valid: bool,
    /// False when no credentials were supplied
    pub auth_attempted: bool,
    pub auth_message: Option<String>,
    pub suggested_log_path: Option<String>,
    pub suggested_service_name: Option<String>,
    raw_details: BTreeMap<String, String>,
}

impl ReportBuilder {
    pub fn detail(&mut self, key: &str, value: impl ToString) {
        self.raw_details.insert(key.to_string(), value.to_string());
    }

    pub fn finish(self, message: impl Into<String>) -> VerificationReport {
        // Nothing but the SSH failure is reported once SSH is down
        let ssh_ok = self.ssh_ok;
        let gate = |flag: bool| ssh_ok && flag;

        let port_reachable = gate(self.port_reachable);
        let auth_valid = gate(self.auth_valid);
        let suggested_log_path = self.suggested_log_path.filter(|_| ssh_ok);

        VerificationReport {
            ssh_ok,
            port_reachable,
            service_active: gate(self.service_active),
            auth_valid,
            auth_message: self.auth_message.filter(|_| ssh_ok),
            log_path_found: suggested_log_path.is_some(),
            suggested_log_path,
            suggested_service_name: self.suggested_service_name.filter(|_| ssh_ok),
            success: ssh_ok && port_reachable && auth_valid,
            message: message.into(),
            raw_details: self.raw_details,
        }
    }
}
