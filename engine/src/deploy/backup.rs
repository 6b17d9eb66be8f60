//! Site backups on a target

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone};

use crate::deploy::model::BackupRecord;
use crate::errors::EngineError;
use crate::ssh::command::shell_quote;
use crate::ssh::ManagedSession;
use crate::storage::settings::SiteLayout;

const NAME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Timestamp part of a well-formed backup name
fn stamp(name: &str) -> Option<&str> {
    let stamp = name.strip_prefix("html_")?.strip_suffix(".tar.gz")?;
    let well_formed = stamp.len() == 15
        && stamp
            .char_indices()
            .all(|(i, c)| if i == 8 { c == '_' } else { c.is_ascii_digit() });
    well_formed.then_some(stamp)
}

/// `html_YYYYmmdd_HHMMSS.tar.gz`, nothing else
pub fn validate_backup_name(name: &str) -> Result<(), EngineError> {
    match created_at(name) {
        Some(_) => Ok(()),
        None => Err(EngineError::ValidationError(format!("invalid backup name '{}'", name))),
    }
}

pub fn backup_name_at<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("html_{}.tar.gz", at.format(NAME_FORMAT))
}

/// Creation time encoded in a backup name, `YYYY-mm-dd HH:MM:SS`
pub fn created_at(name: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(stamp(name)?, NAME_FORMAT).ok()?;
    Some(parsed.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub fn listing_command(layout: &SiteLayout) -> String {
    format!(
        "for f in {}/html_*.tar.gz; do [ -f \"$f\" ] && stat -c '%s %n' \"$f\"; done; true",
        shell_quote(layout.backup_dir.trim_end_matches('/'))
    )
}

/// Parse `<bytes> <path>` lines, newest first. Files not named like a
/// backup are skipped.
pub fn parse_listing(output: &str) -> Vec<BackupRecord> {
    let mut records: Vec<BackupRecord> = output
        .lines()
        .filter_map(|line| {
            let (size, path) = line.trim().split_once(' ')?;
            let name = path.rsplit('/').next()?.to_string();
            let created_at = created_at(&name)?;
            Some(BackupRecord {
                size: size.parse().ok()?,
                name,
                created_at,
            })
        })
        .collect();
    records.sort_by(|a, b| b.name.cmp(&a.name));
    records
}

pub async fn list_backups(
    session: &ManagedSession,
    layout: &SiteLayout,
    timeout: Duration,
) -> Result<Vec<BackupRecord>, EngineError> {
    let output = session
        .exec_privileged(&listing_command(layout), timeout)
        .await?
        .into_checked()?;
    Ok(parse_listing(&output))
}
