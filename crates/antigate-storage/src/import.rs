use serde::Deserialize;

use crate::credential::{CredentialRecord, unix_ms};
use crate::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub replace_existing: bool,
    pub filter_disabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub total: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlAccountsFile {
    accounts: Vec<TomlAccount>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlAccount {
    refresh_token: String,
    access_token: Option<String>,
    expires_in: Option<i64>,
    issued_at: Option<i64>,
    project_id: Option<String>,
    email: Option<String>,
    disabled: bool,
}

/// Parse a pasted `[[accounts]]` TOML document into normalized records.
/// Accounts without a refresh token are dropped; a `disabled = true` flag
/// becomes `enabled = false` so the import filter can act on it.
pub fn parse_toml_accounts(body: &str) -> StorageResult<Vec<CredentialRecord>> {
    let file: TomlAccountsFile =
        toml::from_str(body).map_err(|err| StorageError::Toml(err.to_string()))?;

    let now = unix_ms();
    let records = file
        .accounts
        .into_iter()
        .filter(|account| !account.refresh_token.trim().is_empty())
        .map(|account| CredentialRecord {
            refresh_token: account.refresh_token,
            access_token: account.access_token,
            expires_in: account.expires_in,
            issued_at: account.issued_at,
            project_id: account.project_id,
            email: account.email,
            enabled: !account.disabled,
            created_at: Some(now),
        })
        .collect();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_accounts_and_disabled_flag() {
        let body = r#"
[[accounts]]
refresh_token = "rt-1"
email = "a@example.com"

[[accounts]]
refresh_token = "rt-2"
disabled = true
"#;
        let records = parse_toml_accounts(body).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].enabled);
        assert_eq!(records[0].email.as_deref(), Some("a@example.com"));
        assert!(!records[1].enabled);
    }

    #[test]
    fn blank_refresh_token_dropped() {
        let body = r#"
[[accounts]]
refresh_token = ""

[[accounts]]
refresh_token = "rt-1"
"#;
        let records = parse_toml_accounts(body).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn invalid_toml_rejected() {
        let err = parse_toml_accounts("not [ valid").unwrap_err();
        assert!(matches!(err, StorageError::Toml(_)));
    }
}
