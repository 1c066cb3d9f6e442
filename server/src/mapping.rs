//! Account to recipient mapping.
//!
//! Two optional sources feed one merged mapping: the organization
//! directory as the base, and a custom table of overrides on top. The
//! origin of every entry is tracked because the master report lists
//! where each recipient came from.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;

use crate::error::AppResult;

#[async_trait]
pub trait MappingSource: Send + Sync {
    /// The full account_id -> email mapping from this source.
    async fn fetch(&self) -> AppResult<IndexMap<String, String>>;
}

/// Fixed mapping, loaded from config or built in tests.
pub struct StaticMapping {
    entries: IndexMap<String, String>,
}

impl StaticMapping {
    pub fn new(entries: IndexMap<String, String>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl MappingSource for StaticMapping {
    async fn fetch(&self) -> AppResult<IndexMap<String, String>> {
        Ok(self.entries.clone())
    }
}

/// Mapping loaded from a JSON object file (`{"account_id": "email"}`).
pub struct JsonFileMapping {
    path: String,
}

impl JsonFileMapping {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MappingSource for JsonFileMapping {
    async fn fetch(&self) -> AppResult<IndexMap<String, String>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("could not read mapping file {}: {}", self.path, e))?;
        let entries: IndexMap<String, String> = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid mapping file {}: {}", self.path, e))?;
        Ok(entries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MappingOrigin {
    Organization,
    Custom,
    /// Present in the organization source but overridden by custom.
    Combined,
}

#[derive(Debug, Default)]
pub struct AccountMapping {
    account_to_email: IndexMap<String, String>,
    email_to_accounts: IndexMap<String, Vec<String>>,
    origins: HashMap<String, MappingOrigin>,
}

impl AccountMapping {
    /// Merge the enabled sources. A source that fails to load is
    /// logged and treated as empty; the run continues with whatever
    /// mapping remains (unmapped accounts fall back to the default
    /// recipients at dispatch time).
    pub async fn load(
        organization: Option<&dyn MappingSource>,
        custom: Option<&dyn MappingSource>,
    ) -> Self {
        let mut mapping = AccountMapping::default();

        if let Some(source) = organization {
            match source.fetch().await {
                Ok(entries) => {
                    tracing::info!("Loaded {} organization account mappings", entries.len());
                    for (account_id, email) in entries {
                        mapping.insert(account_id, email, MappingOrigin::Organization);
                    }
                }
                Err(e) => tracing::error!("Failed to load organization mapping: {}", e),
            }
        }

        if let Some(source) = custom {
            match source.fetch().await {
                Ok(entries) => {
                    tracing::info!("Loaded {} custom account mappings", entries.len());
                    mapping.apply_custom(entries);
                }
                Err(e) => tracing::error!("Failed to load custom mapping: {}", e),
            }
        }

        if mapping.is_empty() {
            tracing::info!("No account mapping configured, all reports go to default recipients");
        } else {
            tracing::info!(
                "Combined mapping covers {} accounts across {} recipients",
                mapping.account_to_email.len(),
                mapping.email_to_accounts.len()
            );
        }

        mapping
    }

    fn insert(&mut self, account_id: String, email: String, origin: MappingOrigin) {
        self.origins.insert(account_id.clone(), origin);
        self.email_to_accounts
            .entry(email.clone())
            .or_default()
            .push(account_id.clone());
        self.account_to_email.insert(account_id, email);
    }

    /// Custom entries override organization entries. An account whose
    /// custom email matches its organization email keeps the
    /// organization origin label; see DESIGN.md.
    fn apply_custom(&mut self, entries: IndexMap<String, String>) {
        let mut overridden = 0usize;
        let mut added = 0usize;

        for (account_id, new_email) in entries {
            match self.account_to_email.get(&account_id).cloned() {
                Some(old_email) if old_email != new_email => {
                    overridden += 1;
                    self.origins
                        .insert(account_id.clone(), MappingOrigin::Combined);
                    if let Some(accounts) = self.email_to_accounts.get_mut(&old_email) {
                        accounts.retain(|a| a != &account_id);
                        if accounts.is_empty() {
                            self.email_to_accounts.shift_remove(&old_email);
                        }
                    }
                }
                Some(_) => {
                    self.origins
                        .insert(account_id.clone(), MappingOrigin::Organization);
                }
                None => {
                    added += 1;
                    self.origins.insert(account_id.clone(), MappingOrigin::Custom);
                }
            }

            let accounts = self.email_to_accounts.entry(new_email.clone()).or_default();
            if !accounts.contains(&account_id) {
                accounts.push(account_id.clone());
            }
            self.account_to_email.insert(account_id, new_email);
        }

        if overridden > 0 {
            tracing::info!("Custom mapping overrode {} organization entries", overridden);
        }
        if added > 0 {
            tracing::info!("Custom mapping added {} accounts not in organization", added);
        }
    }

    pub fn email_for(&self, account_id: &str) -> Option<&str> {
        self.account_to_email.get(account_id).map(String::as_str)
    }

    pub fn origin_for(&self, account_id: &str) -> Option<MappingOrigin> {
        self.origins.get(account_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.account_to_email.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: &[(&str, &str)]) -> StaticMapping {
        StaticMapping::new(
            entries
                .iter()
                .map(|(a, e)| (a.to_string(), e.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn custom_overrides_organization() {
        let org = source(&[("111122223333", "ops@example.com")]);
        let custom = source(&[("111122223333", "platform@example.com")]);

        let mapping = AccountMapping::load(Some(&org), Some(&custom)).await;

        assert_eq!(
            mapping.email_for("111122223333"),
            Some("platform@example.com")
        );
        assert_eq!(
            mapping.origin_for("111122223333"),
            Some(MappingOrigin::Combined)
        );
    }

    #[tokio::test]
    async fn custom_only_accounts_are_labelled_custom() {
        let org = source(&[("111122223333", "ops@example.com")]);
        let custom = source(&[("444455556666", "dev@example.com")]);

        let mapping = AccountMapping::load(Some(&org), Some(&custom)).await;

        assert_eq!(
            mapping.origin_for("111122223333"),
            Some(MappingOrigin::Organization)
        );
        assert_eq!(
            mapping.origin_for("444455556666"),
            Some(MappingOrigin::Custom)
        );
    }

    #[tokio::test]
    async fn matching_emails_keep_the_organization_label() {
        // Both sources agree; the entry stays attributed to the
        // organization even though custom technically wrote it last.
        let org = source(&[("111122223333", "ops@example.com")]);
        let custom = source(&[("111122223333", "ops@example.com")]);

        let mapping = AccountMapping::load(Some(&org), Some(&custom)).await;

        assert_eq!(mapping.email_for("111122223333"), Some("ops@example.com"));
        assert_eq!(
            mapping.origin_for("111122223333"),
            Some(MappingOrigin::Organization)
        );
    }

    #[tokio::test]
    async fn disabled_sources_yield_an_empty_mapping() {
        let mapping = AccountMapping::load(None, None).await;
        assert!(mapping.is_empty());
        assert_eq!(mapping.email_for("111122223333"), None);
    }
}
