//! Durable rule management
//!
//! The rule service owns the stored rule list and keeps the live [`RuleSet`]
//! read by the capture layer in step with it.

use crate::error::{StoreError, StoreResult};
use crate::store::TransactionStore;
use capture_core::rules::{export_rules, import_rules};
use capture_core::{now_millis, NetworkRule, RuleSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

/// How imported rules combine with the stored ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Upsert imported rules, keep everything else
    #[default]
    Merge,
    /// Stored rules become exactly the imported list
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct RuleService {
    store: TransactionStore,
    rules: RuleSet,
}

impl RuleService {
    /// Create the service and publish the stored rules into `rules`
    pub async fn load(store: TransactionStore, rules: RuleSet) -> StoreResult<Self> {
        let service = Self { store, rules };
        service.refresh().await?;
        info!("✓ Loaded {} rules", service.rules.len());
        Ok(service)
    }

    /// Live rule snapshot shared with the capture layer
    pub fn rule_set(&self) -> &RuleSet {
        &self.rules
    }

    pub async fn list(&self) -> StoreResult<Vec<NetworkRule>> {
        self.store.list_rules().await
    }

    pub async fn get(&self, id: &str) -> StoreResult<NetworkRule> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| StoreError::RuleNotFound(id.to_string()))
    }

    /// Insert or update a rule. A blank id gets a generated one.
    pub async fn save(&self, mut rule: NetworkRule) -> StoreResult<NetworkRule> {
        if rule.id.trim().is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }
        warn_issues(&rule);
        rule.last_modified = now_millis();

        self.store.upsert_rule(&rule).await?;
        self.refresh().await?;

        info!("Saved rule '{}' ({})", rule.name, rule.id);
        Ok(rule)
    }

    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        if !self.store.delete_rule(id).await? {
            return Err(StoreError::RuleNotFound(id.to_string()));
        }
        self.refresh().await?;

        info!("Deleted rule {}", id);
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> StoreResult<NetworkRule> {
        let mut rule = self.get(id).await?;
        rule.enabled = enabled;
        rule.last_modified = now_millis();

        self.store.upsert_rule(&rule).await?;
        self.refresh().await?;
        Ok(rule)
    }

    /// Stored rules as a pretty JSON array
    pub async fn export_json(&self) -> StoreResult<String> {
        let rules = self.list().await?;
        Ok(export_rules(&rules)?)
    }

    pub async fn import_json(&self, json: &str, mode: ImportMode) -> StoreResult<ImportSummary> {
        let imported = import_rules(json)?;
        imported.iter().for_each(warn_issues);

        let existing: HashSet<String> = self
            .list()
            .await?
            .into_iter()
            .map(|rule| rule.id)
            .collect();
        let incoming: HashSet<&str> = imported.iter().map(|rule| rule.id.as_str()).collect();

        let added = imported
            .iter()
            .filter(|rule| !existing.contains(&rule.id))
            .count();
        let removed = match mode {
            ImportMode::Merge => {
                self.store.upsert_rules(&imported).await?;
                0
            }
            ImportMode::Replace => {
                self.store.replace_rules(&imported).await?;
                existing
                    .iter()
                    .filter(|id| !incoming.contains(id.as_str()))
                    .count()
            }
        };
        self.refresh().await?;

        let summary = ImportSummary {
            imported: imported.len(),
            added,
            updated: imported.len() - added,
            removed,
        };
        info!(
            "Imported {} rules ({:?}): {} added, {} updated, {} removed",
            summary.imported, mode, summary.added, summary.updated, summary.removed
        );
        Ok(summary)
    }

    /// Republish the stored rules to the live rule set
    pub async fn refresh(&self) -> StoreResult<()> {
        let rules = self.store.list_rules().await?;
        self.rules.replace(rules);
        Ok(())
    }
}

fn warn_issues(rule: &NetworkRule) {
    for issue in rule.issues() {
        warn!("Rule '{}' ({}): {}", rule.name, rule.id, issue);
    }
}
