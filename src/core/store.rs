//! Rule store and rule file persistence
//!
//! [`RuleStore`] is the ordered, in-memory source of truth for the declared
//! rules. Order matters: it is the order in which active rules are appended
//! to their chains, and therefore their evaluation priority.
//!
//! [`RuleRepository`] is the persistence seam. [`JsonRuleFile`] stores the
//! rules as a JSON array next to a SHA-256 checksum sidecar, written
//! atomically (temp file + rename).

use crate::core::error::{Error, Result};
use crate::core::firewall::{MAX_RULES, Rule};
use crate::utils::get_data_dir;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Error type for rule file operations
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Data directory not available")]
    DataDirUnavailable,

    #[error("Rule file contains {found} rules (max: {max})")]
    TooManyRules { found: usize, max: usize },
}

/// Loads and saves the declared rule set
pub trait RuleRepository: Send + Sync {
    /// Returns the persisted rules in their stored order.
    fn load(&self) -> impl Future<Output = std::result::Result<Vec<Rule>, PersistenceError>> + Send;

    /// Overwrites the persisted set with `rules`.
    fn save(
        &self,
        rules: &[Rule],
    ) -> impl Future<Output = std::result::Result<(), PersistenceError>> + Send;
}

/// Ordered collection of rules with unique ids
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    rules: Vec<Rule>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from loaded rules. Later duplicates of an id are dropped.
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        let mut seen = HashSet::with_capacity(rules.len());
        let rules = rules
            .into_iter()
            .filter(|r| {
                let fresh = seen.insert(r.id);
                if !fresh {
                    warn!(rule_id = %r.id, "Dropping duplicate rule id");
                }
                fresh
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == *id)
    }

    pub(crate) fn get_mut(&mut self, id: &Uuid) -> Option<&mut Rule> {
        self.rules.iter_mut().find(|r| r.id == *id)
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Rule> {
        self.rules.iter_mut()
    }

    /// Appends a rule at the end of the store.
    pub(crate) fn push(&mut self, rule: Rule) -> Result<()> {
        if self.rules.len() >= MAX_RULES {
            return Err(Error::validation(
                "rules",
                format!("Rule limit reached (max {MAX_RULES})"),
            ));
        }
        if self.get(&rule.id).is_some() {
            return Err(Error::Internal(format!("Duplicate rule id {}", rule.id)));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Removes a rule, preserving the order of the others.
    pub(crate) fn remove(&mut self, id: &Uuid) -> Option<Rule> {
        let index = self.rules.iter().position(|r| r.id == *id)?;
        Some(self.rules.remove(index))
    }

    /// Resolves a full id or a unique id prefix (as shown by `list`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when nothing matches and a validation
    /// error when the text is empty or the prefix is ambiguous.
    pub fn resolve(&self, text: &str) -> Result<Uuid> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::validation("id", "Rule id cannot be empty"));
        }

        if let Ok(id) = Uuid::parse_str(&needle) {
            return self
                .get(&id)
                .map(|r| r.id)
                .ok_or_else(|| Error::NotFound(text.trim().to_string()));
        }

        let mut matches = self
            .rules
            .iter()
            .filter(|r| r.id.to_string().starts_with(&needle));
        match (matches.next(), matches.next()) {
            (Some(rule), None) => Ok(rule.id),
            (None, _) => Err(Error::NotFound(text.trim().to_string())),
            (Some(_), Some(_)) => Err(Error::validation(
                "id",
                format!("'{}' matches more than one rule", text.trim()),
            )),
        }
    }
}

fn checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Decodes a rule file body.
///
/// The body must be a JSON array. Individual records that fail to decode or
/// violate rule invariants are skipped with a warning, as are records whose
/// id repeats an earlier one.
pub fn decode_rules(json: &str) -> std::result::Result<Vec<Rule>, PersistenceError> {
    let records: Vec<serde_json::Value> = serde_json::from_str(json)?;

    // Validate rule count to prevent memory exhaustion
    if records.len() > MAX_RULES {
        return Err(PersistenceError::TooManyRules {
            found: records.len(),
            max: MAX_RULES,
        });
    }

    let mut rules = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<Rule>(record) {
            Ok(rule) => match rule.validate() {
                Ok(()) => rules.push(rule),
                Err(e) => warn!("Skipping invalid rule record #{index}: {e}"),
            },
            Err(e) => warn!("Skipping malformed rule record #{index}: {e}"),
        }
    }

    Ok(RuleStore::from_rules(rules).rules)
}

/// JSON rule file with checksum sidecar
#[derive(Debug, Clone)]
pub struct JsonRuleFile {
    path: PathBuf,
}

impl JsonRuleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/rules.json`
    pub fn default_path() -> std::result::Result<PathBuf, PersistenceError> {
        let mut path = get_data_dir().ok_or(PersistenceError::DataDirUnavailable)?;
        path.push("rules.json");
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checksum_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".sha256");
        PathBuf::from(path)
    }
}

impl RuleRepository for JsonRuleFile {
    async fn load(&self) -> std::result::Result<Vec<Rule>, PersistenceError> {
        if !tokio::fs::try_exists(&self.path).await? {
            info!("No rule file at {:?}, starting empty", self.path);
            return Ok(Vec::new());
        }

        let json = tokio::fs::read_to_string(&self.path).await?;

        // Verify checksum if present (warns but doesn't fail for manually edited files)
        if let Ok(expected) = tokio::fs::read_to_string(self.checksum_path()).await {
            let actual = checksum(&json);
            if expected.trim() != actual {
                warn!(
                    "Rule file {:?} checksum mismatch (expected: {}, got: {})",
                    self.path,
                    expected.trim(),
                    actual
                );
            }
        }

        let rules = decode_rules(&json)?;
        info!("Loaded {} rule(s) from {:?}", rules.len(), self.path);
        Ok(rules)
    }

    async fn save(&self, rules: &[Rule]) -> std::result::Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(rules)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            // Set restrictive permissions (0o600) BEFORE writing firewall rules
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)
                .await?;

            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(&temp_path, &json).await?;
        }

        tokio::fs::rename(&temp_path, &self.path).await?;
        tokio::fs::write(self.checksum_path(), checksum(&json)).await?;

        info!("Saved {} rule(s) to {:?}", rules.len(), self.path);
        Ok(())
    }
}
