//! Firewall manager: rule operations and the reconciliation pass
//!
//! [`FirewallManager`] owns the [`RuleStore`] and drives the two
//! collaborators: a [`Gateway`] to the live packet filter and a
//! [`RuleRepository`] for persistence.
//!
//! # Reconciliation
//!
//! [`FirewallManager::apply`] makes the live chains match the declared active
//! rules in three phases:
//!
//! 1. **Cleaning**: the delete form of every rule (active or not) is executed
//!    with the rule's own tag. "No such entry" is not an error.
//! 2. **Sweeping**: every built-in chain is listed and each entry still
//!    tagged with the id of a stored rule is deleted. Such entries were
//!    inserted with fields the rule no longer has, so the delete built in
//!    Cleaning could not match them. With `sweep_untracked`, entries tagged
//!    with the id of no stored rule (removed while the backend disagreed)
//!    are deleted too. Comments that are not a `phoque-<uuid>` tag are
//!    never touched.
//! 3. **Inserting**: the append form of every active rule is executed in store
//!    order, which is also evaluation order.
//!
//! A failing command never aborts the pass. All failures are collected in the
//! returned [`ApplyReport`].
//!
//! # Persistence
//!
//! Every mutating operation saves the full rule set afterwards. A failed save
//! is handed back next to the operation's result; the in-memory state keeps
//! the mutation either way.

use crate::audit::{ApplySummary, AuditLog};
use crate::core::compiler::{IptablesCommand, compile};
use crate::core::error::{Error, Result};
use crate::core::firewall::{Chain, MAX_RULES, Rule, RuleSpec};
use crate::core::gateway::{ExecOutcome, Gateway};
use crate::core::store::{RuleRepository, RuleStore};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Phase of a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
    #[strum(serialize = "cleaning")]
    Cleaning,
    #[strum(serialize = "sweeping")]
    Sweeping,
    #[strum(serialize = "inserting")]
    Inserting,
}

/// One command that failed during a pass
#[derive(Debug)]
pub struct ApplyFailure {
    /// Rule the command belonged to, when known
    pub rule_id: Option<Uuid>,
    pub phase: Phase,
    /// The iptables arguments, when a command was built
    pub command: Option<String>,
    pub error: Error,
}

/// Outcome of a reconciliation pass
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Entries removed by per-rule delete forms
    pub removed: usize,
    /// Per-rule delete forms that matched no live entry
    pub missing: usize,
    /// Leftover tagged entries removed by the sweep
    pub swept: usize,
    /// Active rules appended
    pub inserted: usize,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, phase: Phase, rule_id: Option<Uuid>, command: Option<&IptablesCommand>, error: Error) {
        error!(%phase, rule_id = ?rule_id, "{error}");
        self.failures.push(ApplyFailure {
            rule_id,
            phase,
            command: command.map(ToString::to_string),
            error,
        });
    }
}

/// Target state chosen by toggle-all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleTarget {
    /// Every rule is inactive: turn all on
    ActivateAll,
    /// Every rule is active: turn all off
    DeactivateAll,
    /// Mixed: turn the remainder on
    ActivateRemaining,
}

impl ToggleTarget {
    /// The `active` value every rule ends up with
    pub const fn active(self) -> bool {
        !matches!(self, ToggleTarget::DeactivateAll)
    }

    /// Label shown for the toggle-all action
    pub const fn label(self) -> &'static str {
        match self {
            ToggleTarget::ActivateAll => "toggle all",
            ToggleTarget::DeactivateAll => "untoggle all",
            ToggleTarget::ActivateRemaining => "toggle remaining",
        }
    }
}

/// Computes the toggle-all target for a rule set; `None` when it is empty.
pub fn toggle_all_target(rules: &[Rule]) -> Option<ToggleTarget> {
    if rules.is_empty() {
        return None;
    }
    let active = rules.iter().filter(|r| r.active).count();
    Some(if active == rules.len() {
        ToggleTarget::DeactivateAll
    } else if active == 0 {
        ToggleTarget::ActivateAll
    } else {
        ToggleTarget::ActivateRemaining
    })
}

/// Result of a mutating operation plus the outcome of the save that followed
#[derive(Debug)]
pub struct Saved<T> {
    pub value: T,
    /// Set when saving the rule set failed; the mutation is kept in memory
    pub persist_error: Option<Error>,
}

impl<T> Saved<T> {
    pub fn persisted(&self) -> bool {
        self.persist_error.is_none()
    }
}

/// A rule removed from the store
#[derive(Debug)]
pub struct Removal {
    pub rule: Rule,
    /// Set when the rule was active and its delete form failed
    pub deapply_error: Option<Error>,
}

/// A toggled rule and the pass that followed
#[derive(Debug)]
pub struct Toggled {
    pub rule: Rule,
    pub report: ApplyReport,
}

/// Toggle-all outcome; `target` is `None` for an empty store
#[derive(Debug, Default)]
pub struct ToggledAll {
    pub target: Option<ToggleTarget>,
    pub report: ApplyReport,
}

/// Owns the declared rules and reconciles them with the backend
#[derive(Debug)]
pub struct FirewallManager<G, R> {
    store: RuleStore,
    gateway: G,
    repository: R,
    /// Also sweep tagged entries whose id names no stored rule
    sweep_untracked: bool,
    audit: Option<AuditLog>,
}

impl<G: Gateway, R: RuleRepository> FirewallManager<G, R> {
    /// Loads the persisted rules once and builds a manager around them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the rule file cannot be loaded.
    pub async fn open(gateway: G, repository: R, sweep_untracked: bool) -> Result<Self> {
        let rules = repository.load().await?;
        info!(
            rules = rules.len(),
            active = rules.iter().filter(|r| r.active).count(),
            "Firewall manager ready"
        );
        Ok(Self {
            store: RuleStore::from_rules(rules),
            gateway,
            repository,
            sweep_untracked,
            audit: None,
        })
    }

    /// Attaches an audit trail for passes and de-applies.
    #[must_use]
    pub fn with_audit(mut self, audit: Option<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn rules(&self) -> &[Rule] {
        self.store.rules()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Rule> {
        self.store.get(id)
    }

    /// Resolves a full id or unique id prefix.
    ///
    /// # Errors
    ///
    /// See [`RuleStore::resolve`].
    pub fn resolve(&self, text: &str) -> Result<Uuid> {
        self.store.resolve(text)
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn toggle_all_target(&self) -> Option<ToggleTarget> {
        toggle_all_target(self.store.rules())
    }

    /// Label for the toggle-all action in the current state
    pub fn toggle_all_label(&self) -> &'static str {
        self.toggle_all_target()
            .map_or(ToggleTarget::ActivateAll.label(), ToggleTarget::label)
    }

    async fn persist(&self) -> Option<Error> {
        match self.repository.save(self.store.rules()).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Failed to save rules: {e}");
                Some(e.into())
            }
        }
    }

    async fn saved<T>(&self, value: T) -> Saved<T> {
        Saved {
            value,
            persist_error: self.persist().await,
        }
    }

    /// Validates `spec` and appends a new inactive rule. The backend is not touched.
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid fields or when the store is full.
    pub async fn add(&mut self, spec: RuleSpec) -> Result<Saved<Rule>> {
        if self.store.len() >= MAX_RULES {
            return Err(Error::validation(
                "rules",
                format!("Rule limit reached (max {MAX_RULES})"),
            ));
        }
        let rule = spec.into_rule(Uuid::new_v4())?;
        self.store.push(rule.clone())?;
        info!(rule_id = %rule.id, "Added rule: {}", rule.summary());
        Ok(self.saved(rule).await)
    }

    /// Overwrites a rule's fields in place, keeping its id and `active` flag.
    /// Live entries only change on the next [`apply`](Self::apply).
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid fields or [`Error::NotFound`].
    pub async fn edit(&mut self, id: &Uuid, spec: &RuleSpec) -> Result<Saved<Rule>> {
        let fields = spec.validate()?;
        let rule = self
            .store
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        rule.overwrite(fields);
        let rule = rule.clone();
        info!(rule_id = %rule.id, "Edited rule: {}", rule.summary());
        Ok(self.saved(rule).await)
    }

    /// Removes a rule. An active rule is de-applied first; a failing de-apply
    /// is reported in the result but the rule is removed regardless.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub async fn remove(&mut self, id: &Uuid) -> Result<Saved<Removal>> {
        let rule = self
            .store
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let deapply_error = if rule.active {
            self.deapply(&rule).await
        } else {
            None
        };

        self.store.remove(id);
        info!(rule_id = %rule.id, "Removed rule: {}", rule.summary());
        Ok(self
            .saved(Removal {
                rule,
                deapply_error,
            })
            .await)
    }

    /// Deletes the rule's current entry, then any entry still carrying its
    /// tag from before an edit. Returns the first error.
    async fn deapply(&self, rule: &Rule) -> Option<Error> {
        let command = compile(rule, &rule.tag()).delete;
        let mut error = match self.gateway.execute(&command).await {
            Ok(ExecOutcome::Applied) => {
                debug!(rule_id = %rule.id, "De-applied live entry");
                None
            }
            Ok(ExecOutcome::Missing) => {
                debug!(rule_id = %rule.id, "No live entry to de-apply");
                None
            }
            Err(e) => Some(e),
        };

        let mut leftovers = ApplyReport::default();
        self.delete_tagged(|id| id == rule.id, &mut leftovers).await;
        if leftovers.swept > 0 {
            debug!(rule_id = %rule.id, count = leftovers.swept, "De-applied entries with older fields");
        }
        if error.is_none() {
            error = leftovers.failures.into_iter().next().map(|f| f.error);
        }
        if let Some(ref e) = error {
            warn!(rule_id = %rule.id, "De-apply failed, removing anyway: {e}");
        }

        if let Some(ref audit) = self.audit {
            audit
                .log_deapply(rule.id, error.as_ref().map(ToString::to_string))
                .await;
        }
        error
    }

    /// Flips a rule's `active` flag, saves, then runs a full pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub async fn toggle(&mut self, id: &Uuid) -> Result<Saved<Toggled>> {
        let rule = self
            .store
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        rule.active = !rule.active;
        let rule = rule.clone();
        info!(rule_id = %rule.id, active = rule.active, "Toggled rule");

        let persist_error = self.persist().await;
        let report = self.apply().await;
        Ok(Saved {
            value: Toggled { rule, report },
            persist_error,
        })
    }

    /// Applies the toggle-all target to every rule, saves, then runs a full
    /// pass. An empty store is left alone: no save, no backend commands.
    pub async fn toggle_all(&mut self) -> Saved<ToggledAll> {
        let Some(target) = self.toggle_all_target() else {
            debug!("Toggle-all on an empty rule set");
            return Saved {
                value: ToggledAll::default(),
                persist_error: None,
            };
        };

        let active = target.active();
        for rule in self.store.iter_mut() {
            rule.active = active;
        }
        info!(active, rules = self.store.len(), "Toggled all rules ({})", target.label());

        let persist_error = self.persist().await;
        let report = self.apply().await;
        Saved {
            value: ToggledAll {
                target: Some(target),
                report,
            },
            persist_error,
        }
    }

    /// Commands a pass would execute, in order: every rule's delete form,
    /// then the insert form of each active rule. Sweep deletes are not
    /// included since they depend on the live listing.
    pub fn plan(&self) -> Vec<IptablesCommand> {
        let rules = self.store.rules();
        let compiled: Vec<_> = rules.iter().map(|r| compile(r, &r.tag())).collect();

        let mut commands = Vec::with_capacity(rules.len() * 2);
        commands.extend(compiled.iter().map(|c| c.delete.clone()));
        commands.extend(
            rules
                .iter()
                .zip(compiled)
                .filter(|(rule, _)| rule.active)
                .map(|(_, c)| c.insert),
        );
        commands
    }

    /// Runs a reconciliation pass: Cleaning, Sweeping, Inserting.
    pub async fn apply(&mut self) -> ApplyReport {
        let rules = self.store.rules();
        let active_count = rules.iter().filter(|r| r.active).count();
        info!(rules = rules.len(), active = active_count, "Reconciliation pass started");

        let mut report = ApplyReport::default();

        debug!(phase = %Phase::Cleaning, "Removing tagged entries of every rule");
        for rule in rules {
            let command = compile(rule, &rule.tag()).delete;
            match self.gateway.execute(&command).await {
                Ok(ExecOutcome::Applied) => report.removed += 1,
                Ok(ExecOutcome::Missing) => report.missing += 1,
                Err(e) => report.fail(Phase::Cleaning, Some(rule.id), Some(&command), e),
            }
        }

        // Nothing can be tagged with a known id when the store is empty
        if self.sweep_untracked || !rules.is_empty() {
            let known: HashSet<Uuid> = rules.iter().map(|r| r.id).collect();
            let untracked = self.sweep_untracked;
            debug!(phase = %Phase::Sweeping, untracked, "Removing leftover tagged entries");
            self.delete_tagged(|id| untracked || known.contains(&id), &mut report)
                .await;
        }

        debug!(phase = %Phase::Inserting, "Appending active rules");
        for rule in rules.iter().filter(|r| r.active) {
            let command = compile(rule, &rule.tag()).insert;
            match self.gateway.execute(&command).await {
                Ok(_) => report.inserted += 1,
                Err(e) => report.fail(Phase::Inserting, Some(rule.id), Some(&command), e),
            }
        }

        if report.is_success() {
            info!(
                removed = report.removed,
                swept = report.swept,
                inserted = report.inserted,
                "Reconciliation pass finished"
            );
        } else {
            warn!(
                failures = report.failures.len(),
                inserted = report.inserted,
                "Reconciliation pass finished with failures"
            );
        }

        if let Some(ref audit) = self.audit {
            let summary = ApplySummary {
                rule_count: rules.len(),
                active_count,
                inserted: report.inserted,
                removed: report.removed,
                swept: report.swept,
                failures: report.failures.len(),
            };
            let first_error = report.failures.first().map(|f| f.error.to_string());
            audit.log_apply(summary, first_error).await;
        }

        report
    }

    /// Lists every built-in chain and deletes the entries whose
    /// `phoque-<uuid>` tag names an id accepted by `owned`. Deletions count as
    /// swept; listing and delete failures are recorded as Sweeping failures.
    async fn delete_tagged(&self, owned: impl Fn(Uuid) -> bool, report: &mut ApplyReport) {
        for chain in Chain::ALL {
            let listing = match self.gateway.list_chain(chain).await {
                Ok(lines) => lines,
                Err(e) => {
                    report.fail(Phase::Sweeping, None, None, e);
                    continue;
                }
            };

            for line in &listing {
                let Some(command) = IptablesCommand::delete_from_listing(line) else {
                    continue;
                };
                let Some(rule_id) = command.rule_id().filter(|id| owned(*id)) else {
                    continue;
                };

                match self.gateway.execute(&command).await {
                    Ok(ExecOutcome::Applied) => {
                        debug!(%chain, %rule_id, "Swept leftover entry");
                        report.swept += 1;
                    }
                    Ok(ExecOutcome::Missing) => {}
                    Err(e) => report.fail(Phase::Sweeping, Some(rule_id), Some(&command), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::create_test_rule;

    fn with_states(states: &[bool]) -> Vec<Rule> {
        states
            .iter()
            .enumerate()
            .map(|(i, &active)| {
                let mut rule = create_test_rule(u16::try_from(i + 1).unwrap());
                rule.active = active;
                rule
            })
            .collect()
    }

    #[test]
    fn test_toggle_all_target() {
        assert_eq!(toggle_all_target(&[]), None);
        assert_eq!(
            toggle_all_target(&with_states(&[true, true])),
            Some(ToggleTarget::DeactivateAll)
        );
        assert_eq!(
            toggle_all_target(&with_states(&[false, false])),
            Some(ToggleTarget::ActivateAll)
        );
        assert_eq!(
            toggle_all_target(&with_states(&[true, false])),
            Some(ToggleTarget::ActivateRemaining)
        );
    }

    #[test]
    fn test_toggle_target_labels() {
        assert_eq!(ToggleTarget::ActivateAll.label(), "toggle all");
        assert_eq!(ToggleTarget::DeactivateAll.label(), "untoggle all");
        assert_eq!(ToggleTarget::ActivateRemaining.label(), "toggle remaining");
        assert!(ToggleTarget::ActivateRemaining.active());
        assert!(!ToggleTarget::DeactivateAll.active());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Cleaning.to_string(), "cleaning");
        assert_eq!(Phase::Sweeping.to_string(), "sweeping");
        assert_eq!(Phase::Inserting.to_string(), "inserting");
    }
}
