//! ACL reconciliation.
//!
//! [`AclReconciler`] converges the declared rules of one ACL container onto
//! the control plane and tracks the remote ids it created. Every operation
//! returns an [`Outcome`] carrying the best-known [`TrackedState`] even on
//! failure, so callers can persist partial progress.
//!
//! Lifecycle:
//! - create: `absent -> applying-create -> reconciled`
//! - update: `reconciled -> diffing -> applying-delete -> applying-create -> reconciled`
//! - delete: `reconciled -> applying-delete-all -> absent`

pub mod apply;
pub mod diff;
pub mod expand;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clients::AclApi;
use crate::config::{AclConfig, DiffMode, RuleDecl};
use crate::error::{AclError, RemoteError, Result};
use crate::rate_limit::RateLimiter;
use crate::rule::{refresh_from_remote, LogicalRule, RemoteRule, RuleProtocol, SubRuleIds};
use crate::validation::{self, validate_rules, validate_settings};

use apply::{ApplyReport, ConcurrentApplier};
use diff::diff_rules;
use expand::{avoid_taken, expand, plan_ordinals, CreateOp};

/// Lifecycle phase of a tracked ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Absent,
    ApplyingCreate,
    Reconciled,
    Diffing,
    ApplyingDelete,
    ApplyingDeleteAll,
}

impl Phase {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_move_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Absent, ApplyingCreate)
                | (ApplyingCreate, Reconciled)
                | (ApplyingCreate, Absent)
                | (Reconciled, Reconciled)
                | (Reconciled, Absent)
                | (Reconciled, Diffing)
                | (Diffing, ApplyingDelete)
                | (ApplyingDelete, ApplyingCreate)
                | (ApplyingDelete, Reconciled)
                | (Reconciled, ApplyingDeleteAll)
                | (ApplyingDeleteAll, Absent)
                | (ApplyingDeleteAll, Reconciled)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Absent => "absent",
            Phase::ApplyingCreate => "applying-create",
            Phase::Reconciled => "reconciled",
            Phase::Diffing => "diffing",
            Phase::ApplyingDelete => "applying-delete",
            Phase::ApplyingDeleteAll => "applying-delete-all",
        };
        f.write_str(name)
    }
}

/// What the reconciler knows about one ACL container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedState {
    pub acl_id: String,
    pub phase: Phase,
    /// Tracked rules in declaration order, followed by unmanaged placeholders
    #[serde(default)]
    pub rules: Vec<LogicalRule>,
    #[serde(default)]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl TrackedState {
    pub fn absent(acl_id: impl Into<String>) -> Self {
        Self {
            acl_id: acl_id.into(),
            phase: Phase::Absent,
            rules: Vec::new(),
            last_reconciled: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.phase == Phase::Absent
    }

    /// Total number of tracked remote ids.
    pub fn sub_rule_count(&self) -> usize {
        self.rules.iter().map(|r| r.sub_rule_ids.len()).sum()
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_move_to(next) {
            return Err(AclError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!("ACL {}: {} -> {}", self.acl_id, self.phase, next);
        self.phase = next;
        if next == Phase::Reconciled {
            self.last_reconciled = Some(Utc::now());
        }
        Ok(())
    }
}

/// Result of one reconciler operation.
#[derive(Debug)]
pub struct Outcome {
    /// Best-known state, also on error
    pub state: TrackedState,
    pub result: Result<()>,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_parts(self) -> (TrackedState, Result<()>) {
        (self.state, self.result)
    }
}

/// Reconciler for the rules of one ACL container.
pub struct AclReconciler {
    api: Arc<dyn AclApi>,
    applier: ConcurrentApplier,
    acl_id: String,
    project: Option<String>,
    unmanaged_extras_allowed: bool,
    diff_mode: DiffMode,
}

impl AclReconciler {
    /// Build a reconciler for `config`. The rules of `config` are not used
    /// here; they are passed to [`create`](Self::create) and
    /// [`update`](Self::update).
    pub fn new(api: Arc<dyn AclApi>, config: &AclConfig) -> validation::Result<Self> {
        validate_settings(config)?;

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let applier = ConcurrentApplier::new(
            Arc::clone(&api),
            config.parallelism,
            config.retry,
            limiter,
        );

        Ok(Self {
            api,
            applier,
            acl_id: config.acl_id.clone(),
            project: config.project.clone(),
            unmanaged_extras_allowed: config.unmanaged_extras_allowed,
            diff_mode: config.diff_mode,
        })
    }

    pub fn acl_id(&self) -> &str {
        &self.acl_id
    }

    /// Create every declared rule on an ACL nothing is tracked for yet.
    pub async fn create(&self, rules: &[RuleDecl]) -> Outcome {
        let mut state = TrackedState::absent(&self.acl_id);
        let result = self.run_create(&mut state, rules).await;
        Self::finish("create", state, result)
    }

    /// Converge tracked rules onto a new declaration.
    pub async fn update(&self, mut state: TrackedState, rules: &[RuleDecl]) -> Outcome {
        let result = self.run_update(&mut state, rules).await;
        Self::finish("update", state, result)
    }

    /// Refresh tracked rules from the control plane.
    pub async fn read(&self, mut state: TrackedState) -> Outcome {
        let result = match self.check_acl(&state) {
            Ok(()) if state.is_absent() => Ok(()),
            Ok(()) => self.refresh(&mut state).await,
            Err(e) => Err(e),
        };
        Self::finish("read", state, result)
    }

    /// Delete every tracked rule.
    pub async fn delete(&self, mut state: TrackedState) -> Outcome {
        let result = self.run_delete(&mut state).await;
        Self::finish("delete", state, result)
    }

    fn finish(operation: &str, state: TrackedState, result: Result<()>) -> Outcome {
        match &result {
            Ok(()) => info!(
                "ACL {} {}: {} rules, {} sub-rules tracked ({})",
                state.acl_id,
                operation,
                state.rules.len(),
                state.sub_rule_count(),
                state.phase
            ),
            Err(e) => error!("ACL {} {} failed: {}", state.acl_id, operation, e),
        }
        Outcome { state, result }
    }

    fn check_acl(&self, state: &TrackedState) -> Result<()> {
        if state.acl_id != self.acl_id {
            return Err(AclError::AclMismatch {
                configured: self.acl_id.clone(),
                tracked: state.acl_id.clone(),
            });
        }
        Ok(())
    }

    /// Expand `batch` (pairs of position in the declared sequence and rule)
    /// into create operations indexed by batch position.
    fn plan_creates(
        &self,
        declared: &[LogicalRule],
        batch: &[(usize, LogicalRule)],
    ) -> Result<Vec<(usize, CreateOp)>> {
        let starts = plan_ordinals(declared);
        let mut ops = Vec::new();
        for (batch_index, (position, rule)) in batch.iter().enumerate() {
            let start = starts.get(*position).copied().unwrap_or(1);
            for op in expand(&self.acl_id, batch_index, rule, start)? {
                ops.push((batch_index, op));
            }
        }
        Ok(ops)
    }

    async fn run_create(&self, state: &mut TrackedState, rules: &[RuleDecl]) -> Result<()> {
        let declared = validate_rules(rules, self.unmanaged_extras_allowed)?;
        let batch: Vec<(usize, LogicalRule)> = declared.iter().cloned().enumerate().collect();
        let ops = self.plan_creates(&declared, &batch)?;

        state.transition(Phase::ApplyingCreate)?;
        info!("Creating {} rules in ACL {}", declared.len(), self.acl_id);

        let report = self.applier.create(declared, ops).await;
        let (retained, result) = report.into_retained();
        state.rules = retained;
        self.settle_after_create(state, result.is_err())?;
        result?;

        self.refresh(state).await
    }

    fn settle_after_create(&self, state: &mut TrackedState, failed: bool) -> Result<()> {
        // Nothing landed: there is no remote state to track.
        if failed && state.rules.is_empty() {
            state.transition(Phase::Absent)
        } else {
            state.transition(Phase::Reconciled)
        }
    }

    async fn run_update(&self, state: &mut TrackedState, rules: &[RuleDecl]) -> Result<()> {
        self.check_acl(state)?;
        let declared = validate_rules(rules, self.unmanaged_extras_allowed)?;
        state.transition(Phase::Diffing)?;

        let (placeholders, tracked): (Vec<LogicalRule>, Vec<LogicalRule>) =
            std::mem::take(&mut state.rules)
                .into_iter()
                .partition(LogicalRule::is_unmanaged);
        let diff = diff_rules(&tracked, &declared, self.diff_mode);
        info!(
            "ACL {}: {} rules removed, {} added, {} unchanged",
            self.acl_id,
            diff.removed.len(),
            diff.added.len(),
            diff.unchanged.len()
        );

        // Unchanged rules go through the create batch too, which fills in any
        // sub-rule a previous run failed to create.
        let mut batch: Vec<(usize, LogicalRule)> = diff
            .unchanged
            .iter()
            .chain(&diff.added)
            .cloned()
            .collect();
        batch.sort_by_key(|(position, _)| *position);
        let mut ops = self.plan_creates(&declared, &batch)?;

        let (kept_placeholders, released) = if self.unmanaged_extras_allowed {
            (placeholders, Vec::new())
        } else {
            (Vec::new(), placeholders)
        };
        let removed_positions: Vec<usize> = diff.removed.iter().map(|(i, _)| *i).collect();
        let to_delete: Vec<LogicalRule> = diff
            .removed
            .into_iter()
            .map(|(_, rule)| rule)
            .chain(released)
            .collect();

        state.transition(Phase::ApplyingDelete)?;
        let ApplyReport {
            rules: after_delete,
            errors,
            ..
        } = self.applier.delete(to_delete).await;
        if let Err(err) = errors.into_result() {
            // The next update has to line up with this one to retry the
            // failed deletes.
            state.rules = keep_layout(tracked, &removed_positions, after_delete, kept_placeholders);
            state.transition(Phase::Reconciled)?;
            return Err(err.into());
        }

        // Ignored and placeholder rules keep their remote ordinals.
        if !ops.is_empty() {
            let taken = match self.live_ordinals().await {
                Ok(taken) => taken,
                Err(err) => {
                    state.rules =
                        keep_layout(tracked, &removed_positions, after_delete, kept_placeholders);
                    state.transition(Phase::Reconciled)?;
                    return Err(err);
                }
            };
            let moved = avoid_taken(&mut ops, &taken);
            if moved > 0 {
                info!(
                    "ACL {}: {} sub-rules moved past ordinals already in use",
                    self.acl_id, moved
                );
            }
        }

        state.transition(Phase::ApplyingCreate)?;
        let batch_rules: Vec<LogicalRule> = batch.into_iter().map(|(_, rule)| rule).collect();
        let report = self.applier.create(batch_rules, ops).await;
        let (retained, result) = report.into_retained();
        state.rules = retained
            .into_iter()
            .chain(diff.ignored)
            .chain(kept_placeholders)
            .collect();
        self.settle_after_create(state, result.is_err())?;
        result?;

        self.refresh(state).await
    }

    async fn run_delete(&self, state: &mut TrackedState) -> Result<()> {
        self.check_acl(state)?;
        if state.is_absent() {
            debug!("ACL {} has no tracked rules", self.acl_id);
            return Ok(());
        }
        state.transition(Phase::ApplyingDeleteAll)?;

        let (placeholders, owned): (Vec<LogicalRule>, Vec<LogicalRule>) =
            std::mem::take(&mut state.rules)
                .into_iter()
                .partition(LogicalRule::is_unmanaged);
        if !placeholders.is_empty() {
            info!(
                "Releasing {} unmanaged rules of ACL {}",
                placeholders.len(),
                self.acl_id
            );
        }

        let report = self.applier.delete(owned).await;
        let (retained, result) = report.into_retained();
        state.rules = retained;
        if state.rules.is_empty() {
            state.transition(Phase::Absent)?;
        } else {
            state.transition(Phase::Reconciled)?;
        }
        result.map_err(AclError::from)
    }

    /// Ordinals currently assigned at the control plane.
    async fn live_ordinals(&self) -> Result<BTreeSet<u32>> {
        let remote = self
            .api
            .list_rules(&self.acl_id, self.project.as_deref())
            .await?;
        Ok(remote.into_iter().filter_map(|r| r.number).collect())
    }

    /// Fold the remote truth into `state`.
    async fn refresh(&self, state: &mut TrackedState) -> Result<()> {
        let project = self.project.as_deref();
        match self.api.get_acl(&self.acl_id, project).await {
            Ok(_) => {}
            Err(RemoteError::NotFound(_)) => {
                warn!("ACL {} no longer exists, dropping tracked rules", self.acl_id);
                state.rules.clear();
                return state.transition(Phase::Absent);
            }
            Err(e) => return Err(e.into()),
        }

        let remote = self.api.list_rules(&self.acl_id, project).await?;
        let mut pool: HashMap<String, RemoteRule> =
            remote.into_iter().map(|r| (r.id.clone(), r)).collect();

        let mut rules = Vec::new();
        for rule in std::mem::take(&mut state.rules) {
            if let RuleProtocol::Unmanaged { remote_id } = &rule.protocol {
                if pool.remove(remote_id).is_some() {
                    rules.push(rule);
                }
                continue;
            }
            rules.extend(refresh_rule(rule, &mut pool));
        }

        if self.unmanaged_extras_allowed {
            let mut extras: Vec<RemoteRule> = pool.into_values().collect();
            extras.sort_by(|a, b| (a.number, &a.id).cmp(&(b.number, &b.id)));
            for extra in extras {
                debug!("Tracking unmanaged rule {} of ACL {}", extra.id, self.acl_id);
                rules.push(LogicalRule::unmanaged(&extra.id));
            }
        }

        let live = rules.iter().any(|rule| !rule.sub_rule_ids.is_empty());
        if !live && !self.unmanaged_extras_allowed {
            info!("ACL {} has no rules left", self.acl_id);
            state.rules.clear();
            state.transition(Phase::Absent)
        } else {
            state.rules = rules;
            state.transition(Phase::Reconciled)
        }
    }
}

/// Tracked rules with every removed position replaced by its state after the
/// delete batch, followed by the placeholders that still carry ids.
///
/// A removed rule whose deletes all went through stays as an entry without
/// ids, so positions match the declaration the update started from.
fn keep_layout(
    tracked: Vec<LogicalRule>,
    removed_positions: &[usize],
    after_delete: Vec<LogicalRule>,
    kept_placeholders: Vec<LogicalRule>,
) -> Vec<LogicalRule> {
    let mut after_delete = after_delete.into_iter();
    let mut removed: HashMap<usize, LogicalRule> = removed_positions
        .iter()
        .copied()
        .zip(after_delete.by_ref())
        .collect();

    tracked
        .into_iter()
        .enumerate()
        .map(|(i, rule)| removed.remove(&i).unwrap_or(rule))
        .chain(kept_placeholders)
        .chain(after_delete.filter(|rule| !rule.sub_rule_ids.is_empty()))
        .collect()
}

/// Refresh one tracked rule from the remote rules in `pool`, consuming the
/// ones it matches.
///
/// Sub-rules that disappeared remotely are dropped. A sub-rule whose remote
/// protocol or port moved away from its key is split off into a rule of its
/// own, rebuilt from the remote fields. Sub-rules with remote fields that have
/// no local form stay tracked unrefreshed. The refreshed rule comes first and
/// is left out when it had ids and none of them still match; a rule that had
/// no ids to begin with is kept as is.
fn refresh_rule(mut rule: LogicalRule, pool: &mut HashMap<String, RemoteRule>) -> Vec<LogicalRule> {
    let mut split = Vec::new();
    let mut ids = SubRuleIds::new();
    let had_ids = !rule.sub_rule_ids.is_empty();

    for (key, id) in std::mem::take(&mut rule.sub_rule_ids) {
        let Some(remote) = pool.get(&id) else {
            debug!("Sub-rule {} ({}) no longer exists", key, id);
            continue;
        };
        let Some(remote_rule) = remote.to_logical() else {
            warn!("Sub-rule {} has remote fields with no local form, keeping it unrefreshed", id);
            pool.remove(&id);
            ids.insert(key, id);
            continue;
        };
        pool.remove(&id);

        if remote_rule.sub_rule_ids.contains_key(&key) && refresh_from_remote(&mut rule, &remote_rule) {
            ids.insert(key, id);
        } else {
            warn!(
                "Sub-rule {} changed to {} remotely, tracking it separately",
                id,
                remote_rule.describe()
            );
            split.push(remote_rule);
        }
    }

    rule.sub_rule_ids = ids;
    if had_ids && rule.sub_rule_ids.is_empty() {
        split
    } else {
        std::iter::once(rule).chain(split).collect()
    }
}
