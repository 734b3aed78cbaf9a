//! Concurrent application of sub-rule operations.
//!
//! Operations run on a pool bounded by a semaphore of `parallelism` permits.
//! Before each dispatch the applier takes a token from the shared
//! [`RateLimiter`]. Every operation runs to completion; failures are collected
//! in a shared sink and returned together as one [`BatchError`].
//!
//! Each rule of the batch lives behind its own mutex. An operation locks only
//! the rule it belongs to, so port operations of the same rule running in
//! parallel never race on `sub_rule_ids`.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::expand::CreateOp;
use crate::clients::AclApi;
use crate::config::RetryConfig;
use crate::error::{BatchError, OperationError, OperationKind, RemoteError};
use crate::rate_limit::RateLimiter;
use crate::retry::retry;
use crate::rule::LogicalRule;

/// One remote delete for a logical rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOp {
    pub key: String,
    pub id: String,
}

#[derive(Debug, Clone)]
enum Work {
    Create(CreateOp),
    Delete(DeleteOp),
}

impl Work {
    fn kind(&self) -> OperationKind {
        match self {
            Work::Create(_) => OperationKind::Create,
            Work::Delete(_) => OperationKind::Delete,
        }
    }

    fn key(&self) -> &str {
        match self {
            Work::Create(op) => &op.key,
            Work::Delete(op) => &op.key,
        }
    }
}

/// Append-only error collector shared by all workers of a batch.
#[derive(Debug, Default)]
struct ErrorSink {
    errors: Mutex<Vec<OperationError>>,
}

impl ErrorSink {
    async fn push(&self, error: OperationError) {
        self.errors.lock().await.push(error);
    }

    async fn take(&self) -> BatchError {
        BatchError {
            errors: std::mem::take(&mut *self.errors.lock().await),
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Final state of every input rule, in input order
    pub rules: Vec<LogicalRule>,
    /// Index of the owning rule, appended after every operation that left
    /// the rule with at least one id. A rule shows up once per such operation.
    pub retained: Vec<usize>,
    /// Rules that had no operation in this batch
    pub untouched: Vec<usize>,
    pub errors: BatchError,
}

impl ApplyReport {
    /// Fold the retained appearances into one record per rule.
    ///
    /// Keeps rules that still carry ids at the end of the batch, in input
    /// order. Rules without operations are kept when they carry ids.
    pub fn retained_rules(&self) -> Vec<LogicalRule> {
        self.retained_indices()
            .into_iter()
            .filter_map(|i| self.rules.get(i))
            .cloned()
            .collect()
    }

    /// Input positions of the rules [`retained_rules`](Self::retained_rules) keeps.
    pub fn retained_indices(&self) -> BTreeSet<usize> {
        self.retained
            .iter()
            .chain(&self.untouched)
            .copied()
            .filter(|&i| {
                self.rules
                    .get(i)
                    .is_some_and(|rule| !rule.sub_rule_ids.is_empty())
            })
            .collect()
    }

    /// Retained rules plus the batch result.
    pub fn into_retained(self) -> (Vec<LogicalRule>, Result<(), BatchError>) {
        let rules = self.retained_rules();
        (rules, self.errors.into_result())
    }
}

/// Bounded-parallelism executor for create and delete batches.
pub struct ConcurrentApplier {
    api: Arc<dyn AclApi>,
    parallelism: usize,
    retry: RetryConfig,
    limiter: Arc<RateLimiter>,
}

impl ConcurrentApplier {
    pub fn new(
        api: Arc<dyn AclApi>,
        parallelism: usize,
        retry: RetryConfig,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            api,
            parallelism: parallelism.max(1),
            retry,
            limiter,
        }
    }

    /// Run `ops` (pairs of rule index and create) against `rules`.
    pub async fn create(&self, rules: Vec<LogicalRule>, ops: Vec<(usize, CreateOp)>) -> ApplyReport {
        info!(
            "Creating {} sub-rules for {} rules (parallelism {})",
            ops.len(),
            rules.len(),
            self.parallelism
        );
        let work = ops
            .into_iter()
            .map(|(index, op)| (index, Work::Create(op)))
            .collect();
        self.run(rules, work).await
    }

    /// Delete every sub-rule of every rule in `rules`.
    pub async fn delete(&self, rules: Vec<LogicalRule>) -> ApplyReport {
        let work: Vec<(usize, Work)> = rules
            .iter()
            .enumerate()
            .flat_map(|(index, rule)| {
                rule.sub_rule_ids.iter().map(move |(key, id)| {
                    (
                        index,
                        Work::Delete(DeleteOp {
                            key: key.clone(),
                            id: id.clone(),
                        }),
                    )
                })
            })
            .collect();

        info!(
            "Deleting {} sub-rules for {} rules (parallelism {})",
            work.len(),
            rules.len(),
            self.parallelism
        );
        self.run(rules, work).await
    }

    async fn run(&self, rules: Vec<LogicalRule>, work: Vec<(usize, Work)>) -> ApplyReport {
        let descriptions: Vec<String> = rules.iter().map(LogicalRule::describe).collect();
        let slots: Vec<Arc<Mutex<LogicalRule>>> = rules
            .into_iter()
            .map(|rule| Arc::new(Mutex::new(rule)))
            .collect();
        let mut touched = vec![false; slots.len()];

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let retained = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(ErrorSink::default());
        let mut tasks = JoinSet::new();

        for (index, work) in work {
            let Some(slot) = slots.get(index).cloned() else {
                error!("Operation refers to unknown rule {}", index);
                continue;
            };
            touched[index] = true;

            self.limiter.acquire().await;
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let worker = Worker {
                api: Arc::clone(&self.api),
                retry: self.retry,
                rule_index: index,
                rule: descriptions.get(index).cloned().unwrap_or_default(),
                slot,
                retained: Arc::clone(&retained),
                sink: Arc::clone(&sink),
            };
            tasks.spawn(async move {
                worker.run(work).await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Rule operation task failed: {}", e);
            }
        }

        let mut rules = Vec::with_capacity(slots.len());
        for slot in slots {
            let rule = match Arc::try_unwrap(slot) {
                Ok(mutex) => mutex.into_inner(),
                Err(shared) => shared.lock().await.clone(),
            };
            rules.push(rule);
        }

        let retained = std::mem::take(&mut *retained.lock().await);
        let untouched = touched
            .iter()
            .enumerate()
            .filter(|(_, t)| !**t)
            .map(|(i, _)| i)
            .collect();

        ApplyReport {
            rules,
            retained,
            untouched,
            errors: sink.take().await,
        }
    }
}

/// Everything one spawned operation needs.
struct Worker {
    api: Arc<dyn AclApi>,
    retry: RetryConfig,
    rule_index: usize,
    rule: String,
    slot: Arc<Mutex<LogicalRule>>,
    retained: Arc<Mutex<Vec<usize>>>,
    sink: Arc<ErrorSink>,
}

impl Worker {
    async fn run(self, work: Work) {
        let kind = work.kind();
        let key = work.key().to_string();

        let result = match &work {
            Work::Create(op) => self.create(op).await.map(Some),
            Work::Delete(op) => self.delete(op).await.map(|_| None),
        };

        let mut rule = self.slot.lock().await;
        match result {
            Ok(Some(id)) => {
                debug!("Created sub-rule {} of rule {} as {}", key, self.rule_index, id);
                rule.sub_rule_ids.insert(key, id);
            }
            Ok(None) => {
                debug!("Deleted sub-rule {} of rule {}", key, self.rule_index);
                rule.sub_rule_ids.remove(&key);
            }
            Err(source) => {
                self.sink
                    .push(OperationError {
                        kind,
                        rule_index: self.rule_index,
                        rule: self.rule.clone(),
                        key,
                        source,
                    })
                    .await;
            }
        }

        if !rule.sub_rule_ids.is_empty() {
            self.retained.lock().await.push(self.rule_index);
        }
    }

    async fn create(&self, op: &CreateOp) -> Result<String, RemoteError> {
        let api = &*self.api;
        let request = &op.request;
        let name = format!("create sub-rule {} #{}", op.key, op.ordinal);
        retry(&self.retry, &name, || api.create_rule(request)).await
    }

    async fn delete(&self, op: &DeleteOp) -> Result<(), RemoteError> {
        let api = &*self.api;
        let id = op.id.as_str();
        let name = format!("delete sub-rule {} ({})", op.key, op.id);
        retry(&self.retry, &name, || async move {
            match api.delete_rule(id).await {
                Err(e) if e.is_already_gone(id) => {
                    debug!("Sub-rule {} is already gone", id);
                    Ok(())
                }
                other => other,
            }
        })
        .await
    }
}
