//! Audit Loop: periodically reviews the whole inventory against
//! every Constraint, deduplicates violations, and fans them out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::constraint::ConstraintClient;
use crate::export::{ExportFanout, ViolationEvent};
use crate::inventory::Inventory;
use crate::matcher::{GroupVersionKind, ObjectIdentity};

/// One pass's tuning: worker bound, and the soft/hard deadlines that decide
/// whether a slow pass still completes, gets skipped next tick, or is
/// cancelled outright.
#[derive(Debug, Clone)]
pub struct AuditBudget {
    pub workers: usize,
    pub chunk_size: usize,
    pub soft_deadline: Duration,
    pub hard_deadline: Duration,
}

impl Default for AuditBudget {
    fn default() -> Self {
        Self {
            workers: 4,
            chunk_size: 500,
            soft_deadline: Duration::from_secs(30),
            hard_deadline: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed { violation_count: usize },
    /// The pass exceeded its hard deadline; partial results were dropped.
    CancelledAtHardDeadline,
    /// The previous pass exceeded its soft deadline, so this tick is
    /// skipped entirely.
    SkippedAfterSoftDeadline,
}

/// Runs one audit pass: snapshot, per-kind batched review with bounded
/// parallelism (steps 1-2), dedup by `(constraint, resource, message)`
/// (step 3), then fan out to export (step 5). Status merge (step 4) is the
/// caller's responsibility since it needs each Constraint's own status
/// writer.
pub async fn run_pass(
    constraints: Arc<ConstraintClient>,
    inventory: &Inventory,
    export: &ExportFanout,
    budget: &AuditBudget,
) -> PassOutcome {
    let started = Instant::now();
    let snapshot = inventory.snapshot();
    let kinds = inventory.synced_kinds();

    let objects: Vec<(ObjectIdentity, Value)> = kinds
        .iter()
        .flat_map(|gvk| snapshot.list(gvk).map(move |obj| (identity_of(gvk, &obj), obj)))
        .collect();

    let batches: Vec<Vec<(ObjectIdentity, Value)>> =
        objects.chunks(budget.chunk_size.max(1)).map(<[_]>::to_vec).collect();

    let semaphore = Arc::new(Semaphore::new(budget.workers.max(1)));
    let mut tasks = JoinSet::new();

    for batch in batches {
        if started.elapsed() > budget.hard_deadline {
            warn!("audit pass exceeded hard deadline; cancelling remaining batches");
            tasks.abort_all();
            return PassOutcome::CancelledAtHardDeadline;
        }
        let permit = Arc::clone(&semaphore);
        let constraints = Arc::clone(&constraints);
        let snapshot = snapshot.clone();
        tasks.spawn(async move {
            let _permit = permit.acquire_owned().await.expect("semaphore never closed");
            tokio::task::spawn_blocking(move || constraints.audit(batch.into_iter(), &snapshot))
                .await
                .unwrap_or_default()
        });
    }

    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut deduped: Vec<ViolationEvent> = Vec::new();

    while let Some(result) = tasks.join_next().await {
        if started.elapsed() > budget.hard_deadline {
            tasks.abort_all();
            return PassOutcome::CancelledAtHardDeadline;
        }
        let Ok(responses) = result else { continue };
        for response in responses {
            if let Some(err) = &response.error {
                warn!(constraint = response.constraint_full_id, error = %err, "audit evaluation error");
                continue;
            }
            for violation in response.violations {
                let key = (response.constraint_full_id.clone(), response.resource.clone(), violation.msg.clone());
                if seen.insert(key) {
                    deduped.push(ViolationEvent {
                        constraint_full_id: response.constraint_full_id.clone(),
                        resource: response.resource.clone(),
                        enforcement_action: response.enforcement_action.clone(),
                        violation: violation.clone(),
                    });
                }
            }
        }
    }

    let violation_count = deduped.len();
    for event in deduped {
        export.publish(event);
    }

    if started.elapsed() > budget.soft_deadline {
        warn!(elapsed = ?started.elapsed(), "audit pass exceeded soft deadline; next tick will be skipped");
    }

    PassOutcome::Completed { violation_count }
}

fn identity_of(gvk: &GroupVersionKind, obj: &Value) -> ObjectIdentity {
    let namespace = obj
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let name = obj
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let labels = obj
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default();
    ObjectIdentity {
        gvk: gvk.clone(),
        namespace: namespace.clone(),
        name,
        labels,
        namespace_labels: Default::default(),
        is_namespaced: namespace.is_some(),
    }
}
