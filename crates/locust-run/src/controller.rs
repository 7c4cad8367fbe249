//! LocustTest controller implementation
//!
//! [`reconcile_run`] is the convergence procedure: verify the script source,
//! upsert the ConfigMap, then both Services, tear the Deployments down when
//! the spec changed disruptively, and upsert master before workers. Every
//! step is keyed by a deterministic name, so re-running after a partial
//! failure converges without duplicates.
//!
//! [`reconcile`] and [`error_policy`] adapt it to the kube-rs `Controller`:
//! finalizer handling, validation, the previous-spec annotation, and the
//! stats daemon lifecycle.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use locust_common::crd::{LocustTest, LocustTestSpec, RunPhase, RunSpec};
use locust_common::events::{actions, reasons, EventPublisher};
use locust_common::LAST_HANDLED_SPEC_ANNOTATION;

use crate::classifier::{changed_regions, SpecRegion};
use crate::client::{ChildKind, ChildResource, RunKubeClient};
use crate::compiler::{compile_run, master_name, worker_name, RunInstance};
use crate::error::RunError;
use crate::stats::{StatsDaemons, StatsTarget};

/// Periodic resync of a converged LocustTest
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue delay after a retryable failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Shared context for the LocustTest controller
pub struct RunContext {
    /// Kubernetes access for children and status
    pub kube: Arc<dyn RunKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Per-run stats daemons
    pub stats: Arc<StatsDaemons>,
    /// Last reconcile seen per run, keyed `namespace/name`
    observed: DashMap<String, Observed>,
}

impl RunContext {
    pub fn new(
        kube: Arc<dyn RunKubeClient>,
        events: Arc<dyn EventPublisher>,
        stats: Arc<StatsDaemons>,
    ) -> Self {
        Self {
            kube,
            events,
            stats,
            observed: DashMap::new(),
        }
    }
}

/// What the last reconcile of a run saw
#[derive(Clone, Debug)]
struct Observed {
    generation: Option<i64>,
    resource_version: Option<String>,
    /// End of the last full convergence
    converged_at: Instant,
}

/// What a successful reconcile changed beyond in-place patches
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Regions that forced master and workers to be recreated
    pub restarted: Vec<SpecRegion>,
    /// Worker count change `(old, new)`
    pub scaled: Option<(i32, i32)>,
}

// =============================================================================
// Convergence
// =============================================================================

/// Drive every child of one LocustTest to its desired state
///
/// `previous` is the spec the last successful reconcile ran with; without
/// it nothing is restarted. On success the phase becomes `Created`. A
/// missing script ConfigMap sets `Invalid` and fails permanently; transient
/// platform errors set `Reconciling` and are returned for retry.
pub async fn reconcile_run(
    instance: &RunInstance,
    spec: &RunSpec,
    previous: Option<&RunSpec>,
    ctx: &RunContext,
) -> Result<ReconcileOutcome, RunError> {
    if let Some(name) = spec.referenced_config_map() {
        match ctx
            .kube
            .child_exists(&instance.namespace, ChildKind::ConfigMap, name)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let err = RunError::ScriptConfigMapMissing {
                    namespace: instance.namespace.clone(),
                    name: name.to_string(),
                };
                warn!(run = %instance.name, error = %err, "script ConfigMap missing");
                ctx.events
                    .publish(
                        &instance.object_ref(),
                        EventType::Warning,
                        reasons::VALIDATION_FAILED,
                        actions::RECONCILE,
                        Some(err.to_string()),
                    )
                    .await;
                return Err(fail(instance, ctx, err).await);
            }
            Err(e) => return Err(fail(instance, ctx, e).await),
        }
    }

    let outcome = match converge(instance, spec, previous, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(fail(instance, ctx, e).await),
    };

    write_phase(instance, ctx, RunPhase::Created, None).await?;

    if previous != Some(spec) {
        ctx.events
            .publish(
                &instance.object_ref(),
                EventType::Normal,
                reasons::RECONCILED,
                actions::RECONCILE,
                Some(format!("Master and {} worker(s) reconciled", spec.workers)),
            )
            .await;
    }

    Ok(outcome)
}

async fn converge(
    instance: &RunInstance,
    spec: &RunSpec,
    previous: Option<&RunSpec>,
    ctx: &RunContext,
) -> Result<ReconcileOutcome, RunError> {
    let namespace = &instance.namespace;
    let compiled = compile_run(instance, spec);
    let mut outcome = ReconcileOutcome::default();

    debug!(
        run = %instance.name,
        resources = compiled.resource_count(),
        "applying compiled resources"
    );

    // Services and Deployments mount the ConfigMap by name
    if let Some(cm) = compiled.config_map {
        upsert(ctx, namespace, ChildResource::ConfigMap(cm)).await?;
    }

    upsert(ctx, namespace, ChildResource::Service(compiled.master_service)).await?;
    upsert(ctx, namespace, ChildResource::Service(compiled.web_service)).await?;

    if let Some(previous) = previous {
        let regions = changed_regions(previous, spec);
        if !regions.is_empty() {
            let names: Vec<&str> = regions.iter().map(SpecRegion::as_str).collect();
            info!(run = %instance.name, changed = ?names, "restarting master and workers");
            ctx.events
                .publish(
                    &instance.object_ref(),
                    EventType::Normal,
                    reasons::RESTARTING,
                    actions::RESTART,
                    Some(format!(
                        "Recreating master and workers: changed {}",
                        names.join(", ")
                    )),
                )
                .await;

            ctx.kube
                .delete_deployment(namespace, &master_name(&instance.name))
                .await?;
            ctx.kube
                .delete_deployment(namespace, &worker_name(&instance.name))
                .await?;
            // From here on the new spec is the diff base; a retry must not tear down again
            if let Some(spec_json) = &instance.spec_json {
                ctx.kube
                    .record_handled_spec(namespace, &instance.name, spec_json)
                    .await?;
            }
            outcome.restarted = regions;
        }
    }

    // Master first so its Service resolves before workers dial it
    upsert(ctx, namespace, ChildResource::Deployment(compiled.master)).await?;
    upsert(ctx, namespace, ChildResource::Deployment(compiled.worker)).await?;

    if let Some(previous) = previous {
        if previous.workers != spec.workers {
            info!(
                run = %instance.name,
                from = previous.workers,
                to = spec.workers,
                "scaled workers"
            );
            ctx.events
                .publish(
                    &instance.object_ref(),
                    EventType::Normal,
                    reasons::SCALED,
                    actions::SCALE,
                    Some(format!(
                        "Updated worker count ({} -> {})",
                        previous.workers, spec.workers
                    )),
                )
                .await;
            outcome.scaled = Some((previous.workers, spec.workers));
        }
    }

    Ok(outcome)
}

/// Create the child when absent, patch it in place otherwise
async fn upsert(ctx: &RunContext, namespace: &str, child: ChildResource) -> Result<(), RunError> {
    if ctx
        .kube
        .child_exists(namespace, child.kind(), child.name())
        .await?
    {
        ctx.kube.patch_child(namespace, &child).await
    } else {
        ctx.kube.create_child(namespace, &child).await
    }
}

/// Record the failure on the status and hand the error back
async fn fail(instance: &RunInstance, ctx: &RunContext, err: RunError) -> RunError {
    let phase = if err.is_retryable() {
        RunPhase::Reconciling
    } else {
        RunPhase::Invalid
    };
    if let Err(status_err) = write_phase(instance, ctx, phase, Some(err.to_string())).await {
        warn!(
            run = %instance.name,
            error = %status_err,
            "failed to record failure phase"
        );
    }
    err
}

/// Merge the reconciler-owned status fields; telemetry fields are untouched
async fn write_phase(
    instance: &RunInstance,
    ctx: &RunContext,
    phase: RunPhase,
    message: Option<String>,
) -> Result<(), RunError> {
    let status = serde_json::json!({
        "phase": phase,
        "message": message,
        "observedGeneration": instance.generation,
    });
    ctx.kube
        .patch_status(&instance.namespace, &instance.name, &status)
        .await
}

// =============================================================================
// kube-rs adapter
// =============================================================================

/// Reconcile a LocustTest resource
#[instrument(skip(run, ctx), fields(run = %run.name_any()))]
pub async fn reconcile(run: Arc<LocustTest>, ctx: Arc<RunContext>) -> Result<Action, RunError> {
    let instance = RunInstance::from_resource(&run)?;

    if run.metadata.deletion_timestamp.is_some() {
        info!("LocustTest deleted, stopping stats daemon");
        ctx.stats.stop(&instance.key()).await;
        ctx.observed.remove(&instance.key());
        ctx.kube.remove_finalizer(&run).await?;
        return Ok(Action::await_change());
    }

    ctx.kube.add_finalizer(&run).await?;

    let spec = match run.spec.validate(&instance.name) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(error = %e, "LocustTest validation failed");
            write_phase(&instance, &ctx, RunPhase::Invalid, Some(e.to_string())).await?;
            ctx.events
                .publish(
                    &instance.object_ref(),
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            // Don't requeue for validation errors - they require spec changes
            return Ok(Action::await_change());
        }
    };

    let key = instance.key();
    let last = ctx.observed.get(&key).map(|o| o.clone());
    if let Some(last) = last {
        if let Some(remaining) = status_only_change(&run, &last, Instant::now()) {
            debug!("only status changed since last convergence");
            ctx.observed.insert(
                key,
                Observed {
                    resource_version: run.metadata.resource_version.clone(),
                    ..last
                },
            );
            ctx.stats
                .ensure(StatsTarget::new(&instance, spec.web_port, spec.workers));
            return Ok(Action::requeue(remaining));
        }
    }

    ctx.observed.remove(&key);
    let previous = previous_spec(&run);
    let outcome = reconcile_run(&instance, &spec, previous.as_ref(), &ctx).await?;
    if outcome.restarted.is_empty() {
        record_handled_spec(&run, &instance, &ctx).await?;
    }
    ctx.observed.insert(
        key,
        Observed {
            generation: run.metadata.generation,
            resource_version: run.metadata.resource_version.clone(),
            converged_at: Instant::now(),
        },
    );

    ctx.stats
        .ensure(StatsTarget::new(&instance, spec.web_port, spec.workers));

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Time left until resync when a converged run changed only in status
///
/// Telemetry and phase writes bump `resourceVersion` without touching the
/// generation. Owned-child events and resyncs arrive with the version the
/// last reconcile already saw and always converge fully.
fn status_only_change(run: &LocustTest, last: &Observed, now: Instant) -> Option<Duration> {
    if last.generation != run.metadata.generation
        || last.resource_version == run.metadata.resource_version
        || !is_converged(run)
    {
        return None;
    }
    RESYNC_INTERVAL
        .checked_sub(now.saturating_duration_since(last.converged_at))
        .filter(|remaining| !remaining.is_zero())
}

/// Phase `Created` for the current generation, with the current spec recorded
fn is_converged(run: &LocustTest) -> bool {
    let status_current = run
        .status
        .as_ref()
        .map(|s| {
            s.phase == Some(RunPhase::Created)
                && s.observed_generation == run.metadata.generation
        })
        .unwrap_or(false);
    let spec_recorded = match serde_json::to_string(&run.spec) {
        Ok(json) => run.annotations().get(LAST_HANDLED_SPEC_ANNOTATION) == Some(&json),
        Err(_) => false,
    };
    status_current && spec_recorded
}

/// Error policy for the LocustTest controller
///
/// Retryable errors requeue after [`RETRY_INTERVAL`]; permanent errors
/// wait for the spec to change.
pub fn error_policy(run: Arc<LocustTest>, error: &RunError, _ctx: Arc<RunContext>) -> Action {
    error!(
        ?error,
        run = %run.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::await_change()
    }
}

/// Spec of the last successful reconcile, if recorded and still valid
pub fn previous_spec(run: &LocustTest) -> Option<RunSpec> {
    let raw = run.annotations().get(LAST_HANDLED_SPEC_ANNOTATION)?;
    let spec: LocustTestSpec = match serde_json::from_str(raw) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(error = %e, "ignoring unparsable last-handled spec");
            return None;
        }
    };
    match spec.validate(&run.name_any()) {
        Ok(spec) => Some(spec),
        Err(e) => {
            debug!(error = %e, "last-handled spec no longer validates");
            None
        }
    }
}

async fn record_handled_spec(
    run: &LocustTest,
    instance: &RunInstance,
    ctx: &RunContext,
) -> Result<(), RunError> {
    let spec_json = serde_json::to_string(&run.spec)?;
    if run.annotations().get(LAST_HANDLED_SPEC_ANNOTATION) == Some(&spec_json) {
        return Ok(());
    }
    ctx.kube
        .record_handled_spec(&instance.namespace, &instance.name, &spec_json)
        .await
}
