//! Reconciliation orchestrator.
//!
//! [`PolicyManager`] owns the pipeline and the debounced scheduler. Every
//! notification from the switch, endpoint or policy sources triggers the
//! scheduler; each run then recomputes all tables of all ready switches from
//! one policy snapshot and commits the difference to the store.

use crate::commit::{commit_flow_map, CommitSummary};
use crate::config::{LearningMode, RendererConfig};
use crate::context::OfContext;
use crate::endpoint::EndpointEvent;
use crate::pipeline::Pipeline;
use crate::policy::{PolicyEvent, PolicyInfo, PolicyProvider};
use crate::switch::SwitchEvent;
use async_trait::async_trait;
use futures::future::{self, join_all};
use futures::StreamExt;
use ofoverlay_common::{
    ConfigurationError, DebouncedTask, FlowMap, FlowStore, ReconcileTask, TableId, TablePath,
};
use ofoverlay_types::NodeId;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Result of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// True when there was no policy snapshot to render.
    pub skipped: bool,
    pub switches: usize,
    /// (stage, switch) pairs that failed and contributed no flows.
    pub stage_failures: usize,
    pub staged_flows: usize,
    /// Ordinal keys forgotten because nothing in this run referenced them.
    pub released_ordinals: usize,
    pub commit: CommitSummary,
}

struct Reconciler {
    ctx: Arc<OfContext>,
    policy: Arc<dyn PolicyProvider>,
    store: Arc<dyn FlowStore>,
    pipeline: RwLock<Arc<Pipeline>>,
    parallelism: usize,
    // Serializes runs with table offset changes and switch purges.
    run_lock: tokio::sync::Mutex<()>,
}

impl Reconciler {
    fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline.read())
    }

    #[instrument(skip_all)]
    async fn reconcile(&self) -> RunSummary {
        let _guard = self.run_lock.lock().await;
        let Some(policy) = self.policy.current_policy() else {
            debug!("No policy resolved yet, skipping run");
            return RunSummary {
                skipped: true,
                ..Default::default()
            };
        };

        let started = Instant::now();
        let pipeline = self.pipeline();
        let switches = self.ctx.switches().ready_switches();
        let switch_count = switches.len();
        let flows = Arc::new(FlowMap::new());

        self.ctx.ordinals().clear_references();
        let stage_failures = self
            .compute(pipeline, policy, switches, Arc::clone(&flows))
            .await;
        // A failed stage may be the only user of some keys.
        let released_ordinals = if stage_failures == 0 {
            self.ctx.ordinals().sweep()
        } else {
            0
        };
        if released_ordinals > 0 {
            debug!(released_ordinals, "Released unreferenced ordinals");
        }

        let flows = match Arc::try_unwrap(flows) {
            Ok(flows) => flows,
            Err(_) => {
                error!("Staged flows still referenced after computation, skipping commit");
                return RunSummary {
                    switches: switch_count,
                    stage_failures,
                    released_ordinals,
                    ..Default::default()
                };
            }
        };
        let staged_flows = flows.flow_count();
        let commit = commit_flow_map(self.store.as_ref(), flows).await;

        info!(
            switches = switch_count,
            staged_flows,
            stage_failures,
            puts = commit.puts,
            deletes = commit.deletes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flow update completed"
        );
        RunSummary {
            skipped: false,
            switches: switch_count,
            stage_failures,
            staged_flows,
            released_ordinals,
            commit,
        }
    }

    /// Runs every stage for every switch into `flows` and returns the number
    /// of failed (stage, switch) pairs.
    async fn compute(
        &self,
        pipeline: Arc<Pipeline>,
        policy: Arc<PolicyInfo>,
        switches: Vec<NodeId>,
        flows: Arc<FlowMap>,
    ) -> usize {
        let width = pipeline.stages().len();
        if self.parallelism <= 1 {
            let ctx = Arc::clone(&self.ctx);
            let task = tokio::task::spawn_blocking(move || {
                switches
                    .iter()
                    .map(|node| compute_switch(&ctx, &pipeline, &policy, node, &flows))
                    .sum::<usize>()
            });
            return joined(task.await, width);
        }

        let results: Vec<_> = futures::stream::iter(switches)
            .map(|node| {
                let ctx = Arc::clone(&self.ctx);
                let pipeline = Arc::clone(&pipeline);
                let policy = Arc::clone(&policy);
                let flows = Arc::clone(&flows);
                tokio::task::spawn_blocking(move || {
                    compute_switch(&ctx, &pipeline, &policy, &node, &flows)
                })
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        results.into_iter().map(|r| joined(r, width)).sum()
    }

    /// Deletes the given tables of one switch from the store.
    async fn clear_tables(&self, node: &NodeId, tables: &[TableId]) -> usize {
        let store = self.store.as_ref();
        let results = join_all(tables.iter().map(|&table| async move {
            let path = TablePath::new(node.clone(), table);
            let result = match store.read_table(&path).await {
                Ok(None) => Ok(false),
                Ok(Some(_)) => store.delete_table(&path).await.map(|_| true),
                Err(e) => Err(e),
            };
            result.map_err(|e| (path, e))
        }))
        .await;

        let mut cleared = 0;
        for result in results {
            match result {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err((path, e)) => warn!(table = %path, error = %e, "Failed to clear table"),
            }
        }
        cleared
    }
}

/// A panicked compute task counts as every stage of its switches failing.
fn joined(result: Result<usize, tokio::task::JoinError>, width: usize) -> usize {
    match result {
        Ok(failures) => failures,
        Err(e) => {
            error!(error = %e, "Flow computation task failed");
            width
        }
    }
}

fn compute_switch(
    ctx: &OfContext,
    pipeline: &Pipeline,
    policy: &PolicyInfo,
    node: &NodeId,
    flows: &FlowMap,
) -> usize {
    let mut failures = 0;
    for stage in pipeline.stages() {
        match stage.compute(ctx, node, policy) {
            Ok(entries) => {
                // An empty result still stages the table, clearing it in the store.
                flows.get_or_create_table(node, stage.table_id());
                for entry in entries {
                    flows.write_flow(node, entry);
                }
            }
            Err(e) => {
                failures += 1;
                error!(switch = %node, stage = %stage.kind(), error = %e, "Failed to compute flows");
            }
        }
    }
    trace!(switch = %node, failures, "Switch flows computed");
    failures
}

#[async_trait]
impl ReconcileTask for Reconciler {
    async fn run(&self) {
        self.reconcile().await;
    }
}

/// Drives the flow pipeline from change notifications.
pub struct PolicyManager {
    reconciler: Arc<Reconciler>,
    scheduler: Arc<DebouncedTask>,
    learning_mode: Mutex<LearningMode>,
    shutdown: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyManager")
            .field("table_offset", &self.table_offset())
            .field("flow_update_delay", &self.flow_update_delay())
            .field("parallelism", &self.reconciler.parallelism)
            .field("learning_mode", &self.learning_mode())
            .finish()
    }
}

impl PolicyManager {
    /// Creates the manager with the standard pipeline and starts its scheduler.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: &RendererConfig,
        ctx: Arc<OfContext>,
        policy: Arc<dyn PolicyProvider>,
        store: Arc<dyn FlowStore>,
    ) -> Result<Self, ConfigurationError> {
        let pipeline = Pipeline::new(config.table_offset)?;
        Ok(Self::with_pipeline(config, pipeline, ctx, policy, store))
    }

    /// Creates the manager around a custom pipeline.
    ///
    /// A later [`change_table_offset`](Self::change_table_offset) replaces it
    /// with the standard pipeline at the new offset.
    pub fn with_pipeline(
        config: &RendererConfig,
        pipeline: Pipeline,
        ctx: Arc<OfContext>,
        policy: Arc<dyn PolicyProvider>,
        store: Arc<dyn FlowStore>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler {
            ctx,
            policy,
            store,
            pipeline: RwLock::new(Arc::new(pipeline)),
            parallelism: config.parallelism.max(1),
            run_lock: tokio::sync::Mutex::new(()),
        });
        let scheduler = Arc::new(DebouncedTask::spawn(
            reconciler.clone(),
            config.flow_update_delay(),
        ));
        info!(
            table_offset = reconciler.pipeline().offset(),
            delay_ms = config.flow_update_delay_ms,
            parallelism = reconciler.parallelism,
            "Policy manager started"
        );

        Self {
            reconciler,
            scheduler,
            learning_mode: Mutex::new(config.learning_mode),
            shutdown: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Quiescence window between the last trigger and a run.
    pub fn flow_update_delay(&self) -> Duration {
        self.scheduler.delay()
    }

    pub fn table_offset(&self) -> TableId {
        self.reconciler.pipeline().offset()
    }

    /// Physical ids of the pipeline tables, in stage order.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.reconciler.pipeline().table_ids()
    }

    /// Requests a debounced flow update.
    pub fn schedule_update(&self) {
        self.scheduler.trigger();
    }

    /// Runs one reconciliation immediately, bypassing the scheduler.
    pub async fn reconcile_now(&self) -> RunSummary {
        self.reconciler.reconcile().await
    }

    /// Debounced runs completed so far.
    pub fn completed_runs(&self) -> u64 {
        self.scheduler.completed_runs()
    }

    pub fn learning_mode(&self) -> LearningMode {
        *self.learning_mode.lock()
    }

    pub fn set_learning_mode(&self, mode: LearningMode) {
        let previous = std::mem::replace(&mut *self.learning_mode.lock(), mode);
        if previous != mode {
            info!(?previous, current = ?mode, "Learning mode changed");
        }
    }

    /// Moves the pipeline to a new table offset.
    ///
    /// The new offset is validated first; on error nothing changes. Otherwise
    /// every ready switch's old tables are removed from the store (best
    /// effort), the pipeline is rebuilt at the new offset and an update is
    /// scheduled to populate the new tables.
    pub async fn change_table_offset(&self, offset: TableId) -> Result<(), ConfigurationError> {
        let pipeline = Pipeline::new(offset)?;
        {
            let _guard = self.reconciler.run_lock.lock().await;
            let old_tables = self.reconciler.pipeline().table_ids();
            let switches = self.reconciler.ctx.switches().ready_switches();
            let cleared: usize = join_all(
                switches
                    .iter()
                    .map(|node| self.reconciler.clear_tables(node, &old_tables)),
            )
            .await
            .into_iter()
            .sum();
            *self.reconciler.pipeline.write() = Arc::new(pipeline);
            info!(offset, cleared, "Table offset changed");
        }
        self.scheduler.trigger();
        Ok(())
    }

    /// Removes a switch's pipeline tables from the store.
    async fn purge_switch(reconciler: &Reconciler, node: &NodeId) {
        let _guard = reconciler.run_lock.lock().await;
        let tables = reconciler.pipeline().table_ids();
        let cleared = reconciler.clear_tables(node, &tables).await;
        debug!(switch = %node, cleared, "Removed switch tables");
    }

    /// Listens for switch changes. Removed switches have their tables purged.
    pub fn subscribe_switches(&self, rx: broadcast::Receiver<SwitchEvent>) {
        let reconciler = Arc::clone(&self.reconciler);
        self.spawn_listener("switch", rx, move |event| {
            let reconciler = Arc::clone(&reconciler);
            async move {
                if let SwitchEvent::SwitchRemoved(node) = event {
                    Self::purge_switch(&reconciler, &node).await;
                }
            }
        });
    }

    /// Listens for endpoint changes, bringing new groups into policy scope.
    pub fn subscribe_endpoints(&self, rx: broadcast::Receiver<EndpointEvent>) {
        let policy = Arc::clone(&self.reconciler.policy);
        self.spawn_listener("endpoint", rx, move |event| {
            if let EndpointEvent::GroupMembershipUpdated { group, .. } = event {
                policy.add_to_scope(group);
            }
            future::ready(())
        });
    }

    pub fn subscribe_policy(&self, rx: broadcast::Receiver<PolicyEvent>) {
        self.spawn_listener("policy", rx, |_| future::ready(()));
    }

    fn spawn_listener<E, F, Fut>(&self, source: &'static str, mut rx: broadcast::Receiver<E>, mut handle: F)
    where
        E: Clone + fmt::Debug + Send + 'static,
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(&self.scheduler);
        let shutdown = self.shutdown.clone();
        let listener = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => {
                        trace!(source, ?event, "Change notification");
                        handle(event).await;
                    }
                    // Runs recompute everything, so missed events only need a trigger.
                    Err(RecvError::Lagged(missed)) => {
                        warn!(source, missed, "Notification listener lagged")
                    }
                    Err(RecvError::Closed) => {
                        debug!(source, "Notification source closed");
                        break;
                    }
                }
                scheduler.trigger();
            }
        });
        self.listeners.lock().push(listener);
    }

    /// Stops the listeners, then the scheduler. A scheduled run completes first.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            if let Err(e) = listener.await {
                debug!(error = %e, "Listener ended abnormally");
            }
        }
        self.scheduler.close().await;
        info!("Policy manager stopped");
    }
}

impl Drop for PolicyManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
