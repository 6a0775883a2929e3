//! Kubernetes controller.
//!
//! This controller watches `StrataCluster` objects and the StatefulSets managed by this operator,
//! and turns every observed change into the `namespace/name` key of the owning cluster. Keys are
//! fed into a shared work queue which is drained by a fixed pool of workers, each of which syncs
//! one cluster at a time through the `ClusterControl`.

mod control;
mod queue;
pub mod resources;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

pub use control::ClusterControl;
pub use queue::{RateLimiter, WorkQueue};

use crate::config::Config;
use strata_core::crd::StrataCluster;
use strata_core::labels::LABEL_INSTANCE;
use strata_core::{ErrorKind, SyncResult};

const METRIC_RECONCILE_TOTAL: &str = "strata_reconcile_total";
const METRIC_RECONCILE_ERRORS: &str = "strata_reconcile_errors_total";
const METRIC_RECONCILE_DURATION: &str = "strata_reconcile_duration_seconds";
const METRIC_ACTIVE_WORKERS: &str = "strata_active_workers";
const METRIC_CLUSTER_WATCHER_ERRORS: &str = "strata_cluster_watcher_errors";

/// The delay applied after a watcher error.
const WATCHER_ERROR_DELAY: Duration = Duration::from_secs(10);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Kubernetes controller for reconciling Strata clusters.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The reconciler run by the workers.
    control: Arc<ClusterControl>,
    /// The queue of cluster keys to sync.
    queue: Arc<WorkQueue>,
    /// The keys of all known clusters.
    clusters: HashSet<String>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, control: Arc<ClusterControl>, shutdown_tx: &broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_RECONCILE_TOTAL, metrics::Unit::Count, "cluster syncs by result");
        metrics::register_counter!(METRIC_RECONCILE_ERRORS, metrics::Unit::Count, "cluster syncs which failed");
        metrics::register_histogram!(METRIC_RECONCILE_DURATION, metrics::Unit::Seconds, "the duration of cluster syncs");
        metrics::register_gauge!(METRIC_ACTIVE_WORKERS, metrics::Unit::Count, "the number of workers currently syncing a cluster");
        metrics::register_counter!(METRIC_CLUSTER_WATCHER_ERRORS, metrics::Unit::Count, "k8s watcher errors from the cluster watchers");

        let limiter = RateLimiter::new(
            Duration::from_millis(config.requeue_base_millis),
            Duration::from_secs(config.requeue_max_seconds),
        );
        Self {
            client,
            queue: WorkQueue::new(limiter),
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            control,
            clusters: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, self.queue.clone(), self.control.clone())))
            .collect();

        // Build watcher streams.
        let clusters: Api<StrataCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters_watcher = watcher(clusters, ListParams::default());
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let statefulsets_watcher = watcher(statefulsets, list_params_managed_labels());
        tokio::pin!(clusters_watcher, statefulsets_watcher);
        let mut resync = tokio::time::interval(self.config.resync_interval());

        tracing::info!(workers = workers.len(), "k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res).await,
                Some(k8s_event_res) = statefulsets_watcher.next() => self.handle_sts_event(k8s_event_res).await,
                _ = resync.tick() => self.resync(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        self.queue.shut_down();
        for handle in workers {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "error joining reconciliation worker");
            }
        }
        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Re-enqueue all known clusters.
    fn resync(&self) {
        tracing::debug!(clusters = self.clusters.len(), "resyncing all known clusters");
        for key in self.clusters.iter() {
            self.queue.add(key);
        }
    }

    /// Handle `StrataCluster` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_cluster_event(&mut self, res: EventResult<StrataCluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from StrataCluster k8s watcher");
                metrics::increment_counter!(METRIC_CLUSTER_WATCHER_ERRORS);
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(cluster) => {
                let key = cluster.key();
                self.clusters.insert(key.clone());
                self.queue.add(&key);
            }
            Event::Deleted(cluster) => {
                let key = cluster.key();
                self.clusters.remove(&key);
                self.queue.add(&key);
            }
            Event::Restarted(clusters) => {
                tracing::debug!(clusters = clusters.len(), "StrataCluster watcher restarted");
                self.clusters = clusters.iter().map(|cluster| cluster.key()).collect();
                self.resync();
            }
        }
    }

    /// Handle `StatefulSet` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_sts_event(&mut self, res: EventResult<StatefulSet>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from StatefulSet k8s watcher");
                metrics::increment_counter!(METRIC_CLUSTER_WATCHER_ERRORS);
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        let statefulsets = match event {
            Event::Applied(sts) | Event::Deleted(sts) => vec![sts],
            Event::Restarted(statefulsets) => statefulsets,
        };
        for sts in statefulsets.iter() {
            if let Some(key) = statefulset_cluster_key(sts) {
                self.queue.add(&key);
            }
        }
    }
}

/// Create a list params object which selects only objects managed by this operator.
fn list_params_managed_labels() -> ListParams {
    ListParams {
        label_selector: Some(strata_core::STRATA_OPERATOR_LABEL_SELECTORS.into()),
        ..Default::default()
    }
}

/// The key of the cluster owning the given StatefulSet.
pub(crate) fn statefulset_cluster_key(sts: &StatefulSet) -> Option<String> {
    let ns = sts.metadata.namespace.as_deref()?;
    let instance = sts.metadata.labels.as_ref()?.get(LABEL_INSTANCE)?;
    Some(format!("{}/{}", ns, instance))
}

/// Drain the queue, syncing one cluster at a time, until the queue is shut down.
async fn run_worker(id: usize, queue: Arc<WorkQueue>, control: Arc<ClusterControl>) {
    tracing::debug!(worker = id, "reconciliation worker started");
    while let Some(key) = queue.get().await {
        metrics::increment_gauge!(METRIC_ACTIVE_WORKERS, 1.0);
        let start = Instant::now();
        let res = control.sync(&key, chrono::Utc::now()).await;
        metrics::histogram!(METRIC_RECONCILE_DURATION, start.elapsed().as_secs_f64());
        metrics::decrement_gauge!(METRIC_ACTIVE_WORKERS, 1.0);
        handle_outcome(&queue, &key, res);
        queue.done(&key);
    }
    tracing::debug!(worker = id, "reconciliation worker stopped");
}

/// Act on the result of syncing a key, returning the result label it was counted under.
pub(crate) fn handle_outcome(queue: &Arc<WorkQueue>, key: &str, res: SyncResult<()>) -> &'static str {
    let err = match res {
        Ok(()) => {
            queue.forget(key);
            metrics::increment_counter!(METRIC_RECONCILE_TOTAL, "result" => "success");
            return "success";
        }
        Err(err) => err,
    };
    let kind = err.kind();
    match kind {
        ErrorKind::Requeue => tracing::info!(key, requeues = queue.num_requeues(key), "requeuing cluster: {}", err),
        ErrorKind::Precondition => tracing::warn!(key, "error syncing cluster: {}", err),
        ErrorKind::Fatal => {
            tracing::error!(key, error = ?err, "error syncing cluster");
            metrics::increment_counter!(METRIC_RECONCILE_ERRORS);
        }
    }
    metrics::increment_counter!(METRIC_RECONCILE_TOTAL, "result" => kind.as_str());
    queue.add_rate_limited(key);
    kind.as_str()
}
