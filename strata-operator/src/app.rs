use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::resources::KubeResources;
use crate::k8s::{ClusterControl, Controller};
use crate::pdapi::HttpCoordinatorControl;
use crate::scaler::{ScalerDeps, ScalerSettings};
use crate::server::spawn_http_server;
use strata_core::FeatureGates;

/// The application object for when the operator is running.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Build the reconciliation stack.
        let features = Arc::new(FeatureGates::new(&config.features).context("error building feature gates")?);
        tracing::info!(features = %features, "feature gates configured");
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let coordinators = HttpCoordinatorControl::new(
            std::time::Duration::from_secs(config.coordinator_timeout_seconds),
            config.cluster_domain.clone(),
        )
        .context("error building coordinator client")?;
        let deps = ScalerDeps {
            resources: KubeResources::new(client.clone()),
            coordinators: Arc::new(coordinators),
            features,
            settings: ScalerSettings {
                evict_leader_timeout: config.evict_leader_timeout(),
                grace_period: config.grace_period(),
            },
        };
        let control = Arc::new(ClusterControl::new(deps));

        // Spawn various core tasks.
        let server = spawn_http_server(&config, shutdown_tx.subscribe());
        let controller = Controller::new(client, config.clone(), control, &shutdown_tx).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Strata Operator is shutting down");
        if let Err(err) = self.server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }
        if let Err(err) = self.controller.await.context("error joining k8s controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }

        tracing::debug!("Strata Operator shutdown complete");
        Ok(())
    }
}
