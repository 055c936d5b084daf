//! harvestd - GitHub artifact mirroring daemon.
//!
//! Listens for GitHub webhook events, persists mirroring jobs to disk,
//! and works them off serially: download from GitHub, upload to the
//! configured destinations. Library components for the daemon process.

pub mod download;
pub mod error;
pub mod gcp;
pub mod github;
pub mod handlers;
pub mod image;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use harvest_core::Config;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::download::Downloader;
use crate::gcp::GcpClient;
use crate::github::GithubClient;
use crate::metrics::Metrics;
use crate::registry::RegistryClient;
use crate::scheduler::{Scheduler, QUEUE_CAPACITY, TICK_INTERVAL};
use crate::server::AppState;
use crate::store::JobStore;
use crate::upload::Uploader;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Grace period for the HTTP server to drain connections on shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Daemon state: configuration plus the clients the job handlers share.
#[derive(Debug)]
pub struct Daemon {
    pub config: Arc<Config>,
    pub store: Arc<JobStore>,
    pub scheduler: Arc<Scheduler>,
    pub github: Arc<GithubClient>,
    pub downloader: Downloader,
    pub uploader: Uploader,
    pub metrics: Arc<Metrics>,
}

impl Daemon {
    pub fn new(config: Config) -> AppResult<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new()?);
        let store = Arc::new(JobStore::new(
            &config.dir.jobs,
            config.soft_delete.jobs.as_deref(),
        )?);
        let github = Arc::new(GithubClient::new(&config.github.app)?);
        let registry = Arc::new(RegistryClient::new()?);
        let gcp = Arc::new(GcpClient::new()?);

        let downloader = Downloader::new(
            config.dir.downloads.clone(),
            Arc::clone(&github),
            Arc::clone(&registry),
        );
        let uploader = Uploader::new(gcp, registry, Arc::clone(&metrics));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), Arc::clone(&metrics)));

        Ok(Self {
            config,
            store,
            scheduler,
            github,
            downloader,
            uploader,
            metrics,
        })
    }

    /// Run until the cancellation token fires: HTTP ingress, the tick
    /// loop that sweeps the jobs directory, and the single job consumer.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> AppResult<()> {
        let state = Arc::new(AppState {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
        });
        let router = server::create_router(state);

        let listener = tokio::net::TcpListener::bind(&self.config.server.listen_address).await?;
        info!(
            listen_address = %self.config.server.listen_address,
            jobs_dir = %self.config.dir.jobs.display(),
            downloads_dir = %self.config.dir.downloads.display(),
            "github artifacts mirror is going up"
        );

        let http_cancel = cancel.clone();
        let http = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { http_cancel.cancelled().await })
                .await
        });

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);

        // Single consumer: one job at any given moment.
        let consumer_daemon = Arc::clone(&self);
        let consumer = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = handlers::handle(&consumer_daemon, &job).await;
                consumer_daemon.scheduler.settle(&job, &outcome);
            }
        });

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.scheduler.pump(&tx).await,
            }
        }

        info!("shutting down");
        // Closing the channel lets the consumer finish the job in hand
        // and drain; jobs still on disk are picked up on next start.
        drop(tx);
        if let Err(err) = consumer.await {
            error!(error = %err, "job consumer ended abnormally");
        }

        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, http).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => error!(error = %err, "http server error"),
            Ok(Err(err)) => error!(error = %err, "http server task ended abnormally"),
            Err(_) => error!("http server did not shut down in time"),
        }

        info!("github artifacts mirror is down");
        Ok(())
    }
}
