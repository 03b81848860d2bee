//! Lookout reporter adaptor: bounded outbound queues carrying deployment
//! lifecycle notifications to whatever consumers are wired up downstream.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use lookout_core::{env, AppStatus};

/// One lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentReport {
    /// Targets extracted from the application's report annotations.
    pub to: Vec<String>,
    pub deploy_by: String,
    pub name: String,
    /// Dashboard link, `deployments/<app>/<creation_ts>`.
    pub uri: String,
    pub status: AppStatus,
}

/// Producer half: what the registry manager holds.
#[derive(Clone)]
pub struct ReporterManager {
    started: mpsc::Sender<DeploymentReport>,
    deleted: mpsc::Sender<DeploymentReport>,
    finished: mpsc::Sender<DeploymentReport>,
    fallback: mpsc::Sender<DeploymentReport>,
}

/// Consumer half: one receiver per queue, handed to the notification sinks.
pub struct ReporterQueues {
    pub started: mpsc::Receiver<DeploymentReport>,
    pub deleted: mpsc::Receiver<DeploymentReport>,
    pub finished: mpsc::Receiver<DeploymentReport>,
    pub fallback: mpsc::Receiver<DeploymentReport>,
}

/// Build the queue pair with the configured capacity
/// (`LOOKOUT_REPORTER_QUEUE_CAP`, default 256).
pub fn channel() -> (ReporterManager, ReporterQueues) {
    with_capacity(env::usize_var("LOOKOUT_REPORTER_QUEUE_CAP", 256))
}

pub fn with_capacity(cap: usize) -> (ReporterManager, ReporterQueues) {
    let (started_tx, started_rx) = mpsc::channel(cap);
    let (deleted_tx, deleted_rx) = mpsc::channel(cap);
    let (finished_tx, finished_rx) = mpsc::channel(cap);
    let (fallback_tx, fallback_rx) = mpsc::channel(cap);
    (
        ReporterManager {
            started: started_tx,
            deleted: deleted_tx,
            finished: finished_tx,
            fallback: fallback_tx,
        },
        ReporterQueues {
            started: started_rx,
            deleted: deleted_rx,
            finished: finished_rx,
            fallback: fallback_rx,
        },
    )
}

impl ReporterManager {
    pub async fn deployment_started(&self, report: DeploymentReport) {
        Self::push(&self.started, "started", report).await;
    }

    pub async fn deployment_deleted(&self, report: DeploymentReport) {
        Self::push(&self.deleted, "deleted", report).await;
    }

    pub async fn deployment_finished(&self, report: DeploymentReport) {
        Self::push(&self.finished, "finished", report).await;
    }

    /// Untyped outlet for report kinds no dedicated queue classifies.
    pub async fn report(&self, report: DeploymentReport) {
        Self::push(&self.fallback, "fallback", report).await;
    }

    async fn push(tx: &mpsc::Sender<DeploymentReport>, queue: &str, report: DeploymentReport) {
        debug!(queue, name = %report.name, status = %report.status, "queueing deployment report");
        // Awaits when the queue is full; capacity bounds the latency.
        if tx.send(report).await.is_err() {
            warn!(queue, "reporter queue consumer is gone; dropping report");
        }
    }
}
