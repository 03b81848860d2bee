//! A registry row: the state machine of one tracked application deployment,
//! and the detector task that drives it to a terminal status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use lookout_core::{
    AppStatus, DaemonsetData, DeploymentData, MetaData, Snapshot, StatusDescription,
};

use crate::now_ts;

/// Fixed cadence of the termination detector.
const DETECT_INTERVAL: Duration = Duration::from_secs(2);

/// Raised by the completion predicates when a tracked resource outlives its
/// progress deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressDeadlineExceeded;

/// One tracked application deployment.
///
/// The snapshot behind the row lock is the unit of consistency: ingestion,
/// the detector and the save loop all take short guards and never hold one
/// across an await.
pub struct Row {
    /// Storage primary key; `0` until the first successful save.
    id: AtomicI64,
    /// Terminal latch. Once set the manager persists and drops the row.
    finish: AtomicBool,
    status: RwLock<AppStatus>,
    cancel: watch::Sender<bool>,
    collect_window: Duration,
    snapshot: RwLock<Snapshot>,
}

impl Row {
    pub(crate) fn new(snapshot: Snapshot, status: AppStatus, collect_window: Duration) -> Arc<Self> {
        Self::with_id(0, snapshot, status, collect_window)
    }

    pub(crate) fn with_id(
        id: i64,
        snapshot: Snapshot,
        status: AppStatus,
        collect_window: Duration,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            id: AtomicI64::new(id),
            finish: AtomicBool::new(false),
            status: RwLock::new(status),
            cancel,
            collect_window,
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn id(&self) -> i64 {
        self.id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id(&self, id: i64) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finish.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> AppStatus {
        *self.status.read().unwrap()
    }

    /// Dashboard link for this deployment.
    pub fn uri(&self) -> String {
        self.snapshot.read().unwrap().uri()
    }

    /// Signal the detector (and any subscribed streams) to stand down.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Cancellation signal for collaborators feeding this row.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Read access to the current snapshot.
    pub fn snapshot(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap()
    }

    /// Scoped mutation of the snapshot; ingestion callers go through here.
    pub fn snapshot_mut(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap()
    }

    /// Associate a deployment with this application.
    pub fn add_deployment(
        &self,
        name: &str,
        namespace: &str,
        labels: HashMap<String, String>,
        desired_state: i32,
        progress_deadline_s: i64,
    ) {
        let mut snap = self.snapshot.write().unwrap();
        snap.resources.deployments.insert(
            name.to_string(),
            DeploymentData::new(
                MetaData {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    labels,
                    desired_state,
                },
                progress_deadline_s,
            ),
        );
        info!(
            application = %snap.application,
            namespace = %snap.namespace,
            deployment = %name,
            "deployment associated to application"
        );
    }

    /// Associate a daemonset with this application.
    pub fn add_daemonset(
        &self,
        name: &str,
        namespace: &str,
        labels: HashMap<String, String>,
        desired_state: i32,
        progress_deadline_s: i64,
    ) {
        let mut snap = self.snapshot.write().unwrap();
        snap.resources.daemonsets.insert(
            name.to_string(),
            DaemonsetData::new(
                MetaData {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    labels,
                    desired_state,
                },
                progress_deadline_s,
            ),
        );
        info!(
            application = %snap.application,
            namespace = %snap.namespace,
            daemonset = %name,
            "daemonset associated to application"
        );
    }

    /// Deployment completion: every tracked deployment has a replica-set with
    /// live replicas and the summed ready count matches the summed desired
    /// state. An empty set is complete; a deployment past its progress
    /// deadline is an error.
    fn deployments_finished(&self) -> Result<bool, ProgressDeadlineExceeded> {
        let snap = self.snapshot.read().unwrap();
        if snap.resources.deployments.is_empty() {
            return Ok(true);
        }
        let elapsed = now_ts() - snap.creation_ts;
        let mut running_replica_sets = 0usize;
        let mut desired: i32 = 0;
        let mut ready: i32 = 0;
        for deployment in snap.resources.deployments.values() {
            desired += deployment.metadata.desired_state;
            for replica_set in deployment.replica_sets.values() {
                if replica_set.status.replicas > 0 {
                    running_replica_sets += 1;
                }
                ready += replica_set.status.ready_replicas.unwrap_or_default();
            }
            if deployment.progress_deadline_s < elapsed {
                error!(
                    progress_deadline_seconds = deployment.progress_deadline_s,
                    deploy_time = elapsed,
                    application = %snap.application,
                    deployment = %deployment.metadata.name,
                    namespace = %deployment.metadata.namespace,
                    "failed due to progress deadline"
                );
                return Err(ProgressDeadlineExceeded);
            }
        }
        debug!(
            application = %snap.application,
            namespace = %snap.namespace,
            replicaset_count = running_replica_sets,
            desired_state_count = desired,
            ready_replicas_count = ready,
            count_deployments = snap.resources.deployments.len(),
            "deployment status"
        );
        if snap.resources.deployments.len() == running_replica_sets && desired == ready
            || self.status() == AppStatus::Deleted
        {
            info!(
                application = %snap.application,
                namespace = %snap.namespace,
                desired_state_count = desired,
                ready_replicas_count = ready,
                "deployment was finished"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// DaemonSet completion: summed desired scheduled pods match the summed
    /// current and updated counts. An empty set is complete; a daemonset past
    /// its progress deadline is an error.
    fn daemonsets_finished(&self) -> Result<bool, ProgressDeadlineExceeded> {
        let snap = self.snapshot.read().unwrap();
        if snap.resources.daemonsets.is_empty() {
            return Ok(true);
        }
        let elapsed = now_ts() - snap.creation_ts;
        let mut desired: i32 = 0;
        let mut updated: i32 = 0;
        let mut current: i32 = 0;
        for daemonset in snap.resources.daemonsets.values() {
            desired += daemonset.status.desired_number_scheduled;
            updated += daemonset.status.desired_number_scheduled;
            current += daemonset.status.current_number_scheduled;
            if daemonset.progress_deadline_s < elapsed {
                error!(
                    progress_deadline_seconds = daemonset.progress_deadline_s,
                    deploy_time = elapsed,
                    application = %snap.application,
                    daemonset = %daemonset.metadata.name,
                    namespace = %daemonset.metadata.namespace,
                    "failed due to progress deadline"
                );
                return Err(ProgressDeadlineExceeded);
            }
        }
        debug!(
            application = %snap.application,
            namespace = %snap.namespace,
            total_desired_pods = desired,
            current_pods_count = current,
            total_daemonsets = snap.resources.daemonsets.len(),
            "daemonset status"
        );
        if desired == current && desired == updated || self.status() == AppStatus::Deleted {
            info!(
                application = %snap.application,
                namespace = %snap.namespace,
                total_desired_pods = desired,
                current_pods_count = current,
                "daemonset apply was finished"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark the row terminal. Sleeps the collect window first so trailing
    /// events still land in the snapshot, then writes the description and
    /// latches `finish` with the terminal status. Completes before the
    /// detector task returns, so the next save observes all three together.
    pub async fn stop(&self, status: AppStatus, description: StatusDescription) {
        debug!(
            application = %self.snapshot.read().unwrap().application,
            status = %status,
            "marked as done"
        );
        tokio::time::sleep(self.collect_window).await;
        self.snapshot.write().unwrap().description = description;
        self.finish.store(true, Ordering::SeqCst);
        *self.status.write().unwrap() = status;
    }

    /// Spawn the termination detector for this row. Called exactly once per
    /// row, by the manager that created it.
    pub(crate) fn spawn_detector(self: &Arc<Self>, check_finish_delay: Duration) {
        let row = Arc::clone(self);
        tokio::spawn(async move {
            {
                let snap = row.snapshot.read().unwrap();
                info!(
                    application = %snap.application,
                    namespace = %snap.namespace,
                    deployment_count = snap.resources.deployments.len(),
                    daemonset_count = snap.resources.daemonsets.len(),
                    check_delay_secs = check_finish_delay.as_secs(),
                    "starting to watch on registry row"
                );
            }
            let mut cancelled = row.cancelled();
            // Grace period so the watch streams can populate the models.
            tokio::time::sleep(check_finish_delay).await;

            if row.status() == AppStatus::Deleted {
                row.stop(AppStatus::Deleted, StatusDescription::Successful).await;
                row.cancel();
                return;
            }

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(DETECT_INTERVAL) => {
                        if row.is_finished() {
                            return;
                        }
                        let deployments = row.deployments_finished();
                        let daemonsets = row.daemonsets_finished();
                        if deployments.is_err() || daemonsets.is_err() {
                            row.stop(AppStatus::Failed, StatusDescription::ProgressDeadline).await;
                            row.cancel();
                            let snap = row.snapshot.read().unwrap();
                            error!(
                                application = %snap.application,
                                namespace = %snap.namespace,
                                deployment_deadline = deployments.is_err(),
                                daemonset_deadline = daemonsets.is_err(),
                                "registry row watch errored"
                            );
                            return;
                        }
                        if let (Ok(true), Ok(true)) = (deployments, daemonsets) {
                            row.stop(AppStatus::Successful, StatusDescription::Successful).await;
                            row.cancel();
                        }
                    }
                    _ = cancelled.changed() => {
                        let snap = row.snapshot.read().unwrap();
                        debug!(
                            application = %snap.application,
                            namespace = %snap.namespace,
                            "registry row watch stopped, got cancel signal"
                        );
                        return;
                    }
                }
            }
        });
    }
}
