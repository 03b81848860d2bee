//! The registry manager: row creation, lookup, recovery from storage and the
//! periodic save loop that persists snapshots and retires finished rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lookout_core::{
    metadata_by_prefix, metadata_value, AppStatus, Identity, Resources, Snapshot,
    StatusDescription,
};
use lookout_persist::Storage;
use lookout_reporter::{DeploymentReport, ReporterManager};

use crate::now_ts;
use crate::row::Row;

/// Manager tunables, overridable through `LOOKOUT_*` variables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cadence of the persistence loop.
    pub save_interval: Duration,
    /// Grace period before a row's detector starts evaluating completion.
    pub check_finish_delay: Duration,
    /// How long a terminal row keeps collecting events before `finish`.
    pub collect_window: Duration,
    /// Annotation prefix for report routing, e.g. `lookout.io`.
    pub metadata_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        use lookout_core::env;
        Self {
            save_interval: Duration::from_secs(env::u64_var("LOOKOUT_SAVE_INTERVAL_SECS", 5)),
            check_finish_delay: Duration::from_secs(env::u64_var(
                "LOOKOUT_CHECK_FINISH_DELAY_SECS",
                300,
            )),
            collect_window: Duration::from_secs(env::u64_var("LOOKOUT_COLLECT_WINDOW_SECS", 300)),
            metadata_prefix: env::string_var("LOOKOUT_METADATA_PREFIX", "lookout.io"),
        }
    }
}

/// Shutdown handle for the save loop. Signals the loop and waits for it to
/// acknowledge. Row detectors are left alone: they end at their terminal
/// transitions or when their own cancellation fires.
pub struct StopHandle {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl StopHandle {
    pub async fn stop(self) {
        self.cancel.send_replace(true);
        let _ = self.handle.await;
    }
}

/// Owns every tracked row, keyed by the encoded identity.
pub struct RegistryManager {
    rows: RwLock<HashMap<String, Arc<Row>>>,
    cfg: RegistryConfig,
    /// Serialises row creation.
    new_app_lock: Mutex<()>,
    /// Serialises save cycles; a slow cycle must not overlap the next tick.
    save_lock: Mutex<()>,
    storage: Arc<dyn Storage>,
    reporter: ReporterManager,
}

impl RegistryManager {
    pub fn new(
        cfg: RegistryConfig,
        storage: Arc<dyn Storage>,
        reporter: ReporterManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            rows: RwLock::new(HashMap::new()),
            cfg,
            new_app_lock: Mutex::new(()),
            save_lock: Mutex::new(()),
            storage,
            reporter,
        })
    }

    /// Register a new tracked deployment and start its detector. A second
    /// registration under the same `(application, namespace)` replaces the
    /// prior row.
    pub async fn new_application(
        &self,
        app_name: &str,
        resource_name: &str,
        namespace: &str,
        cluster: &str,
        annotations: &HashMap<String, String>,
        status: AppStatus,
    ) -> Arc<Row> {
        let _guard = self.new_app_lock.lock().await;

        let identity = Identity::new(app_name, namespace);
        let report_to =
            metadata_by_prefix(annotations, &format!("{}/report-", self.cfg.metadata_prefix));
        let deploy_by =
            metadata_value(annotations, &format!("{}/report-deploy-by", self.cfg.metadata_prefix));

        let snapshot = Snapshot {
            application: app_name.to_string(),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            creation_ts: now_ts(),
            report_to: report_to.clone(),
            deploy_by: deploy_by.clone(),
            description: StatusDescription::Running,
            resources: Resources::default(),
        };
        let row = Row::new(snapshot, status, self.cfg.collect_window);
        self.rows.write().unwrap().insert(identity.encoded(), Arc::clone(&row));
        counter!("registry_rows_created_total", 1u64);

        let report = DeploymentReport {
            to: report_to.clone(),
            deploy_by: deploy_by.clone(),
            name: app_name.to_string(),
            uri: row.uri(),
            status,
        };
        match status {
            AppStatus::Running => self.reporter.deployment_started(report).await,
            AppStatus::Deleted => self.reporter.deployment_deleted(report).await,
            _ => info!(status = %status, "reporter status not supported"),
        }

        info!(
            application = %app_name,
            resource = %resource_name,
            deploy_by = %deploy_by,
            report_to = ?report_to,
            namespace = %namespace,
            cluster = %cluster,
            "new application deployment started"
        );

        row.spawn_detector(self.cfg.check_finish_delay);
        row
    }

    /// The in-memory row, if one is registered. No side effects.
    pub fn get(&self, name: &str, namespace: &str) -> Option<Arc<Row>> {
        self.rows.read().unwrap().get(&Identity::new(name, namespace).encoded()).cloned()
    }

    /// Recover rows that were running when the previous process stopped.
    /// Each comes back with its storage id, a fresh cancellation and a new
    /// detector.
    pub async fn load_running(&self) -> Vec<Arc<Row>> {
        let applies = match self.storage.get_applies_by_status(AppStatus::Running).await {
            Ok(applies) => applies,
            Err(e) => {
                warn!(error = %e, "failed to load running applies from storage");
                return Vec::new();
            }
        };
        info!(count = applies.len(), "loading running applies from storage");

        let mut rows = Vec::with_capacity(applies.len());
        for (id, snapshot) in applies {
            let identity = Identity::new(&snapshot.application, &snapshot.namespace);
            let row = Row::with_id(id, snapshot, AppStatus::Running, self.cfg.collect_window);
            row.spawn_detector(self.cfg.check_finish_delay);
            self.rows.write().unwrap().insert(identity.encoded(), Arc::clone(&row));
            rows.push(row);
        }
        rows
    }

    pub async fn update_applies_version_history(
        &self,
        name: &str,
        namespace: &str,
        hash: u64,
    ) -> bool {
        self.storage
            .update_applies_version_history(&Identity::new(name, namespace).history_key(), hash)
            .await
    }

    pub async fn delete_applied_version(&self, name: &str, namespace: &str) -> bool {
        self.storage.delete_applied_version(&Identity::new(name, namespace).history_key()).await
    }

    /// Start the periodic save loop and hand back its shutdown handle.
    pub fn serve(self: &Arc<Self>) -> StopHandle {
        let (cancel, mut cancelled) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.cfg.save_interval) => {
                        manager.save().await;
                    }
                    _ = cancelled.changed() => {
                        warn!("registry save loop has been shut down");
                        return;
                    }
                }
            }
        });
        StopHandle { cancel, handle }
    }

    /// One save cycle: persist every row concurrently, emit finish
    /// notifications, and drop rows that are finished or failed their first
    /// save.
    pub async fn save(&self) {
        let _guard = self.save_lock.lock().await;
        let started = std::time::Instant::now();

        let entries: Vec<(String, Arc<Row>)> = self
            .rows
            .read()
            .unwrap()
            .iter()
            .map(|(key, row)| (key.clone(), Arc::clone(row)))
            .collect();

        let tasks = entries.into_iter().map(|(key, row)| async move {
            let snapshot = row.snapshot().clone();
            let status = row.status();
            if row.id() == 0 {
                match self.storage.create_apply(&snapshot, status).await {
                    Ok(id) => row.set_id(id),
                    Err(e) => {
                        warn!(
                            application = %snapshot.application,
                            namespace = %snapshot.namespace,
                            error = %e,
                            "first save failed; dropping row from registry"
                        );
                        counter!("registry_rows_dropped_total", 1u64);
                        return Some(key);
                    }
                }
            } else if let Err(e) = self.storage.update_apply(row.id(), &snapshot, status).await {
                warn!(
                    application = %snapshot.application,
                    namespace = %snapshot.namespace,
                    error = %e,
                    "failed to update apply"
                );
            }
            debug!(name = %snapshot.application, "deployment was saved");

            if row.is_finished() {
                // Status re-read after the finish latch so the notification
                // carries the terminal value.
                let status = row.status();
                if status != AppStatus::Deleted {
                    self.reporter
                        .deployment_finished(DeploymentReport {
                            to: snapshot.report_to.clone(),
                            deploy_by: snapshot.deploy_by.clone(),
                            name: snapshot.application.clone(),
                            uri: snapshot.uri(),
                            status,
                        })
                        .await;
                }
                return Some(key);
            }
            None
        });

        let delete_keys: Vec<String> = join_all(tasks).await.into_iter().flatten().collect();
        if !delete_keys.is_empty() {
            let mut rows = self.rows.write().unwrap();
            for key in &delete_keys {
                rows.remove(key);
            }
            debug!(count = delete_keys.len(), "retired registry rows");
        }
        histogram!("registry_save_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Number of rows currently tracked in memory.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }
}
