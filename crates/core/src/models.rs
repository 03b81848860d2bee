//! Per-kind resource models tracked under an application snapshot.
//!
//! Deployment and DaemonSet share the pod surface; the pod helpers operate on
//! the bare pod map so both kinds delegate to the same code.

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentStatus, ReplicaSetStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::EventMessage;

/// Typed errors returned by model mutations. Callers decide whether a
/// `NotFound` means create-then-retry or drop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
}

/// Metadata shared by deployment and daemonset models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaData {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub desired_state: i32,
}

/// A pod owned by a tracked resource: current phase plus its event trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodData {
    pub phase: String,
    pub events: Vec<EventMessage>,
}

/// A replica-set owned by a tracked deployment. Created lazily by name on
/// first reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaSetData {
    pub events: Vec<EventMessage>,
    pub status: ReplicaSetStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentData {
    pub metadata: MetaData,
    pub pods: HashMap<String, PodData>,
    pub replica_sets: HashMap<String, ReplicaSetData>,
    pub events: Vec<EventMessage>,
    pub status: DeploymentStatus,
    pub progress_deadline_s: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonsetData {
    pub metadata: MetaData,
    pub pods: HashMap<String, PodData>,
    pub events: Vec<EventMessage>,
    pub status: DaemonSetStatus,
    pub progress_deadline_s: i64,
}

impl DeploymentData {
    pub fn new(metadata: MetaData, progress_deadline_s: i64) -> Self {
        Self { metadata, progress_deadline_s, ..Self::default() }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Overwrite the aggregate deployment status.
    pub fn update_status(&mut self, status: DeploymentStatus) {
        self.status = status;
    }

    /// Append to the deployment-level event trail.
    pub fn append_event(&mut self, event: EventMessage) {
        self.events.push(event);
    }

    /// Lazily create the replica-set entry; idempotent.
    pub fn ensure_replica_set(&mut self, name: &str) {
        self.replica_sets.entry(name.to_string()).or_default();
    }

    pub fn append_replica_set_event(
        &mut self,
        name: &str,
        event: EventMessage,
    ) -> Result<(), ModelError> {
        match self.replica_sets.get_mut(name) {
            Some(rs) => {
                rs.events.push(event);
                Ok(())
            }
            None => Err(ModelError::NotFound(format!("replicaset {name}"))),
        }
    }

    pub fn update_replica_set_status(
        &mut self,
        name: &str,
        status: ReplicaSetStatus,
    ) -> Result<(), ModelError> {
        match self.replica_sets.get_mut(name) {
            Some(rs) => {
                rs.status = status;
                Ok(())
            }
            None => Err(ModelError::NotFound(format!("replicaset {name}"))),
        }
    }

    pub fn add_pod(&mut self, name: &str, phase: &str) -> Result<(), ModelError> {
        insert_pod(&mut self.pods, name, phase)
    }

    pub fn append_pod_event(&mut self, name: &str, event: EventMessage) -> Result<(), ModelError> {
        append_pod_event(&mut self.pods, name, event)
    }

    pub fn update_pod_phase(&mut self, name: &str, phase: &str) -> Result<(), ModelError> {
        set_pod_phase(&mut self.pods, name, phase)
    }
}

impl DaemonsetData {
    pub fn new(metadata: MetaData, progress_deadline_s: i64) -> Self {
        Self { metadata, progress_deadline_s, ..Self::default() }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Overwrite the scheduled-counts status.
    pub fn update_status(&mut self, status: DaemonSetStatus) {
        self.status = status;
    }

    pub fn append_event(&mut self, event: EventMessage) {
        self.events.push(event);
    }

    pub fn add_pod(&mut self, name: &str, phase: &str) -> Result<(), ModelError> {
        insert_pod(&mut self.pods, name, phase)
    }

    pub fn append_pod_event(&mut self, name: &str, event: EventMessage) -> Result<(), ModelError> {
        append_pod_event(&mut self.pods, name, event)
    }

    pub fn update_pod_phase(&mut self, name: &str, phase: &str) -> Result<(), ModelError> {
        set_pod_phase(&mut self.pods, name, phase)
    }
}

fn insert_pod(
    pods: &mut HashMap<String, PodData>,
    name: &str,
    phase: &str,
) -> Result<(), ModelError> {
    if pods.contains_key(name) {
        debug!(pod = %name, "pod already exists in pod list");
        return Err(ModelError::Duplicate(format!("pod {name}")));
    }
    pods.insert(name.to_string(), PodData { phase: phase.to_string(), events: Vec::new() });
    Ok(())
}

fn append_pod_event(
    pods: &mut HashMap<String, PodData>,
    name: &str,
    event: EventMessage,
) -> Result<(), ModelError> {
    let pod = pods.get_mut(name).ok_or_else(|| {
        warn!(pod = %name, "pod not exists in pod list");
        ModelError::NotFound(format!("pod {name}"))
    })?;
    // Skip events already recorded with the same message and timestamp.
    if pod
        .events
        .iter()
        .any(|e| e.message == event.message && e.timestamp_ns == event.timestamp_ns)
    {
        return Ok(());
    }
    pod.events.push(event);
    Ok(())
}

fn set_pod_phase(
    pods: &mut HashMap<String, PodData>,
    name: &str,
    phase: &str,
) -> Result<(), ModelError> {
    let pod = pods.get_mut(name).ok_or_else(|| {
        warn!(pod = %name, "pod not exists in pod list");
        ModelError::NotFound(format!("pod {name}"))
    })?;
    pod.phase = phase.to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(msg: &str, ts: i64) -> EventMessage {
        EventMessage {
            message: msg.to_string(),
            timestamp_ns: ts,
            action: String::new(),
            reporting_controller: String::new(),
        }
    }

    fn deployment() -> DeploymentData {
        DeploymentData::new(
            MetaData { name: "web".into(), namespace: "default".into(), ..Default::default() },
            600,
        )
    }

    #[test]
    fn add_pod_rejects_duplicates() {
        let mut d = deployment();
        d.add_pod("web-1", "Pending").unwrap();
        let err = d.add_pod("web-1", "Running").unwrap_err();
        assert!(matches!(err, ModelError::Duplicate(_)));
        assert_eq!(d.pods["web-1"].phase, "Pending");
    }

    #[test]
    fn pod_events_deduplicate_on_message_and_time() {
        let mut d = deployment();
        d.add_pod("web-1", "Running").unwrap();
        d.append_pod_event("web-1", event("X", 100)).unwrap();
        d.append_pod_event("web-1", event("X", 100)).unwrap();
        d.append_pod_event("web-1", event("X", 101)).unwrap();
        assert_eq!(d.pods["web-1"].events.len(), 2);
    }

    #[test]
    fn pod_ops_on_unknown_pod_return_not_found() {
        let mut d = deployment();
        assert!(matches!(
            d.append_pod_event("ghost", event("X", 1)),
            Err(ModelError::NotFound(_))
        ));
        assert!(matches!(d.update_pod_phase("ghost", "Running"), Err(ModelError::NotFound(_))));
    }

    #[test]
    fn update_pod_phase_overwrites() {
        let mut d = deployment();
        d.add_pod("web-1", "Pending").unwrap();
        d.update_pod_phase("web-1", "Running").unwrap();
        assert_eq!(d.pods["web-1"].phase, "Running");
    }

    #[test]
    fn replica_set_requires_ensure() {
        let mut d = deployment();
        assert!(matches!(
            d.append_replica_set_event("rs-1", event("scaled", 5)),
            Err(ModelError::NotFound(_))
        ));
        d.ensure_replica_set("rs-1");
        d.ensure_replica_set("rs-1"); // idempotent
        d.append_replica_set_event("rs-1", event("scaled", 5)).unwrap();
        let status = ReplicaSetStatus { replicas: 3, ready_replicas: Some(3), ..Default::default() };
        d.update_replica_set_status("rs-1", status).unwrap();
        assert_eq!(d.replica_sets.len(), 1);
        assert_eq!(d.replica_sets["rs-1"].events.len(), 1);
        assert_eq!(d.replica_sets["rs-1"].status.replicas, 3);
    }

    #[test]
    fn replica_set_events_do_not_deduplicate() {
        // Dedup is a pod-level rule only.
        let mut d = deployment();
        d.ensure_replica_set("rs-1");
        d.append_replica_set_event("rs-1", event("scaled", 5)).unwrap();
        d.append_replica_set_event("rs-1", event("scaled", 5)).unwrap();
        assert_eq!(d.replica_sets["rs-1"].events.len(), 2);
    }

    #[test]
    fn daemonset_shares_pod_surface() {
        let mut ds = DaemonsetData::new(
            MetaData { name: "agent".into(), namespace: "kube-system".into(), ..Default::default() },
            600,
        );
        ds.add_pod("agent-1", "Running").unwrap();
        ds.append_pod_event("agent-1", event("pulled", 7)).unwrap();
        ds.append_pod_event("agent-1", event("pulled", 7)).unwrap();
        assert_eq!(ds.pods["agent-1"].events.len(), 1);
        ds.update_status(DaemonSetStatus {
            desired_number_scheduled: 4,
            current_number_scheduled: 4,
            ..Default::default()
        });
        assert_eq!(ds.status.desired_number_scheduled, 4);
    }
}
