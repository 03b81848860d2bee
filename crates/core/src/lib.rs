//! Lookout core types: deployment statuses, identities, event records and
//! the resource models aggregated under a tracked application.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub mod models;

pub use models::{DaemonsetData, DeploymentData, MetaData, ModelError, PodData, ReplicaSetData};

/// Lifecycle status of a tracked application deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Running,
    Successful,
    Failed,
    Deleted,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Running => "running",
            AppStatus::Successful => "successful",
            AppStatus::Failed => "failed",
            AppStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable outcome stored with the snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusDescription {
    #[serde(rename = "Deployment is running")]
    Running,
    #[serde(rename = "Deployment completed successfully")]
    Successful,
    #[serde(rename = "Failed due to progress deadline")]
    ProgressDeadline,
}

impl fmt::Display for StatusDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusDescription::Running => "Deployment is running",
            StatusDescription::Successful => "Deployment completed successfully",
            StatusDescription::ProgressDeadline => "Failed due to progress deadline",
        };
        f.write_str(s)
    }
}

/// Identity of a tracked application: `(name, namespace)`.
///
/// Two derived encodings exist and must not be confused: [`Identity::encoded`]
/// keys the in-memory registry map, [`Identity::history_key`] keys the
/// version-history storage rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub namespace: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }

    /// Registry map key: standard base64 of `"<name>-<namespace>"`.
    pub fn encoded(&self) -> String {
        BASE64.encode(format!("{}-{}", self.name, self.namespace))
    }

    /// Version-history key: `"<namespace>-<name>"`, not base64.
    pub fn history_key(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

/// Normalised cluster event record attached to resources and pods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMessage {
    pub message: String,
    /// Event creation time, nanoseconds since the epoch.
    pub timestamp_ns: i64,
    pub action: String,
    pub reporting_controller: String,
}

/// Resource models grouped under one application snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(rename = "Deployments")]
    pub deployments: HashMap<String, DeploymentData>,
    #[serde(rename = "Daemonsets")]
    pub daemonsets: HashMap<String, DaemonsetData>,
}

/// The persisted payload of a registry row. Field names are stable: external
/// consumers read this record straight out of storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "Application")]
    pub application: String,
    #[serde(rename = "Cluster")]
    pub cluster: String,
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "CreationTimestamp")]
    pub creation_ts: i64,
    #[serde(rename = "ReportTo")]
    pub report_to: Vec<String>,
    #[serde(rename = "DeployBy")]
    pub deploy_by: String,
    #[serde(rename = "DeploymentDescription")]
    pub description: StatusDescription,
    #[serde(rename = "Resources")]
    pub resources: Resources,
}

impl Snapshot {
    /// Dashboard link for this deployment.
    pub fn uri(&self) -> String {
        format!("deployments/{}/{}", self.application, self.creation_ts)
    }
}

/// Collect values of annotations whose key starts with `prefix`, ordered by
/// key so callers get deterministic output.
pub fn metadata_by_prefix(annotations: &HashMap<String, String>, prefix: &str) -> Vec<String> {
    let mut hits: Vec<(&String, &String)> =
        annotations.iter().filter(|(k, _)| k.starts_with(prefix)).collect();
    hits.sort_by(|a, b| a.0.cmp(b.0));
    hits.into_iter().map(|(_, v)| v.trim().to_string()).collect()
}

/// Exact-key annotation lookup; empty string when absent.
pub fn metadata_value(annotations: &HashMap<String, String>, key: &str) -> String {
    annotations.get(key).map(|v| v.trim().to_string()).unwrap_or_default()
}

pub mod env {
    //! Environment-variable overrides for tunables, `LOOKOUT_*` convention.

    pub fn u64_var(name: &str, default: u64) -> u64 {
        std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
    }

    pub fn usize_var(name: &str, default: usize) -> usize {
        std::env::var(name).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
    }

    pub fn string_var(name: &str, default: &str) -> String {
        std::env::var(name).unwrap_or_else(|_| default.to_string())
    }
}

pub mod prelude {
    pub use super::{
        AppStatus, DaemonsetData, DeploymentData, EventMessage, Identity, MetaData, ModelError,
        PodData, ReplicaSetData, Resources, Snapshot, StatusDescription,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_encodings_differ() {
        let id = Identity::new("web", "default");
        assert_eq!(id.encoded(), BASE64.encode("web-default"));
        assert_eq!(id.history_key(), "default-web");
    }

    #[test]
    fn identity_encoding_is_deterministic() {
        let a = Identity::new("api", "prod");
        let b = Identity::new("api", "prod");
        assert_eq!(a.encoded(), b.encoded());
        assert_ne!(a.encoded(), Identity::new("api", "staging").encoded());
    }

    #[test]
    fn metadata_prefix_collects_sorted_values() {
        let mut ann = HashMap::new();
        ann.insert("lookout.io/report-slack".to_string(), "#deploys ".to_string());
        ann.insert("lookout.io/report-email".to_string(), "ops@corp".to_string());
        ann.insert("unrelated".to_string(), "x".to_string());
        let got = metadata_by_prefix(&ann, "lookout.io/report-");
        assert_eq!(got, vec!["ops@corp".to_string(), "#deploys".to_string()]);
    }

    #[test]
    fn metadata_value_missing_is_empty() {
        let ann = HashMap::new();
        assert_eq!(metadata_value(&ann, "lookout.io/report-deploy-by"), "");
    }

    #[test]
    fn snapshot_serializes_stable_field_names() {
        let snap = Snapshot {
            application: "web".into(),
            cluster: "east".into(),
            namespace: "default".into(),
            creation_ts: 1_700_000_000,
            report_to: vec!["#deploys".into()],
            deploy_by: "ci".into(),
            description: StatusDescription::Running,
            resources: Resources::default(),
        };
        let v = serde_json::to_value(&snap).unwrap();
        for key in [
            "Application",
            "Cluster",
            "Namespace",
            "CreationTimestamp",
            "ReportTo",
            "DeployBy",
            "DeploymentDescription",
            "Resources",
        ] {
            assert!(v.get(key).is_some(), "missing field {key}");
        }
        assert_eq!(v["DeploymentDescription"], "Deployment is running");
        assert!(v["Resources"].get("Deployments").is_some());
        assert!(v["Resources"].get("Daemonsets").is_some());
    }

    #[test]
    fn snapshot_uri_format() {
        let snap = Snapshot {
            application: "web".into(),
            cluster: "east".into(),
            namespace: "default".into(),
            creation_ts: 42,
            report_to: vec![],
            deploy_by: String::new(),
            description: StatusDescription::Running,
            resources: Resources::default(),
        };
        assert_eq!(snap.uri(), "deployments/web/42");
    }

    #[test]
    fn status_roundtrips_through_serde() {
        for s in [AppStatus::Running, AppStatus::Successful, AppStatus::Failed, AppStatus::Deleted]
        {
            let enc = serde_json::to_string(&s).unwrap();
            let dec: AppStatus = serde_json::from_str(&enc).unwrap();
            assert_eq!(s, dec);
        }
        assert_eq!(serde_json::to_string(&AppStatus::Running).unwrap(), "\"running\"");
    }
}
