//! Lookout event streams: wrap a cluster event watch, drop stale records and
//! normalise the rest into [`EventMessage`] values for the registry models.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Event as KubeEvent;
use kube::api::{Api, WatchParams};
use kube::core::WatchEvent;
use kube::Client;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use lookout_core::env;
use lookout_core::EventMessage;

/// Tunables for event subscriptions.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Events older than this many seconds at ingest are dropped.
    pub freshness_secs: u64,
    /// Server-side watch timeout; the stream closes when it elapses.
    pub watch_timeout_secs: u32,
    /// Capacity of the per-subscription output channel.
    pub channel_cap: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            freshness_secs: env::u64_var("LOOKOUT_EVENT_FRESHNESS_SECS", 30),
            watch_timeout_secs: env::u64_var("LOOKOUT_WATCH_TIMEOUT_SECS", 60) as u32,
            channel_cap: env::usize_var("LOOKOUT_EVENT_QUEUE_CAP", 64),
        }
    }
}

/// What to subscribe to: a namespace (or all) plus optional selectors.
#[derive(Debug, Clone, Default)]
pub struct WatchScope {
    pub namespace: Option<String>,
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
}

/// Factory for event subscriptions sharing one kube client.
#[derive(Clone)]
pub struct EventsClient {
    client: Client,
    cfg: EventsConfig,
}

impl EventsClient {
    pub fn new(client: Client) -> Self {
        Self::with_config(client, EventsConfig::default())
    }

    pub fn with_config(client: Client, cfg: EventsConfig) -> Self {
        Self { client, cfg }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    /// Start a watch for the given scope. The returned channel yields fresh,
    /// normalised event records and closes when the watch ends: server-side
    /// timeout, stream error, or `cancel` firing.
    pub fn watch(
        &self,
        scope: WatchScope,
        cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<EventMessage> {
        let (tx, rx) = mpsc::channel(self.cfg.channel_cap);
        tokio::spawn(run_watch(self.client.clone(), self.cfg.clone(), scope, cancel, tx));
        rx
    }
}

async fn run_watch(
    client: Client,
    cfg: EventsConfig,
    scope: WatchScope,
    mut cancel: watch::Receiver<bool>,
    tx: mpsc::Sender<EventMessage>,
) {
    let api: Api<KubeEvent> = match scope.namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let mut wp = WatchParams::default().timeout(cfg.watch_timeout_secs);
    if let Some(fields) = scope.field_selector.as_deref() {
        wp = wp.fields(fields);
    }
    if let Some(labels) = scope.label_selector.as_deref() {
        wp = wp.labels(labels);
    }
    debug!(namespace = ?scope.namespace, fields = ?scope.field_selector, "watch event started");

    let stream = match api.watch(&wp, "0").await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, namespace = ?scope.namespace, "failed to watch on events");
            counter!("event_watch_errors_total", 1u64);
            return;
        }
    };
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            maybe = stream.try_next() => {
                match maybe {
                    Ok(Some(WatchEvent::Added(ev)))
                    | Ok(Some(WatchEvent::Modified(ev)))
                    | Ok(Some(WatchEvent::Deleted(ev))) => {
                        if let Some(msg) = admit(&ev, Utc::now(), cfg.freshness_secs) {
                            counter!("events_emitted_total", 1u64);
                            if tx.send(msg).await.is_err() {
                                debug!("event receiver dropped; stopping watch");
                                return;
                            }
                        }
                    }
                    Ok(Some(WatchEvent::Bookmark(_))) => {}
                    Ok(Some(WatchEvent::Error(e))) => {
                        warn!(code = e.code, message = %e.message, "failed to parse event object");
                        counter!("event_watch_errors_total", 1u64);
                    }
                    Ok(None) => {
                        warn!(timeout = cfg.watch_timeout_secs, "stop watching on events, got timeout");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "event watch stream error");
                        counter!("event_watch_errors_total", 1u64);
                        return;
                    }
                }
            }
            _ = cancel.changed() => {
                debug!(namespace = ?scope.namespace, "stop events watch, got cancel signal");
                return;
            }
        }
    }
}

/// Freshness gate: normalise `event` unless it is older than
/// `freshness_secs` at `now`. Events without a creation timestamp are
/// unplaceable in time and dropped.
pub fn admit(event: &KubeEvent, now: DateTime<Utc>, freshness_secs: u64) -> Option<EventMessage> {
    let created = match event.metadata.creation_timestamp.as_ref() {
        Some(t) => t.0,
        None => {
            debug!(message = ?event.message, "event missing creation timestamp");
            return None;
        }
    };
    let age = now.signed_duration_since(created);
    if age.num_seconds() >= freshness_secs as i64 {
        debug!(message = ?event.message, age_secs = age.num_seconds(), "event too old");
        counter!("events_stale_total", 1u64);
        return None;
    }
    Some(EventMessage {
        message: event.message.clone().unwrap_or_default(),
        timestamp_ns: created.timestamp_nanos_opt().unwrap_or_default(),
        action: event.action.clone().unwrap_or_default(),
        reporting_controller: event.reporting_component.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn kube_event(message: &str, created: DateTime<Utc>) -> KubeEvent {
        let mut ev = KubeEvent::default();
        ev.metadata.creation_timestamp = Some(Time(created));
        ev.message = Some(message.to_string());
        ev.action = Some("Scheduled".to_string());
        ev.reporting_component = Some("kubelet".to_string());
        ev
    }

    #[test]
    fn fresh_event_is_admitted_and_normalised() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let created = now - chrono::Duration::seconds(5);
        let msg = admit(&kube_event("pulled image", created), now, 30).unwrap();
        assert_eq!(msg.message, "pulled image");
        assert_eq!(msg.timestamp_ns, created.timestamp_nanos_opt().unwrap());
        assert_eq!(msg.action, "Scheduled");
        assert_eq!(msg.reporting_controller, "kubelet");
    }

    #[test]
    fn stale_event_is_dropped() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let created = now - chrono::Duration::seconds(60);
        assert!(admit(&kube_event("old", created), now, 30).is_none());
    }

    #[test]
    fn event_at_window_boundary_is_dropped() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let created = now - chrono::Duration::seconds(30);
        assert!(admit(&kube_event("boundary", created), now, 30).is_none());
    }

    #[test]
    fn event_without_creation_timestamp_is_dropped() {
        let mut ev = KubeEvent::default();
        ev.message = Some("no-ts".to_string());
        assert!(admit(&ev, Utc::now(), 30).is_none());
    }

    #[test]
    fn missing_optional_fields_become_empty_strings() {
        let now = Utc::now();
        let mut ev = KubeEvent::default();
        ev.metadata.creation_timestamp = Some(Time(now));
        let msg = admit(&ev, now, 30).unwrap();
        assert_eq!(msg.message, "");
        assert_eq!(msg.action, "");
        assert_eq!(msg.reporting_controller, "");
    }
}
