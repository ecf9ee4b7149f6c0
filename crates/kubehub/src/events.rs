//! Audit records as core/v1 Events attached to the Application.

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Event, EventSource, ObjectReference},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use keel_core::{
    ports::{AuditEvent, AuditSink},
    APP_GROUP, APP_KIND, APP_VERSION,
};
use kube::{
    api::{Api, PostParams},
    Client,
};
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

const COMPONENT: &str = "keel-server";

/// Build the Event recorded for `ev`.
pub fn event_for(ev: &AuditEvent) -> Event {
    let suffix = Uuid::new_v4().simple().to_string();
    let mut labels = std::collections::BTreeMap::new();
    labels.insert("app.keel.io/project".to_string(), ev.project.clone());
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{}", ev.app.name, &suffix[..16])),
            namespace: Some(ev.app.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(format!("{APP_GROUP}/{APP_VERSION}")),
            kind: Some(APP_KIND.to_string()),
            name: Some(ev.app.name.clone()),
            namespace: Some(ev.app.namespace.clone()),
            ..Default::default()
        },
        reason: Some(ev.reason.clone()),
        message: Some(ev.message.clone()),
        type_: Some("Normal".to_string()),
        source: Some(EventSource { component: Some(COMPONENT.to_string()), host: None }),
        first_timestamp: Some(Time(ev.at)),
        last_timestamp: Some(Time(ev.at)),
        count: Some(1),
        ..Default::default()
    }
}

pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl AuditSink for KubeEventRecorder {
    async fn record(&self, ev: AuditEvent) {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &ev.app.namespace);
        match api.create(&PostParams::default(), &event_for(&ev)).await {
            Ok(_) => {
                counter!("audit_events_total", 1u64, "sink" => "kube");
                debug!(app = %ev.app, reason = %ev.reason, "kube: event recorded");
            }
            // Auditing never fails the request.
            Err(e) => warn!(app = %ev.app, reason = %ev.reason, error = %e, "kube: event not recorded"),
        }
    }
}
