use std::sync::Mutex;

use async_trait::async_trait;
use keel_core::ports::{AuditEvent, AuditSink};
use tracing::info;

/// Audit sink that keeps events in memory and mirrors them to the log.
#[derive(Debug, Default)]
pub struct MemAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemAudit {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<AuditEvent> { self.events.lock().unwrap_or_else(|e| e.into_inner()).clone() }

    pub fn messages(&self) -> Vec<String> { self.events().into_iter().map(|e| e.message).collect() }
}

#[async_trait]
impl AuditSink for MemAudit {
    async fn record(&self, event: AuditEvent) {
        info!(app = %event.app, reason = %event.reason, user = %event.user, "audit: {}", event.message);
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAudit;

#[async_trait]
impl AuditSink for LogAudit {
    async fn record(&self, event: AuditEvent) {
        info!(app = %event.app, project = %event.project, reason = %event.reason, user = %event.user, "audit: {}", event.message);
    }
}
