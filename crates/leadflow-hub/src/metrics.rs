//! Runtime metrics: request counts and lead lifecycle counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

use leadflow_core::events::{EventBus, LeadEvent};

/// Global metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub leads_captured: AtomicU64,
    pub leads_unassigned: AtomicU64,
    pub assignments: AtomicU64,
    pub reassignments: AtomicU64,
    pub score_updates: AtomicU64,
    start_time: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn record_request(&self, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_event(&self, event: &LeadEvent) {
        let counter = match event {
            LeadEvent::Captured { .. } => &self.leads_captured,
            LeadEvent::Unassigned { .. } => &self.leads_unassigned,
            LeadEvent::Assigned { .. } => &self.assignments,
            LeadEvent::Reassigned { .. } => &self.reassignments,
            LeadEvent::ScoreUpdated { .. } => &self.score_updates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Export as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let uptime = self.uptime_secs();
        let hours = uptime / 3600;
        let minutes = (uptime % 3600) / 60;
        let seconds = uptime % 60;

        serde_json::json!({
            "uptime": format!("{}h {}m {}s", hours, minutes, seconds),
            "uptime_secs": uptime,
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "success": self.requests_success.load(Ordering::Relaxed),
                "errors": self.requests_error.load(Ordering::Relaxed),
            },
            "leads": {
                "captured": self.leads_captured.load(Ordering::Relaxed),
                "unassigned": self.leads_unassigned.load(Ordering::Relaxed),
                "score_updates": self.score_updates.load(Ordering::Relaxed),
            },
            "assignments": {
                "initial": self.assignments.load(Ordering::Relaxed),
                "reassigned": self.reassignments.load(Ordering::Relaxed),
            },
        })
    }
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

pub fn new_metrics() -> SharedMetrics {
    Arc::new(Metrics::new())
}

/// Feed lead events from the bus into `metrics` until the bus closes.
pub fn spawn_event_listener(metrics: SharedMetrics, bus: &EventBus) -> JoinHandle<()> {
    let rx = bus.subscribe();
    tokio::spawn(consume_events(metrics, rx))
}

async fn consume_events(metrics: SharedMetrics, mut rx: broadcast::Receiver<LeadEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => metrics.record_event(&event),
            Err(RecvError::Lagged(missed)) => {
                warn!("Metrics listener lagged, {} events not counted", missed)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_record_event_counts() {
        let metrics = Metrics::new();
        let lead_id = Uuid::new_v4();
        metrics.record_event(&LeadEvent::Captured { lead_id, score: 10 });
        metrics.record_event(&LeadEvent::Assigned {
            lead_id,
            agent_id: Uuid::new_v4(),
        });
        metrics.record_request(true);
        metrics.record_request(false);

        let json = metrics.to_json();
        assert_eq!(json["leads"]["captured"], 1);
        assert_eq!(json["assignments"]["initial"], 1);
        assert_eq!(json["assignments"]["reassigned"], 0);
        assert_eq!(json["requests"]["errors"], 1);
    }

    #[tokio::test]
    async fn test_listener_consumes_bus() {
        let metrics = new_metrics();
        let bus = EventBus::default();
        let handle = spawn_event_listener(metrics.clone(), &bus);

        bus.publish(LeadEvent::ScoreUpdated {
            lead_id: Uuid::new_v4(),
            previous: 10,
            score: 20,
        });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(metrics.score_updates.load(Ordering::Relaxed), 1);
    }
}
