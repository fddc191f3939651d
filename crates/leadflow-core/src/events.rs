//! Event bus: lead lifecycle notifications for monitoring.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent::AgentId;
use crate::lead::LeadId;

/// Something that happened to a lead.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LeadEvent {
    Captured { lead_id: LeadId, score: i32 },
    Assigned { lead_id: LeadId, agent_id: AgentId },
    Reassigned {
        lead_id: LeadId,
        agent_id: AgentId,
        reason: String,
    },
    ScoreUpdated {
        lead_id: LeadId,
        previous: i32,
        score: i32,
    },
    /// Capture found no eligible agent.
    Unassigned { lead_id: LeadId },
}

/// Broadcast bus. Publishing never blocks and is a no-op without subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LeadEvent>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    pub fn publish(&self, event: LeadEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        bus.publish(LeadEvent::Unassigned { lead_id: Uuid::nil() });

        let mut rx = bus.subscribe();
        let lead_id = Uuid::new_v4();
        bus.publish(LeadEvent::Captured { lead_id, score: 42 });

        assert_eq!(rx.recv().await.unwrap(), LeadEvent::Captured { lead_id, score: 42 });
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(LeadEvent::Assigned {
            lead_id: Uuid::nil(),
            agent_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["event"], "assigned");
    }
}
