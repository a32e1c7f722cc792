// Copyright 2026 Machine Price Monitor Contributors
// SPDX-License-Identifier: Apache-2.0

//! Event bus — typed lifecycle events from every component.
//!
//! The `EventBus` is a `tokio::sync::broadcast` channel that carries
//! [`ExtractionEvent`] values. Any consumer — the HTTP server's SSE
//! stream, a log sink, an operator dashboard — can subscribe
//! independently. When no subscribers exist, events are silently
//! dropped (zero overhead).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::Tier;

/// Every event this system emits. Serialized to JSON for SSE and log
/// sinks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExtractionEvent {
    /// A single-machine extraction started.
    ExtractionStarted {
        machine_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A tier was attempted and failed validation or produced no
    /// candidate, so the orchestrator is escalating to the next one.
    TierEscalated {
        machine_id: String,
        from_tier: Tier,
        to_tier: Tier,
        reason: String,
    },
    /// A tier produced a price that passed validation.
    TierSucceeded {
        machine_id: String,
        tier: Tier,
        price: Decimal,
        confidence: f32,
    },
    /// An extraction finished, successfully or not.
    ExtractionComplete {
        machine_id: String,
        success: bool,
        tier_used: Option<Tier>,
        price: Option<Decimal>,
        requires_approval: bool,
        elapsed_ms: u64,
    },
    /// A learned selector was written or overwritten for (machine, domain).
    LearnedSelectorSaved {
        machine_id: String,
        domain: String,
        selector: String,
        learned_via: Tier,
    },
    /// A batch run started.
    BatchStarted { batch_id: Uuid, machine_count: usize },
    /// Periodic batch progress, emitted as each machine finishes.
    BatchProgress {
        batch_id: Uuid,
        completed: usize,
        total: usize,
        succeeded: usize,
        failed: usize,
    },
    /// A batch run finished.
    BatchComplete {
        batch_id: Uuid,
        success_count: u32,
        failure_count: u32,
        llm_cost_usd: Decimal,
    },
    /// A price change needs human approval before it is committed.
    ApprovalRequired {
        machine_id: String,
        history_id: Uuid,
        previous_price: Option<Decimal>,
        new_price: Decimal,
        reason: String,
    },
    /// An operator resolved a pending approval.
    ApprovalResolved { history_id: Uuid, approved: bool },
}

/// The central event bus. All components emit through this; consumers
/// subscribe to receive a stream of all events.
pub struct EventBus {
    sender: broadcast::Sender<ExtractionEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: ExtractionEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ExtractionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_round_trips() {
        let event = ExtractionEvent::ExtractionStarted {
            machine_id: "m1".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("ExtractionStarted"));
        let parsed: ExtractionEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ExtractionEvent::ExtractionStarted { machine_id, .. } => {
                assert_eq!(machine_id, "m1")
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(ExtractionEvent::BatchStarted {
            batch_id: Uuid::nil(),
            machine_count: 3,
        });
    }

    #[test]
    fn subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(ExtractionEvent::ExtractionStarted {
            machine_id: "test".to_string(),
            timestamp: Utc::now(),
        });

        let event = rx.try_recv().unwrap();
        match event {
            ExtractionEvent::ExtractionStarted { machine_id, .. } => {
                assert_eq!(machine_id, "test")
            }
            _ => panic!("wrong event"),
        }
    }
}
