// Typed event channels
//
// Lifecycle events go out on a broadcast channel to any number of
// subscribers and are mirrored to the external event sink. Pool and
// scheduler events are internal and flow to the orchestrator over
// unbounded mpsc channels drained on every tick.

use crate::collaborators::EventSink;
use crate::model::{Amount, Currency, EntryId, MixId, MixStatus, ScheduledOperation, TransactionId};
use crate::pool::optimizer::OptimizationPlan;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Observable change in a mix's lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    MixStarted {
        mix_id: MixId,
        currency: Currency,
        amount: Amount,
        deposit_address: String,
        at: u64,
    },
    MixStatusChanged {
        mix_id: MixId,
        from: MixStatus,
        to: MixStatus,
        at: u64,
    },
    MixCompleted {
        mix_id: MixId,
        at: u64,
    },
    MixFailed {
        mix_id: MixId,
        reason: String,
        at: u64,
    },
    MixCancelled {
        mix_id: MixId,
        at: u64,
    },
    MixExpired {
        mix_id: MixId,
        at: u64,
    },
}

impl LifecycleEvent {
    pub fn mix_id(&self) -> MixId {
        match self {
            LifecycleEvent::MixStarted { mix_id, .. }
            | LifecycleEvent::MixStatusChanged { mix_id, .. }
            | LifecycleEvent::MixCompleted { mix_id, .. }
            | LifecycleEvent::MixFailed { mix_id, .. }
            | LifecycleEvent::MixCancelled { mix_id, .. }
            | LifecycleEvent::MixExpired { mix_id, .. } => *mix_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::MixStarted { .. } => "mix_started",
            LifecycleEvent::MixStatusChanged { .. } => "mix_status_changed",
            LifecycleEvent::MixCompleted { .. } => "mix_completed",
            LifecycleEvent::MixFailed { .. } => "mix_failed",
            LifecycleEvent::MixCancelled { .. } => "mix_cancelled",
            LifecycleEvent::MixExpired { .. } => "mix_expired",
        }
    }
}

/// Fan-out of lifecycle events to subscribers and the external sink
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    sink: Arc<dyn EventSink>,
}

impl EventBus {
    pub fn new(capacity: usize, sink: Arc<dyn EventSink>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, sink }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Deliver to subscribers, then to the sink. Having no subscriber is fine.
    pub fn emit(&self, event: LifecycleEvent) {
        self.sink.publish(&event);
        let _ = self.sender.send(event);
    }
}

/// Pool manager notifications for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A mixing round completed over these participants
    RoundCompleted {
        currency: Currency,
        transaction_id: TransactionId,
        participants: Vec<MixId>,
        /// Participants that finished every required round
        finished: Vec<(MixId, EntryId)>,
    },
    /// Not enough compatible candidates, retried on the next sweep
    RoundDeferred { currency: Currency, candidates: usize },
    /// A periodic optimization produced an actionable plan
    Rebalance(OptimizationPlan),
}

/// Scheduler notifications for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Completed(ScheduledOperation),
    Failed(ScheduledOperation),
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<&'static str>>,
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: &LifecycleEvent) {
            self.seen.lock().push(event.name());
        }
    }

    #[tokio::test]
    async fn test_bus_reaches_subscriber_and_sink() {
        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::new(16, sink.clone());
        let mut rx = bus.subscribe();
        let mix_id = MixId::new();

        bus.emit(LifecycleEvent::MixCancelled { mix_id, at: 5 });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.mix_id(), mix_id);
        assert_eq!(sink.seen.lock().as_slice(), &["mix_cancelled"]);
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::new(4, Arc::new(RecordingSink::default()));
        bus.emit(LifecycleEvent::MixExpired {
            mix_id: MixId::new(),
            at: 0,
        });
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = LifecycleEvent::MixStatusChanged {
            mix_id: MixId::new(),
            from: MixStatus::Mixing,
            to: MixStatus::Distributing,
            at: 9,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"mix_status_changed\""));
        assert!(json.contains("\"to\":\"DISTRIBUTING\""));
    }
}
