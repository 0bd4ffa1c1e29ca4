use crate::collaborators::EventSink;
use crate::events::LifecycleEvent;
use tracing::info;

/// Writes lifecycle events to the `tracing` pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::MixStatusChanged { mix_id, from, to, .. } => {
                info!(event = event.name(), %mix_id, "{} -> {}", from, to);
            }
            LifecycleEvent::MixFailed { mix_id, reason, .. } => {
                info!(event = event.name(), %mix_id, "failed: {}", reason);
            }
            _ => info!(event = event.name(), mix_id = %event.mix_id(), "lifecycle event"),
        }
    }
}
