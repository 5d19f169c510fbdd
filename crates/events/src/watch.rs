//! Awaiting a particular event on a bus subscription.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::bus::DomainEvent;

/// Wait for the first event on `rx` matching `predicate`.
///
/// Returns `None` on timeout or when the bus is dropped. Lagged receivers
/// skip the lost events and keep waiting.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<DomainEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<DomainEvent>
where
    F: FnMut(&DomainEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event watcher lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    #[tokio::test]
    async fn returns_first_matching_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::new("job.running").with_source("job", 1));
        bus.publish(DomainEvent::new("job.finished").with_source("job", 2));
        bus.publish(DomainEvent::new("job.finished").with_source("job", 1));

        let event = wait_for_event(&mut rx, Duration::from_secs(1), |e| {
            e.event_type == "job.finished" && e.is_about("job", 1)
        })
        .await
        .expect("event should arrive");
        assert_eq!(event.source_entity_id, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_match() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(DomainEvent::new("job.running"));

        let event = wait_for_event(&mut rx, Duration::from_millis(50), |e| {
            e.event_type == "job.finished"
        })
        .await;
        assert!(event.is_none());
    }
}
