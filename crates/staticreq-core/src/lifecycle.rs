//! Application lifecycle signals consumed by the request manager.
//!
//! The application publishes login, logout and foreground transitions on a
//! [`LifecycleBus`]; the manager subscribes when tasks are registered.

use tokio::sync::broadcast;
use tracing::debug;

/// Buffer size for the lifecycle event channel.
/// Transitions are rare; 16 leaves plenty of headroom for a slow listener.
const EVENT_BUFFER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A user session was established.
    Login,
    /// The user session ended.
    Logout,
    /// The application became active.
    Foreground,
}

/// Typed broadcast channel for [`LifecycleEvent`]s. Clone is cheap.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    /// Publishes an event. Returns the number of listeners it reached.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        match self.tx.send(event) {
            Ok(listeners) => listeners,
            Err(_) => {
                debug!(?event, "No lifecycle listeners");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = LifecycleBus::new();
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(LifecycleEvent::Login), 1);
        assert_eq!(bus.publish(LifecycleEvent::Foreground), 1);

        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Login);
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Foreground);
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = LifecycleBus::new();
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.publish(LifecycleEvent::Logout), 0);
    }
}
