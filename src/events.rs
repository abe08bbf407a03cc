use tokio::sync::broadcast;

use crate::model::SyncResult;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The watcher recorded a local change for this path.
    ChangeDetected { path: String },
    Error { message: String },
    SyncFinished(SyncResult),
}

/// Typed fan-out of engine and watcher notifications.
#[derive(Clone, Debug)]
pub struct Events {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_typed_events() {
        let events = Events::new();
        let mut rx = events.subscribe();
        events.emit(SyncEvent::ChangeDetected {
            path: "main.tex".to_string(),
        });
        events.emit(SyncEvent::SyncFinished(SyncResult::ok()));
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::ChangeDetected {
                path: "main.tex".to_string()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncFinished(SyncResult::ok()));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        Events::new().emit(SyncEvent::Error {
            message: "offline".to_string(),
        });
    }
}
