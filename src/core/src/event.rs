//! Build progress events.
//!
//! The build engine publishes events on a broadcast channel so callers (the
//! CLI, tests, embedders) can follow a build without parsing logs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::BuildState;

/// What happened during a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEventKind {
    Started {
        steps: usize,
    },
    StepStarted {
        index: usize,
        step: String,
    },
    StepCompleted {
        index: usize,
        state: BuildState,
        digest: String,
        empty_layer: bool,
    },
    Completed {
        chain_id: String,
    },
    Failed {
        index: Option<usize>,
        state: BuildState,
        message: String,
    },
}

/// Build event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Build the event belongs to
    pub build_id: String,

    /// Event body
    #[serde(flatten)]
    pub kind: BuildEventKind,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BuildEvent {
    pub fn new(build_id: impl Into<String>, kind: BuildEventKind) -> Self {
        Self {
            build_id: build_id.into(),
            kind,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Event key (e.g., "build.step.completed")
    pub fn key(&self) -> &'static str {
        match self.kind {
            BuildEventKind::Started { .. } => events::BUILD_STARTED,
            BuildEventKind::StepStarted { .. } => events::STEP_STARTED,
            BuildEventKind::StepCompleted { .. } => events::STEP_COMPLETED,
            BuildEventKind::Completed { .. } => events::BUILD_COMPLETED,
            BuildEventKind::Failed { .. } => events::BUILD_FAILED,
        }
    }

    /// Whether no further events follow for this build.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            BuildEventKind::Completed { .. } | BuildEventKind::Failed { .. }
        )
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<BuildEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Events without subscribers are dropped.
    pub fn emit(&self, event: BuildEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const BUILD_STARTED: &str = "build.started";
    pub const STEP_STARTED: &str = "build.step.started";
    pub const STEP_COMPLETED: &str = "build.step.completed";
    pub const BUILD_COMPLETED: &str = "build.completed";
    pub const BUILD_FAILED: &str = "build.failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit(BuildEvent::new("b1", BuildEventKind::Started { steps: 3 }));
        emitter.emit(BuildEvent::new(
            "b1",
            BuildEventKind::Failed {
                index: Some(2),
                state: BuildState::Based,
                message: "boom".to_string(),
            },
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key(), events::BUILD_STARTED);
        assert!(!first.is_terminal());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.key(), events::BUILD_FAILED);
        assert!(second.is_terminal());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::default();
        emitter.emit(BuildEvent::new("b1", BuildEventKind::Completed {
            chain_id: "abc".to_string(),
        }));
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = BuildEvent::new(
            "b1",
            BuildEventKind::StepStarted {
                index: 1,
                step: "FROM base-os:20.04".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_started");
        assert_eq!(json["index"], 1);
        assert_eq!(json["build_id"], "b1");
    }
}
