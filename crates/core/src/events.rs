use crate::types::{ProjectId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An observable lifecycle transition of a job or one of its steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub kind: EngineEventKind,
}

/// Kinds of events emitted during a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventKind {
    // Job lifecycle
    JobStarted,
    JobCompleted {
        duration_secs: i64,
    },
    JobFailed {
        error: String,
        will_retry: bool,
    },

    // Step lifecycle
    StepStarted {
        step: String,
    },
    StepCompleted {
        step: String,
    },
    StepFailed {
        step: String,
        error: String,
    },
}

/// Fan-out channel for engine events.
///
/// Hosts subscribe for observability; the engine never depends on a receiver
/// being present, and a lagging subscriber only loses its own backlog.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; dropped when nobody is subscribed.
    pub fn emit(&self, workflow_id: WorkflowId, project_id: ProjectId, kind: EngineEventKind) {
        let _ = self.tx.send(EngineEvent {
            timestamp: Utc::now(),
            workflow_id,
            project_id,
            kind,
        });
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

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let workflow_id = WorkflowId::new();
        bus.emit(
            workflow_id,
            ProjectId::new("proj"),
            EngineEventKind::JobStarted,
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.workflow_id, workflow_id);
        assert!(matches!(event.kind, EngineEventKind::JobStarted));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        // No receiver; must not panic or block
        bus.emit(
            WorkflowId::new(),
            ProjectId::new("proj"),
            EngineEventKind::StepStarted {
                step: "chunker".to_string(),
            },
        );
    }
}
