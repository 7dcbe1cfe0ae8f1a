//! Client-side mirror of backend pipelines.

use crate::element::ElementDescriptor;
use crate::state::PipelineState;
use crate::stats::PipelineStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a backend pipeline.
pub type PipelineId = String;

/// Generate a fresh pipeline identifier.
pub fn new_pipeline_id() -> PipelineId {
    format!("pipeline-{}", Uuid::new_v4())
}

/// A value with an authoritative part and an optional local guess.
///
/// The guess is what callers observe until the authoritative value is
/// confirmed, at which point the guess is discarded regardless of whether it
/// matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciled<T> {
    confirmed: T,
    pending: Option<T>,
}

impl<T: Copy + PartialEq> Reconciled<T> {
    pub fn new(confirmed: T) -> Self {
        Self {
            confirmed,
            pending: None,
        }
    }

    /// The observable value.
    pub fn current(&self) -> T {
        self.pending.unwrap_or(self.confirmed)
    }

    pub fn confirmed(&self) -> T {
        self.confirmed
    }

    pub fn pending(&self) -> Option<T> {
        self.pending
    }

    /// Record a local guess.
    pub fn propose(&mut self, value: T) {
        self.pending = Some(value);
    }

    /// Record the authoritative value. Returns true when the observable value changed.
    pub fn confirm(&mut self, value: T) -> bool {
        let before = self.current();
        self.confirmed = value;
        self.pending = None;
        before != value
    }
}

/// A backend pipeline as mirrored by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: PipelineId,
    /// Human-readable description
    pub description: String,
    /// Ordered processing elements
    pub elements: Vec<ElementDescriptor>,
    state: Reconciled<PipelineState>,
    /// Last observed statistics
    pub stats: PipelineStats,
    /// When the observable state last changed
    pub last_state_change: DateTime<Utc>,
    /// Translated error message, if the pipeline failed
    pub error_message: Option<String>,
}

impl Pipeline {
    /// Create the local record for a pipeline that has not been acknowledged yet.
    pub fn new(
        id: impl Into<PipelineId>,
        description: impl Into<String>,
        elements: Vec<ElementDescriptor>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            elements,
            state: Reconciled::new(PipelineState::Null),
            stats: PipelineStats::default(),
            last_state_change: Utc::now(),
            error_message: None,
        }
    }

    /// Build a record straight from an authoritative snapshot.
    pub fn from_snapshot(snapshot: PipelineSnapshot) -> Self {
        let description = snapshot
            .description
            .unwrap_or_else(|| format!("Pipeline {}", snapshot.id));
        Self {
            id: snapshot.id,
            description,
            elements: snapshot.elements,
            state: Reconciled::new(snapshot.state),
            stats: snapshot.stats,
            last_state_change: Utc::now(),
            error_message: snapshot.error_message,
        }
    }

    /// Observable state (optimistic guess if one is outstanding).
    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    /// Last state confirmed by the backend.
    pub fn confirmed_state(&self) -> PipelineState {
        self.state.confirmed()
    }

    /// Whether an optimistic guess is waiting for confirmation.
    pub fn has_pending_state(&self) -> bool {
        self.state.pending().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Apply a local guess ahead of backend confirmation.
    pub fn set_optimistic_state(&mut self, state: PipelineState) {
        if self.state() != state {
            self.last_state_change = Utc::now();
        }
        self.state.propose(state);
    }

    /// Apply the authoritative state. Returns true when the observable state changed.
    pub fn confirm_state(&mut self, state: PipelineState) -> bool {
        let changed = self.state.confirm(state);
        if changed {
            self.last_state_change = Utc::now();
        }
        if state != PipelineState::Error {
            self.error_message = None;
        }
        changed
    }

    /// Mark the pipeline failed with a (translated) message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.confirm_state(PipelineState::Error);
        self.error_message = Some(message.into());
    }

    /// Merge an authoritative snapshot into the existing record.
    ///
    /// Fields the backend omitted keep their local values.
    pub fn merge_snapshot(&mut self, snapshot: PipelineSnapshot) {
        if let Some(description) = snapshot.description {
            self.description = description;
        }
        if !snapshot.elements.is_empty() {
            self.elements = snapshot.elements;
        }
        if !snapshot.stats.is_empty() {
            self.stats = snapshot.stats;
        }
        self.confirm_state(snapshot.state);
        if snapshot.error_message.is_some() {
            self.error_message = snapshot.error_message;
        }
    }
}

/// Pipeline as described by the backend in `pipelineCreated` and `pipelinesList`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub id: PipelineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub state: PipelineState,
    #[serde(default)]
    pub elements: Vec<ElementDescriptor>,
    #[serde(default)]
    pub stats: PipelineStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PipelineSnapshot {
    /// Snapshot with only an id and a state, as the status view reports.
    pub fn new(id: impl Into<PipelineId>, state: PipelineState) -> Self {
        Self {
            id: id.into(),
            description: None,
            state,
            elements: Vec::new(),
            stats: PipelineStats::default(),
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_overrides_guess() {
        let mut state = Reconciled::new(PipelineState::Null);
        state.propose(PipelineState::Connecting);
        assert_eq!(state.current(), PipelineState::Connecting);
        assert_eq!(state.confirmed(), PipelineState::Null);

        assert!(state.confirm(PipelineState::Receiving));
        assert_eq!(state.current(), PipelineState::Receiving);
        assert_eq!(state.pending(), None);
    }

    #[test]
    fn test_confirming_the_guess_is_not_a_change() {
        let mut state = Reconciled::new(PipelineState::Null);
        state.propose(PipelineState::Paused);
        assert!(!state.confirm(PipelineState::Paused));
    }

    #[test]
    fn test_merge_keeps_local_fields_the_backend_omitted() {
        let elements = vec![ElementDescriptor::new("videotestsrc")];
        let mut pipeline = Pipeline::new("p1", "test", elements.clone());
        pipeline.set_optimistic_state(PipelineState::Connecting);

        pipeline.merge_snapshot(PipelineSnapshot::new("p1", PipelineState::Playing));

        assert_eq!(pipeline.state(), PipelineState::Playing);
        assert!(!pipeline.has_pending_state());
        assert_eq!(pipeline.elements, elements);
        assert_eq!(pipeline.description, "test");
    }

    #[test]
    fn test_fail_sets_error_state_and_message() {
        let mut pipeline = Pipeline::new("p1", "test", Vec::new());
        pipeline.fail("boom");
        assert_eq!(pipeline.state(), PipelineState::Error);
        assert_eq!(pipeline.error_message.as_deref(), Some("boom"));

        pipeline.confirm_state(PipelineState::Playing);
        assert_eq!(pipeline.error_message, None);
    }

    #[test]
    fn test_status_view_snapshot_decodes() {
        let json = r#"{"id":"pipeline-1","state":"PLAYING","stats":{}}"#;
        let snapshot: PipelineSnapshot = serde_json::from_str(json).unwrap();
        let pipeline = Pipeline::from_snapshot(snapshot);
        assert_eq!(pipeline.description, "Pipeline pipeline-1");
        assert!(pipeline.is_connected());
    }
}
