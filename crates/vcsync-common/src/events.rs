//! Warnings recorded on tenant objects
//!
//! Tenants read these with `kubectl describe` in their virtual cluster. Each
//! tenant cluster gets its own recorder, reporting as the syncer with the
//! cluster name as instance. Publishing is best effort: a failure is logged
//! and never reaches the reconcile result.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::SYNCER_NAME;

/// Longest note the API server accepts on an Event
pub const MAX_NOTE_LEN: usize = 1024;

const ACTION_SYNC: &str = "Sync";

/// Event reasons
pub mod reasons {
    /// The tenant object requests something the syncer refuses to project
    pub const NOT_SUPPORTED: &str = "NotSupported";
}

/// Records sync warnings in one tenant cluster
pub struct TenantEventRecorder {
    recorder: Recorder,
    cluster: String,
}

impl TenantEventRecorder {
    /// Create a recorder on a tenant cluster's client
    pub fn new(client: Client, cluster: &str) -> Self {
        let reporter = Reporter {
            controller: SYNCER_NAME.to_string(),
            instance: Some(cluster.to_string()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            cluster: cluster.to_string(),
        }
    }

    /// Record a warning on a tenant object
    pub async fn warn(&self, object: &ObjectReference, reason: &str, note: &str) {
        if let Err(e) = self.recorder.publish(&sync_warning(reason, note), object).await {
            warn!(
                cluster = %self.cluster,
                name = object.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "Failed to record warning on tenant object"
            );
        }
    }
}

fn sync_warning(reason: &str, note: &str) -> Event {
    let mut end = note.len().min(MAX_NOTE_LEN);
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    Event {
        type_: EventType::Warning,
        reason: reason.to_string(),
        note: Some(note[..end].to_string()),
        action: ACTION_SYNC.to_string(),
        secondary: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_carries_reason_and_note() {
        let event = sync_warning(reasons::NOT_SUPPORTED, "nodeName is set");
        assert_eq!(event.type_, EventType::Warning);
        assert_eq!(event.reason, "NotSupported");
        assert_eq!(event.action, "Sync");
        assert_eq!(event.note.as_deref(), Some("nodeName is set"));
    }

    #[test]
    fn test_long_note_is_cut_on_a_char_boundary() {
        let note = "é".repeat(MAX_NOTE_LEN);
        let event = sync_warning(reasons::NOT_SUPPORTED, &note);
        let kept = event.note.expect("note");
        assert!(kept.len() <= MAX_NOTE_LEN);
        assert_eq!(kept.chars().count(), MAX_NOTE_LEN / 2);
    }
}
