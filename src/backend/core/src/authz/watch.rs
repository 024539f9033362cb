//! Membership change notifications.
//!
//! Every time the set of subjects that can see a workspace changes, the index
//! publishes a [`MembershipChange`] to all subscribers. Subscribers that fall
//! behind lose the oldest notifications and can recover by re-reading the
//! index.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::trace;

use crate::rbac::Subject;

/// What caused a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    WorkspaceEvent,
    BindingEvent,
    Resync,
}

/// Subjects that gained or lost access to one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub workspace: String,
    pub added: BTreeSet<Subject>,
    pub removed: BTreeSet<Subject>,
    pub cause: ChangeCause,
    /// Index generation that first contains this change.
    pub generation: u64,
    pub observed_at: DateTime<Utc>,
}

impl MembershipChange {
    pub fn new(
        workspace: impl Into<String>,
        added: BTreeSet<Subject>,
        removed: BTreeSet<Subject>,
        cause: ChangeCause,
        generation: u64,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            added,
            removed,
            cause,
            generation,
            observed_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Fan-out of membership changes.
#[derive(Debug, Clone)]
pub struct MembershipNotifier {
    sender: broadcast::Sender<MembershipChange>,
}

impl MembershipNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish a change. Empty changes and changes nobody listens to are
    /// dropped.
    pub fn publish(&self, change: MembershipChange) {
        if change.is_empty() || self.sender.receiver_count() == 0 {
            return;
        }
        trace!(
            workspace = %change.workspace,
            added = change.added.len(),
            removed = change.removed.len(),
            cause = ?change.cause,
            "Publishing membership change"
        );
        counter!("wsauth_membership_changes_total").increment(1);
        let _ = self.sender.send(change);
    }
}

impl Default for MembershipNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = MembershipNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.publish(MembershipChange::new(
            "ws-1",
            BTreeSet::from([Subject::user("alice")]),
            BTreeSet::new(),
            ChangeCause::BindingEvent,
            3,
        ));

        let change = rx.recv().await.unwrap();
        assert_eq!(change.workspace, "ws-1");
        assert_eq!(change.generation, 3);
        assert!(change.added.contains(&Subject::user("alice")));
    }

    #[tokio::test]
    async fn test_empty_changes_are_dropped() {
        let notifier = MembershipNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.publish(MembershipChange::new(
            "ws-1",
            BTreeSet::new(),
            BTreeSet::new(),
            ChangeCause::Resync,
            1,
        ));

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
