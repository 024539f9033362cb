//! Subject → workspace authorization index.
//!
//! The index keeps two structures:
//! - **Writer state** (behind a mutex): workspaces with their authorized
//!   subjects, the current role bindings and per-key resource versions. All
//!   policy evaluation happens here.
//! - **Published view** (behind an `RwLock`): subject entries and workspace
//!   projections read by `list`. Its write section only applies a
//!   precomputed delta or swaps in a freshly built view.
//!
//! Incremental updates and full rebuilds both take the writer mutex, so they
//! never interleave. Readers only ever see complete generations.

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::watch::{ChangeCause, MembershipChange, MembershipNotifier};
use crate::error::{AuthzError, ErrorCode, ErrorDetails, Result};
use crate::feed::{ChangeEvent, Listed, Resource, ResourceVersion, WatchEvent};
use crate::rbac::{
    AccessRequest, BindingSet, EvaluationError, GrantScope, PolicyEvaluator, RoleBinding, Subject,
};
use crate::tenancy::WorkspaceRecord;

// ═══════════════════════════════════════════════════════════════════════════════
// Public Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Workspaces one subject can see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectEntry {
    /// Workspace name → workspace resource version the grant was computed from.
    pub workspaces: BTreeMap<String, ResourceVersion>,
    /// Highest role-binding resource version processed when this entry was
    /// last computed.
    pub bindings_version: ResourceVersion,
}

impl SubjectEntry {
    pub fn names(&self) -> BTreeSet<String> {
        self.workspaces.keys().cloned().collect()
    }

    pub fn contains(&self, workspace: &str) -> bool {
        self.workspaces.contains_key(workspace)
    }
}

/// Result of feeding one event to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The event was committed; `changed` workspaces changed membership.
    Applied { changed: usize },
    /// Same resource version as the last one seen for the key.
    Duplicate,
    /// Older than what the index already reflects.
    Stale,
    /// Evaluation failed; nothing was committed.
    Inconclusive { reason: String },
}

impl UpdateOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
            Self::Inconclusive { .. } => "inconclusive",
        }
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Self::Inconclusive { .. })
    }
}

/// A consistent pair of lists to rebuild from.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub workspaces: Listed<WorkspaceRecord>,
    pub bindings: Listed<RoleBinding>,
}

impl Snapshot {
    pub fn new(workspaces: Listed<WorkspaceRecord>, bindings: Listed<RoleBinding>) -> Self {
        Self {
            workspaces,
            bindings,
        }
    }
}

/// What a full rebuild did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub generation: u64,
    pub workspaces: usize,
    pub bindings: usize,
    pub subjects: usize,
    /// Workspaces whose membership differs from the previous generation.
    pub changed: usize,
    /// Workspaces whose review failed and kept their previous subjects.
    pub inconclusive: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Internal State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct WorkspaceSlot {
    record: Arc<WorkspaceRecord>,
    subjects: BTreeSet<Subject>,
}

/// Per-key resource versions for one kind, including deletions.
#[derive(Debug, Default)]
struct VersionTracker {
    seen: HashMap<String, ResourceVersion>,
    /// Version of the last snapshot; unknown keys at or below it are stale.
    floor: ResourceVersion,
    high_water: ResourceVersion,
}

impl VersionTracker {
    fn from_listed<T: Resource>(listed: &Listed<T>) -> Self {
        let seen: HashMap<String, ResourceVersion> = listed
            .items
            .iter()
            .map(|item| (item.key().to_string(), item.resource_version()))
            .collect();
        let high_water = seen
            .values()
            .copied()
            .max()
            .unwrap_or_default()
            .max(listed.resource_version);
        Self {
            seen,
            floor: listed.resource_version,
            high_water,
        }
    }

    /// `None` means apply. Unversioned events cannot be ordered and are
    /// always applied.
    fn classify(&self, key: &str, version: ResourceVersion) -> Option<UpdateOutcome> {
        if version == ResourceVersion::ZERO {
            return None;
        }
        match self.seen.get(key) {
            Some(last) if version == *last => Some(UpdateOutcome::Duplicate),
            Some(last) if version < *last => Some(UpdateOutcome::Stale),
            Some(_) => None,
            None if self.floor > ResourceVersion::ZERO && version <= self.floor => {
                Some(UpdateOutcome::Stale)
            }
            None => None,
        }
    }

    fn record(&mut self, key: &str, version: ResourceVersion) {
        self.seen.insert(key.to_string(), version);
        self.high_water = self.high_water.max(version);
    }
}

#[derive(Debug, Default)]
struct WriterState {
    workspaces: BTreeMap<String, WorkspaceSlot>,
    bindings: BindingSet,
    workspace_versions: VersionTracker,
    binding_versions: VersionTracker,
    bindings_version: ResourceVersion,
}

#[derive(Debug, Clone)]
struct WorkspaceView {
    record: Arc<WorkspaceRecord>,
    subjects: Arc<BTreeSet<Subject>>,
}

#[derive(Debug, Default)]
struct IndexView {
    generation: u64,
    subjects: HashMap<Subject, Arc<SubjectEntry>>,
    workspaces: HashMap<String, WorkspaceView>,
    bindings: usize,
}

/// Membership change of one workspace, computed under the writer lock.
#[derive(Debug)]
struct WorkspaceDelta {
    name: String,
    /// `None` when the workspace was deleted.
    record: Option<Arc<WorkspaceRecord>>,
    subjects: BTreeSet<Subject>,
    added: BTreeSet<Subject>,
    removed: BTreeSet<Subject>,
    /// Re-tag every remaining subject with the record's version.
    retag: bool,
}

impl WorkspaceDelta {
    fn new(
        name: String,
        record: Option<Arc<WorkspaceRecord>>,
        old: &BTreeSet<Subject>,
        new: BTreeSet<Subject>,
        retag: bool,
    ) -> Self {
        let added = new.difference(old).cloned().collect();
        let removed = old.difference(&new).cloned().collect();
        Self {
            name,
            record,
            subjects: new,
            added,
            removed,
            retag,
        }
    }

    fn membership_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authorization Index
// ═══════════════════════════════════════════════════════════════════════════════

/// Incrementally maintained map from subject to visible workspaces.
pub struct AuthorizationIndex {
    evaluator: Arc<dyn PolicyEvaluator>,
    request: AccessRequest,
    writer: Mutex<WriterState>,
    view: RwLock<IndexView>,
    notifier: MembershipNotifier,
}

impl AuthorizationIndex {
    /// Create an empty index answering `request` (narrowed per workspace).
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>, request: AccessRequest) -> Self {
        Self {
            evaluator,
            request,
            writer: Mutex::new(WriterState::default()),
            view: RwLock::new(IndexView::default()),
            notifier: MembershipNotifier::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: MembershipNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn request(&self) -> &AccessRequest {
        &self.request
    }

    pub fn notifier(&self) -> &MembershipNotifier {
        &self.notifier
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Names of the workspaces `subject` can see.
    pub fn list(&self, subject: &Subject) -> BTreeSet<String> {
        self.view
            .read()
            .subjects
            .get(subject)
            .map(|entry| entry.names())
            .unwrap_or_default()
    }

    pub fn entry(&self, subject: &Subject) -> Option<Arc<SubjectEntry>> {
        self.view.read().subjects.get(subject).cloned()
    }

    /// Union of the workspaces visible to any of `subjects`, ordered by name,
    /// read from a single generation.
    pub fn list_for<'a, I>(&self, subjects: I) -> (u64, Vec<Arc<WorkspaceRecord>>)
    where
        I: IntoIterator<Item = &'a Subject>,
    {
        let view = self.view.read();
        let names: BTreeSet<&String> = subjects
            .into_iter()
            .filter_map(|s| view.subjects.get(s))
            .flat_map(|entry| entry.workspaces.keys())
            .collect();
        let records = names
            .into_iter()
            .filter_map(|name| view.workspaces.get(name).map(|ws| ws.record.clone()))
            .collect();
        (view.generation, records)
    }

    /// Whether any of `subjects` can see `workspace`.
    pub fn allows<'a, I>(&self, subjects: I, workspace: &str) -> bool
    where
        I: IntoIterator<Item = &'a Subject>,
    {
        let view = self.view.read();
        subjects.into_iter().any(|s| {
            view.subjects
                .get(s)
                .is_some_and(|entry| entry.contains(workspace))
        })
    }

    /// Subjects that can see `workspace`.
    pub fn subjects_with_access(&self, workspace: &str) -> BTreeSet<Subject> {
        self.view
            .read()
            .workspaces
            .get(workspace)
            .map(|ws| ws.subjects.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn workspace(&self, name: &str) -> Option<Arc<WorkspaceRecord>> {
        self.view
            .read()
            .workspaces
            .get(name)
            .map(|ws| ws.record.clone())
    }

    /// Every known workspace, ordered by name.
    pub fn workspaces(&self) -> Vec<Arc<WorkspaceRecord>> {
        let view = self.view.read();
        let mut records: Vec<_> = view.workspaces.values().map(|ws| ws.record.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Incremented on every publication.
    pub fn generation(&self) -> u64 {
        self.view.read().generation
    }

    pub fn subject_count(&self) -> usize {
        self.view.read().subjects.len()
    }

    pub fn workspace_count(&self) -> usize {
        self.view.read().workspaces.len()
    }

    pub fn binding_count(&self) -> usize {
        self.view.read().bindings
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incremental updates
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one change event.
    pub fn update(&self, event: ChangeEvent) -> UpdateOutcome {
        let kind = event.kind();
        let event_type = event.event_type();
        let key = event.key().to_string();
        let version = event.resource_version();

        let outcome = {
            let mut state = self.writer.lock();
            match event {
                ChangeEvent::Workspace(event) => self.apply_workspace(&mut state, event),
                ChangeEvent::RoleBinding(event) => self.apply_binding(&mut state, event),
            }
        };

        counter!(
            "wsauth_index_events_total",
            "kind" => kind,
            "outcome" => outcome.label(),
        )
        .increment(1);

        match &outcome {
            UpdateOutcome::Inconclusive { reason } => {
                counter!("wsauth_evaluation_failures_total").increment(1);
                warn!(
                    kind,
                    event_type,
                    key = %key,
                    resource_version = %version,
                    reason = %reason,
                    "Event evaluation inconclusive, nothing committed"
                );
            }
            other => {
                debug!(
                    kind,
                    event_type,
                    key = %key,
                    resource_version = %version,
                    outcome = other.label(),
                    "Processed event"
                );
            }
        }

        outcome
    }

    fn apply_workspace(
        &self,
        state: &mut WriterState,
        event: WatchEvent<WorkspaceRecord>,
    ) -> UpdateOutcome {
        let version = event.resource_version();
        if let Some(outcome) = state.workspace_versions.classify(event.key(), version) {
            return outcome;
        }

        let delta = match event {
            WatchEvent::Deleted(record) => {
                state.workspace_versions.record(&record.name, version);
                match state.workspaces.remove(&record.name) {
                    Some(slot) => {
                        WorkspaceDelta::new(record.name, None, &slot.subjects, BTreeSet::new(), false)
                    }
                    None => return UpdateOutcome::Applied { changed: 0 },
                }
            }
            WatchEvent::Added(record) | WatchEvent::Modified(record) => {
                let request = self.request.for_name(&record.name);
                let review = match self.evaluator.review(&request, &state.bindings) {
                    Ok(review) => review,
                    Err(err) => return inconclusive(err),
                };

                state.workspace_versions.record(&record.name, version);
                let record = Arc::new(record);
                let previous = state.workspaces.insert(
                    record.name.clone(),
                    WorkspaceSlot {
                        record: record.clone(),
                        subjects: review.subjects.clone(),
                    },
                );
                let old = previous.map(|slot| slot.subjects).unwrap_or_default();
                WorkspaceDelta::new(record.name.clone(), Some(record), &old, review.subjects, true)
            }
        };

        let cause = ChangeCause::WorkspaceEvent;
        let changed = usize::from(delta.membership_changed());
        self.publish(state, vec![delta], &BTreeSet::new(), cause);
        UpdateOutcome::Applied { changed }
    }

    fn apply_binding(&self, state: &mut WriterState, event: WatchEvent<RoleBinding>) -> UpdateOutcome {
        let version = event.resource_version();
        let key = event.key().to_string();
        if let Some(outcome) = state.binding_versions.classify(&key, version) {
            return outcome;
        }

        let old_grant = match state.bindings.get(&key) {
            Some(old) => match self.evaluator.binding_grant(&self.request, old) {
                Ok(grant) => grant,
                Err(err) => return inconclusive(err),
            },
            None => None,
        };
        let new_grant = match &event {
            WatchEvent::Deleted(_) => None,
            WatchEvent::Added(binding) | WatchEvent::Modified(binding) => {
                match self.evaluator.binding_grant(&self.request, binding) {
                    Ok(grant) => grant,
                    Err(err) => return inconclusive(err),
                }
            }
        };

        let affected = affected_workspaces(
            &state.workspaces,
            [old_grant.as_ref(), new_grant.as_ref()]
                .into_iter()
                .flatten()
                .map(|grant| &grant.scope),
        );
        let tagged: BTreeSet<Subject> = [old_grant, new_grant]
            .into_iter()
            .flatten()
            .flat_map(|grant| grant.subjects)
            .collect();

        // Stage the binding change, then re-derive; roll back if evaluation fails.
        let previous = match event {
            WatchEvent::Deleted(_) => state.bindings.remove(&key),
            WatchEvent::Added(binding) | WatchEvent::Modified(binding) => {
                state.bindings.insert(key.clone(), Arc::new(binding))
            }
        };

        let reviews = self.review_all(&state.bindings, &affected);
        let reviews = match reviews {
            Ok(reviews) => reviews,
            Err(err) => {
                match previous {
                    Some(binding) => state.bindings.insert(key, binding),
                    None => state.bindings.remove(&key),
                };
                return inconclusive(err);
            }
        };

        state.binding_versions.record(&key, version);
        state.bindings_version = state.bindings_version.max(version);

        let mut deltas = Vec::new();
        for (name, subjects) in reviews {
            if let Some(slot) = state.workspaces.get_mut(&name) {
                if slot.subjects != subjects {
                    let delta = WorkspaceDelta::new(
                        name,
                        Some(slot.record.clone()),
                        &slot.subjects,
                        subjects.clone(),
                        false,
                    );
                    slot.subjects = subjects;
                    deltas.push(delta);
                }
            }
        }

        let changed = deltas.len();
        self.publish(state, deltas, &tagged, ChangeCause::BindingEvent);
        UpdateOutcome::Applied { changed }
    }

    fn review_all(
        &self,
        bindings: &BindingSet,
        workspaces: &BTreeSet<String>,
    ) -> std::result::Result<Vec<(String, BTreeSet<Subject>)>, EvaluationError> {
        workspaces
            .iter()
            .map(|name| {
                let review = self.evaluator.review(&self.request.for_name(name), bindings)?;
                Ok((name.clone(), review.subjects))
            })
            .collect()
    }

    /// Apply deltas to the published view and notify subscribers.
    fn publish(
        &self,
        state: &WriterState,
        deltas: Vec<WorkspaceDelta>,
        tagged: &BTreeSet<Subject>,
        cause: ChangeCause,
    ) {
        if deltas.is_empty() && tagged.is_empty() {
            self.view.write().bindings = state.bindings.len();
            return;
        }

        let bindings_version = state.bindings_version;
        let (generation, subject_count) = {
            let mut guard = self.view.write();
            let view = &mut *guard;
            view.generation += 1;
            view.bindings = state.bindings.len();

            for delta in &deltas {
                match &delta.record {
                    Some(record) => {
                        view.workspaces.insert(
                            delta.name.clone(),
                            WorkspaceView {
                                record: record.clone(),
                                subjects: Arc::new(delta.subjects.clone()),
                            },
                        );
                        let touched = delta
                            .subjects
                            .iter()
                            .filter(|s| delta.retag || delta.added.contains(*s));
                        for subject in touched {
                            let entry = view.subjects.entry(subject.clone()).or_default();
                            let entry = Arc::make_mut(entry);
                            entry
                                .workspaces
                                .insert(delta.name.clone(), record.resource_version);
                            entry.bindings_version = bindings_version;
                        }
                    }
                    None => {
                        view.workspaces.remove(&delta.name);
                    }
                }
                for subject in &delta.removed {
                    revoke(&mut view.subjects, subject, &delta.name, bindings_version);
                }
            }

            for subject in tagged {
                if let Some(entry) = view.subjects.get_mut(subject) {
                    Arc::make_mut(entry).bindings_version = bindings_version;
                }
            }

            (view.generation, view.subjects.len())
        };

        gauge!("wsauth_index_subjects").set(subject_count as f64);

        for delta in deltas {
            if delta.membership_changed() {
                self.notifier.publish(MembershipChange::new(
                    delta.name,
                    delta.added,
                    delta.removed,
                    cause,
                    generation,
                ));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Full rebuild
    // ─────────────────────────────────────────────────────────────────────────

    /// Rebuild the index from a consistent snapshot and publish it atomically.
    ///
    /// Snapshots older than events the index already applied are rejected.
    pub fn full_rebuild(&self, snapshot: Snapshot) -> Result<RebuildSummary> {
        let mut state = self.writer.lock();

        check_not_stale::<WorkspaceRecord>(&state.workspace_versions, &snapshot.workspaces)?;
        check_not_stale::<RoleBinding>(&state.binding_versions, &snapshot.bindings)?;

        let workspace_versions = VersionTracker::from_listed(&snapshot.workspaces);
        let binding_versions = VersionTracker::from_listed(&snapshot.bindings);
        let bindings_version = snapshot.bindings.resource_version;

        let bindings: BindingSet = snapshot
            .bindings
            .items
            .into_iter()
            .map(|b| (b.name.clone(), Arc::new(b)))
            .collect();

        let mut summary = RebuildSummary {
            bindings: bindings.len(),
            ..RebuildSummary::default()
        };

        let mut workspaces = BTreeMap::new();
        for record in snapshot.workspaces.items {
            let request = self.request.for_name(&record.name);
            let subjects = match self.evaluator.review(&request, &bindings) {
                Ok(review) => review.subjects,
                Err(err) => {
                    warn!(
                        workspace = %record.name,
                        error = %err,
                        "Review failed during rebuild, keeping previous subjects"
                    );
                    counter!("wsauth_evaluation_failures_total").increment(1);
                    summary.inconclusive.push(record.name.clone());
                    state
                        .workspaces
                        .get(&record.name)
                        .map(|slot| slot.subjects.clone())
                        .unwrap_or_default()
                }
            };
            workspaces.insert(
                record.name.clone(),
                WorkspaceSlot {
                    record: Arc::new(record),
                    subjects,
                },
            );
        }

        let deltas = membership_diff(&state.workspaces, &workspaces);
        summary.changed = deltas.len();
        summary.workspaces = workspaces.len();

        *state = WriterState {
            workspaces,
            bindings,
            workspace_versions,
            binding_versions,
            bindings_version,
        };

        // The writer mutex excludes every other view writer, so the view is
        // built unlocked and the write section is a plain swap.
        let fresh = build_view(&state, self.view.read().generation + 1);
        let (generation, subject_count) = (fresh.generation, fresh.subjects.len());
        let previous = std::mem::replace(&mut *self.view.write(), fresh);
        drop(previous);
        summary.generation = generation;
        summary.subjects = subject_count;

        gauge!("wsauth_index_subjects").set(subject_count as f64);

        for (name, added, removed) in deltas {
            self.notifier.publish(MembershipChange::new(
                name,
                added,
                removed,
                ChangeCause::Resync,
                generation,
            ));
        }

        info!(
            generation,
            workspaces = summary.workspaces,
            bindings = summary.bindings,
            subjects = summary.subjects,
            changed = summary.changed,
            inconclusive = summary.inconclusive.len(),
            "Authorization index rebuilt"
        );

        Ok(summary)
    }
}

impl std::fmt::Debug for AuthorizationIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view.read();
        f.debug_struct("AuthorizationIndex")
            .field("request", &self.request)
            .field("generation", &view.generation)
            .field("subjects", &view.subjects.len())
            .field("workspaces", &view.workspaces.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn inconclusive(err: EvaluationError) -> UpdateOutcome {
    UpdateOutcome::Inconclusive {
        reason: err.to_string(),
    }
}

fn check_not_stale<T: Resource>(tracker: &VersionTracker, listed: &Listed<T>) -> Result<()> {
    if listed.resource_version > ResourceVersion::ZERO
        && listed.resource_version < tracker.high_water
    {
        return Err(AuthzError::new(
            ErrorCode::StaleSnapshot,
            format!(
                "{} snapshot at version {} is older than observed version {}",
                T::KIND,
                listed.resource_version,
                tracker.high_water
            ),
        )
        .with_details(ErrorDetails::new().with_context("kind", T::KIND)));
    }
    Ok(())
}

/// Known workspaces inside any of the scopes.
fn affected_workspaces<'a>(
    workspaces: &BTreeMap<String, WorkspaceSlot>,
    scopes: impl Iterator<Item = &'a GrantScope>,
) -> BTreeSet<String> {
    let mut affected = BTreeSet::new();
    for scope in scopes {
        match scope {
            GrantScope::All => return workspaces.keys().cloned().collect(),
            GrantScope::Names(names) => affected.extend(
                names
                    .iter()
                    .filter(|name| workspaces.contains_key(*name))
                    .cloned(),
            ),
        }
    }
    affected
}

fn revoke(
    subjects: &mut HashMap<Subject, Arc<SubjectEntry>>,
    subject: &Subject,
    workspace: &str,
    bindings_version: ResourceVersion,
) {
    let now_empty = match subjects.get_mut(subject) {
        Some(entry) => {
            let entry = Arc::make_mut(entry);
            entry.workspaces.remove(workspace);
            entry.bindings_version = bindings_version;
            entry.workspaces.is_empty()
        }
        None => false,
    };
    if now_empty {
        subjects.remove(subject);
    }
}

type MembershipDiff = (String, BTreeSet<Subject>, BTreeSet<Subject>);

fn membership_diff(
    old: &BTreeMap<String, WorkspaceSlot>,
    new: &BTreeMap<String, WorkspaceSlot>,
) -> Vec<MembershipDiff> {
    let empty = BTreeSet::new();
    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let before = old.get(name).map_or(&empty, |slot| &slot.subjects);
            let after = new.get(name).map_or(&empty, |slot| &slot.subjects);
            let added: BTreeSet<Subject> = after.difference(before).cloned().collect();
            let removed: BTreeSet<Subject> = before.difference(after).cloned().collect();
            (!added.is_empty() || !removed.is_empty()).then(|| (name.clone(), added, removed))
        })
        .collect()
}

fn build_view(state: &WriterState, generation: u64) -> IndexView {
    let mut entries: HashMap<Subject, SubjectEntry> = HashMap::new();
    let mut workspaces = HashMap::with_capacity(state.workspaces.len());

    for (name, slot) in &state.workspaces {
        for subject in &slot.subjects {
            let entry = entries.entry(subject.clone()).or_insert_with(|| SubjectEntry {
                workspaces: BTreeMap::new(),
                bindings_version: state.bindings_version,
            });
            entry
                .workspaces
                .insert(name.clone(), slot.record.resource_version);
        }
        workspaces.insert(
            name.clone(),
            WorkspaceView {
                record: slot.record.clone(),
                subjects: Arc::new(slot.subjects.clone()),
            },
        );
    }

    IndexView {
        generation,
        subjects: entries
            .into_iter()
            .map(|(subject, entry)| (subject, Arc::new(entry)))
            .collect(),
        workspaces,
        bindings: state.bindings.len(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::roles::workspace_access_role;
    use crate::rbac::RuleEvaluator;
    use crate::tenancy::OrganizationId;

    fn index() -> AuthorizationIndex {
        let evaluator = RuleEvaluator::with_defaults();
        evaluator.add_role(workspace_access_role("ws-1-viewer", &["get"], ["ws-1"]));
        AuthorizationIndex::new(Arc::new(evaluator), AccessRequest::default())
    }

    fn ws(name: &str, version: u64) -> WorkspaceRecord {
        WorkspaceRecord::new(name, OrganizationId::new("org"))
            .with_resource_version(ResourceVersion::new(version))
    }

    fn binding(name: &str, role: &str, subject: Subject, version: u64) -> RoleBinding {
        RoleBinding::new(name, role)
            .with_subject(subject)
            .with_resource_version(ResourceVersion::new(version))
    }

    fn alice() -> Subject {
        Subject::user("alice")
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rebuild_then_list() {
        let index = index();
        let summary = index
            .full_rebuild(Snapshot::new(
                Listed::from_items(vec![ws("ws-1", 1), ws("ws-2", 2)]),
                Listed::from_items(vec![binding("b1", "ws-1-viewer", alice(), 3)]),
            ))
            .unwrap();

        assert_eq!(summary.generation, 1);
        assert_eq!(summary.workspaces, 2);
        assert_eq!(summary.subjects, 1);
        assert_eq!(index.list(&alice()), names(&["ws-1"]));
        assert!(index.list(&Subject::user("bob")).is_empty());
    }

    #[test]
    fn test_workspace_add_and_delete() {
        let index = index();
        index.update(WatchEvent::Added(binding("b1", "workspace-viewer", alice(), 1)).into());

        let outcome = index.update(WatchEvent::Added(ws("ws-a", 2)).into());
        assert_eq!(outcome, UpdateOutcome::Applied { changed: 1 });
        assert_eq!(index.list(&alice()), names(&["ws-a"]));

        let entry = index.entry(&alice()).unwrap();
        assert_eq!(entry.workspaces["ws-a"], ResourceVersion::new(2));
        assert_eq!(entry.bindings_version, ResourceVersion::new(1));

        index.update(WatchEvent::Deleted(ws("ws-a", 3)).into());
        assert!(index.list(&alice()).is_empty());
        assert!(index.entry(&alice()).is_none());
        assert!(index.workspace("ws-a").is_none());
    }

    #[test]
    fn test_duplicate_and_stale_events() {
        let index = index();
        assert!(matches!(
            index.update(WatchEvent::Added(ws("ws-1", 5)).into()),
            UpdateOutcome::Applied { .. }
        ));
        assert_eq!(
            index.update(WatchEvent::Added(ws("ws-1", 5)).into()),
            UpdateOutcome::Duplicate
        );
        assert_eq!(
            index.update(WatchEvent::Deleted(ws("ws-1", 4)).into()),
            UpdateOutcome::Stale
        );
        assert!(index.workspace("ws-1").is_some());
    }

    #[test]
    fn test_unversioned_events_always_apply() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 0)).into());

        let first = index.update(WatchEvent::Added(binding("b1", "workspace-viewer", alice(), 0)).into());
        assert_eq!(first, UpdateOutcome::Applied { changed: 1 });

        let second = index.update(
            WatchEvent::Modified(binding("b1", "workspace-viewer", Subject::user("bob"), 0)).into(),
        );
        assert_eq!(second, UpdateOutcome::Applied { changed: 1 });
        assert!(index.list(&alice()).is_empty());
        assert_eq!(index.list(&Subject::user("bob")), names(&["ws-1"]));
    }

    #[test]
    fn test_unversioned_snapshot_is_not_stale() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 9)).into());

        let summary = index
            .full_rebuild(Snapshot::new(
                Listed::new(vec![ws("ws-2", 0)], ResourceVersion::ZERO),
                Listed::default(),
            ))
            .unwrap();
        assert_eq!(summary.workspaces, 1);
        assert!(index.workspace("ws-1").is_none());
        assert!(index.workspace("ws-2").is_some());
    }

    #[test]
    fn test_tombstone_rejects_resurrection() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        index.update(WatchEvent::Deleted(ws("ws-1", 3)).into());

        assert_eq!(
            index.update(WatchEvent::Modified(ws("ws-1", 2)).into()),
            UpdateOutcome::Stale
        );
        assert!(index.workspace("ws-1").is_none());
    }

    #[test]
    fn test_unknown_key_below_snapshot_floor_is_stale() {
        let index = index();
        index
            .full_rebuild(Snapshot::new(
                Listed::new(vec![ws("ws-1", 4)], ResourceVersion::new(10)),
                Listed::default(),
            ))
            .unwrap();

        assert_eq!(
            index.update(WatchEvent::Added(ws("ws-gone", 7)).into()),
            UpdateOutcome::Stale
        );
        assert!(matches!(
            index.update(WatchEvent::Added(ws("ws-new", 11)).into()),
            UpdateOutcome::Applied { .. }
        ));
    }

    #[test]
    fn test_binding_restricted_to_named_workspaces() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        index.update(WatchEvent::Added(ws("ws-2", 2)).into());

        let outcome = index.update(WatchEvent::Added(binding("b1", "ws-1-viewer", alice(), 3)).into());
        assert_eq!(outcome, UpdateOutcome::Applied { changed: 1 });
        assert_eq!(index.list(&alice()), names(&["ws-1"]));
        assert_eq!(index.subjects_with_access("ws-1"), BTreeSet::from([alice()]));
        assert!(index.subjects_with_access("ws-2").is_empty());
    }

    #[test]
    fn test_binding_that_grants_nothing_is_stored_only() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        let generation = index.generation();

        let outcome = index.update(WatchEvent::Added(binding("b1", "ghost", alice(), 2)).into());
        assert_eq!(outcome, UpdateOutcome::Applied { changed: 0 });
        assert_eq!(index.generation(), generation);
        assert!(index.list(&alice()).is_empty());
    }

    #[test]
    fn test_overlapping_bindings() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        index.update(WatchEvent::Added(binding("b1", "workspace-viewer", alice(), 2)).into());
        index.update(WatchEvent::Added(binding("b2", "ws-1-viewer", alice(), 3)).into());

        let outcome =
            index.update(WatchEvent::Deleted(binding("b1", "workspace-viewer", alice(), 4)).into());
        assert_eq!(outcome, UpdateOutcome::Applied { changed: 0 });
        assert_eq!(index.list(&alice()), names(&["ws-1"]));
        assert_eq!(
            index.entry(&alice()).unwrap().bindings_version,
            ResourceVersion::new(4)
        );

        index.update(WatchEvent::Deleted(binding("b2", "ws-1-viewer", alice(), 5)).into());
        assert!(index.list(&alice()).is_empty());
    }

    #[test]
    fn test_binding_subject_change_moves_access() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        index.update(WatchEvent::Added(binding("b1", "workspace-viewer", alice(), 2)).into());
        index.update(
            WatchEvent::Modified(binding("b1", "workspace-viewer", Subject::user("bob"), 3)).into(),
        );

        assert!(index.list(&alice()).is_empty());
        assert_eq!(index.list(&Subject::user("bob")), names(&["ws-1"]));
    }

    #[test]
    fn test_inconclusive_event_commits_nothing() {
        let evaluator = RuleEvaluator::with_defaults().strict();
        let index = AuthorizationIndex::new(Arc::new(evaluator), AccessRequest::default());
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        let generation = index.generation();

        let outcome = index.update(WatchEvent::Added(binding("b1", "ghost", alice(), 2)).into());
        assert!(outcome.is_inconclusive());
        assert_eq!(index.generation(), generation);
        assert_eq!(index.binding_count(), 0);

        // Not recorded, so a retry is not treated as a duplicate.
        let retry = index.update(WatchEvent::Added(binding("b1", "ghost", alice(), 2)).into());
        assert!(retry.is_inconclusive());
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 9)).into());

        let err = index
            .full_rebuild(Snapshot::new(
                Listed::new(vec![], ResourceVersion::new(5)),
                Listed::default(),
            ))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleSnapshot);
        assert!(index.workspace("ws-1").is_some());
    }

    #[test]
    fn test_rebuild_replaces_previous_state() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        index.update(WatchEvent::Added(binding("b1", "workspace-viewer", alice(), 1)).into());
        assert_eq!(index.list(&alice()), names(&["ws-1"]));

        index
            .full_rebuild(Snapshot::new(
                Listed::new(vec![ws("ws-2", 3)], ResourceVersion::new(3)),
                Listed::new(vec![], ResourceVersion::new(2)),
            ))
            .unwrap();
        assert!(index.list(&alice()).is_empty());
        assert_eq!(index.workspace_count(), 1);
        assert_eq!(index.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_membership_notifications() {
        let index = index();
        let mut rx = index.notifier().subscribe();

        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        index.update(WatchEvent::Added(binding("b1", "workspace-viewer", alice(), 2)).into());

        let change = rx.recv().await.unwrap();
        assert_eq!(change.workspace, "ws-1");
        assert_eq!(change.cause, ChangeCause::BindingEvent);
        assert_eq!(change.added, BTreeSet::from([alice()]));
        assert_eq!(change.generation, index.generation());
    }

    #[test]
    fn test_list_for_unions_subjects() {
        let index = index();
        index.update(WatchEvent::Added(ws("ws-1", 1)).into());
        index.update(WatchEvent::Added(ws("ws-2", 2)).into());
        index.update(WatchEvent::Added(binding("b1", "ws-1-viewer", alice(), 1)).into());
        index.update(
            WatchEvent::Added(binding("b2", "workspace-viewer", Subject::group("devs"), 2)).into(),
        );

        let subjects = [alice(), Subject::group("devs")];
        let (generation, records) = index.list_for(subjects.iter());
        let listed: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(listed, vec!["ws-1", "ws-2"]);
        assert_eq!(generation, index.generation());
        assert!(index.allows(subjects.iter(), "ws-2"));
        assert!(!index.allows([alice()].iter(), "ws-2"));
    }
}
