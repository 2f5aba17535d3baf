use crate::cursor::models::{CursorEntry, SyncAction};
use crate::entities::models::{Entity, EntityKey};
use crate::sync::models::SyncMode;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Per-job change detector over a snapshot of the cursor taken at job start.
#[derive(Debug)]
pub struct DeltaPlanner {
    mode: SyncMode,
    complete_listing: bool,
    snapshot: HashMap<EntityKey, CursorEntry>,
    lineages: HashMap<EntityKey, Vec<EntityKey>>,
    seen: HashSet<EntityKey>,
    observed_roots: HashSet<EntityKey>,
    protected_roots: HashSet<EntityKey>,
}

impl DeltaPlanner {
    pub fn new(mode: SyncMode, entries: Vec<CursorEntry>) -> Self {
        let mut lineages: HashMap<EntityKey, Vec<EntityKey>> = HashMap::new();
        for e in &entries {
            lineages
                .entry(e.lineage_root.clone())
                .or_default()
                .push(e.key.clone());
        }
        Self {
            mode,
            complete_listing: false,
            snapshot: entries.into_iter().map(|e| (e.key.clone(), e)).collect(),
            lineages,
            seen: HashSet::new(),
            observed_roots: HashSet::new(),
            protected_roots: HashSet::new(),
        }
    }

    /// The connector reports every live record in incremental runs too, so
    /// unseen keys are deletion candidates regardless of mode.
    pub fn with_complete_listing(mut self, complete: bool) -> Self {
        self.complete_listing = complete;
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn tracked(&self) -> usize {
        self.snapshot.len()
    }

    /// Compare `entity` against the snapshot: new key inserts, changed hash updates,
    /// same hash (or a repeat of a key already decided in this run) skips.
    pub fn decide(&mut self, entity: Entity) -> SyncAction {
        let key = entity.key();
        self.observed_roots.insert(entity.lineage_root.clone());
        if !self.seen.insert(key.clone()) {
            return SyncAction::Skip(key);
        }
        match self.snapshot.get(&key) {
            None => SyncAction::Insert(entity),
            Some(prev) if prev.content_hash == entity.content_hash => SyncAction::Skip(key),
            Some(_) => SyncAction::Update(entity),
        }
    }

    /// Mark a source record as present in this run even though none of its
    /// outputs reached `decide`.
    pub fn observe_root(&mut self, root: EntityKey) {
        self.observed_roots.insert(root);
    }

    /// A source record reported as unchanged: every tracked entity of its
    /// lineage counts as seen and is skipped.
    pub fn retain_lineage(&mut self, root: EntityKey) -> Vec<SyncAction> {
        let keys = self.lineages.get(&root).cloned().unwrap_or_default();
        self.observed_roots.insert(root);
        keys.into_iter()
            .filter(|k| self.seen.insert(k.clone()))
            .map(SyncAction::Skip)
            .collect()
    }

    /// Keep everything derived from `root` out of deletion (failed or invalid lineage).
    pub fn protect_lineage(&mut self, root: EntityKey) {
        self.observed_roots.insert(root.clone());
        self.protected_roots.insert(root);
    }

    pub fn stored_hash(&self, key: &EntityKey) -> Option<&str> {
        self.snapshot.get(key).map(|e| e.content_hash.as_str())
    }

    pub fn lineage_of(&self, key: &EntityKey) -> Option<&EntityKey> {
        self.snapshot.get(key).map(|e| &e.lineage_root)
    }

    /// Deletion actions for tracked keys not seen in this run, sorted by key.
    ///
    /// A full sync sees every live record, so any unseen key is gone. An
    /// incremental sync only sees changed records, so only keys belonging to a
    /// lineage that was re-extracted (e.g. a document re-chunked into fewer
    /// pieces) are considered, unless the connector lists unchanged records.
    pub fn reconcile(&self) -> Vec<SyncAction> {
        let doomed: BTreeSet<&EntityKey> = self
            .snapshot
            .values()
            .filter(|e| !self.seen.contains(&e.key))
            .filter(|e| !self.protected_roots.contains(&e.lineage_root))
            .filter(|e| match self.mode {
                SyncMode::Full => true,
                SyncMode::Incremental => {
                    self.complete_listing || self.observed_roots.contains(&e.lineage_root)
                }
            })
            .map(|e| &e.key)
            .collect();
        doomed
            .into_iter()
            .map(|k| SyncAction::Delete(k.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::models::FieldValue;
    use crate::models::JobId;
    use chrono::Utc;

    fn entity(ty: &str, id: &str, body: &str, root: (&str, &str)) -> Entity {
        let mut e = Entity {
            entity_id: id.into(),
            entity_type: ty.into(),
            payload: [("body".to_string(), FieldValue::String(body.into()))]
                .into_iter()
                .collect(),
            source_updated_at: None,
            content_hash: String::new(),
            breadcrumbs: vec![],
            lineage_root: EntityKey::new(root.0, root.1),
            hash_exclude: vec![],
        };
        e.rehash();
        e
    }

    fn entry(e: &Entity) -> CursorEntry {
        CursorEntry {
            key: e.key(),
            content_hash: e.content_hash.clone(),
            lineage_root: e.lineage_root.clone(),
            last_seen_job_id: JobId::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn decides_insert_update_skip() {
        let a = entity("doc", "a", "v1", ("doc", "a"));
        let b = entity("doc", "b", "v1", ("doc", "b"));
        let mut planner = DeltaPlanner::new(SyncMode::Full, vec![entry(&a), entry(&b)]);

        assert!(matches!(planner.decide(a.clone()), SyncAction::Skip(_)));
        let b2 = entity("doc", "b", "v2", ("doc", "b"));
        assert!(matches!(planner.decide(b2), SyncAction::Update(_)));
        let c = entity("doc", "c", "v1", ("doc", "c"));
        assert!(matches!(planner.decide(c), SyncAction::Insert(_)));
    }

    #[test]
    fn duplicate_key_in_one_run_is_skipped() {
        let mut planner = DeltaPlanner::new(SyncMode::Full, vec![]);
        let a = entity("doc", "a", "v1", ("doc", "a"));
        assert!(matches!(planner.decide(a.clone()), SyncAction::Insert(_)));
        assert!(matches!(planner.decide(a), SyncAction::Skip(_)));
    }

    #[test]
    fn full_mode_deletes_everything_unseen() {
        let a = entity("doc", "a", "v1", ("doc", "a"));
        let b = entity("doc", "b", "v1", ("doc", "b"));
        let mut planner = DeltaPlanner::new(SyncMode::Full, vec![entry(&a), entry(&b)]);
        planner.decide(a);
        let deletes = planner.reconcile();
        assert_eq!(deletes, vec![SyncAction::Delete(EntityKey::new("doc", "b"))]);
    }

    #[test]
    fn incremental_mode_only_deletes_within_observed_lineages() {
        let parent = entity("doc", "a", "v1", ("doc", "a"));
        let chunk0 = entity("doc_chunk", "a#0", "x", ("doc", "a"));
        let chunk1 = entity("doc_chunk", "a#1", "y", ("doc", "a"));
        let other = entity("doc", "b", "v1", ("doc", "b"));
        let mut planner = DeltaPlanner::new(
            SyncMode::Incremental,
            vec![entry(&parent), entry(&chunk0), entry(&chunk1), entry(&other)],
        );
        // Record "a" changed and now yields a single chunk; "b" was not re-extracted.
        planner.decide(entity("doc", "a", "v2", ("doc", "a")));
        planner.decide(chunk0);
        let deletes = planner.reconcile();
        assert_eq!(
            deletes,
            vec![SyncAction::Delete(EntityKey::new("doc_chunk", "a#1"))]
        );
    }

    #[test]
    fn protected_lineages_are_never_deleted() {
        let a = entity("doc", "a", "v1", ("doc", "a"));
        let b = entity("doc", "b", "v1", ("doc", "b"));
        let mut planner = DeltaPlanner::new(SyncMode::Full, vec![entry(&a), entry(&b)]);
        planner.decide(a);
        planner.protect_lineage(EntityKey::new("doc", "b"));
        assert!(planner.reconcile().is_empty());
    }

    #[test]
    fn unchanged_markers_keep_their_lineage_and_expose_removals() {
        let a = entity("doc", "a", "v1", ("doc", "a"));
        let a_chunk = entity("doc_chunk", "a#0", "x", ("doc", "a"));
        let gone = entity("doc", "gone", "v1", ("doc", "gone"));
        let mut planner = DeltaPlanner::new(
            SyncMode::Incremental,
            vec![entry(&a), entry(&a_chunk), entry(&gone)],
        )
        .with_complete_listing(true);

        let kept = planner.retain_lineage(EntityKey::new("doc", "a"));
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|k| matches!(k, SyncAction::Skip(_))));
        assert_eq!(
            planner.reconcile(),
            vec![SyncAction::Delete(EntityKey::new("doc", "gone"))]
        );
    }

    #[test]
    fn unchanged_marker_for_untracked_record_is_a_no_op() {
        let mut planner = DeltaPlanner::new(SyncMode::Incremental, vec![]);
        assert!(planner.retain_lineage(EntityKey::new("doc", "new")).is_empty());
        assert!(planner.reconcile().is_empty());
    }
}
