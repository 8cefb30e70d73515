//! Orchestration of one tip import.
//!
//! An import runs inside a single transaction: discover and intern the
//! ancestry, number the revisions (incrementally when a prior numbering
//! exists), write the `dotted_revno` groups, extend the mainline range
//! cover, commit. Readers observe either the pre-import or the post-import
//! state, nothing in between.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::debug;
use rusqlite::{Connection, OptionalExtension};

use history_graph::RevnoVec;

use crate::incremental::IncrementalMergeSorter;
use crate::interner::RevisionInterner;
use crate::parents::ParentStore;
use crate::ranges::{MainlineRangeCache, DEFAULT_RANGE_LEN};
use crate::{schema, DbId, Error, Repository, Result, RevisionId};

/// How many revisions to ask the repository about per round trip.
const ORACLE_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Extend an existing numbering instead of recomputing it, when one
    /// exists.
    pub incremental: bool,
    /// After an incremental sort, rerun the reference sorter over the whole
    /// ancestry and compare. Expensive; meant for tests.
    pub validate: bool,
    /// Hint for the database page cache, in bytes.
    pub max_cache_size_bytes: Option<u64>,
    /// Maximum mainline revisions per range.
    pub mainline_range_len: usize,
}

impl ImportOptions {
    /// Reject option values the index cannot operate with.
    pub(crate) fn check(&self) -> Result<()> {
        if self.mainline_range_len < 2 {
            return Err(Error::Config(format!(
                "mainline_range_len must be at least 2, got {}",
                self.mainline_range_len
            )));
        }
        Ok(())
    }
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            incremental: true,
            validate: false,
            max_cache_size_bytes: None,
            mainline_range_len: DEFAULT_RANGE_LEN,
        }
    }
}

/// A progress report handed to the optional callback. Returning `false`
/// from the callback cancels the import; the transaction is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub phase: &'static str,
    pub current: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Imported { nodes: usize },
    /// The tip was already numbered, here or by a concurrent writer; the
    /// transaction was rolled back and the store already holds equivalent
    /// data.
    AlreadyPresent,
    /// The progress callback asked to stop; the store is untouched.
    Cancelled,
    /// The tip was the null revision; there is nothing to number.
    EmptyBranch,
}

#[derive(Debug, Default, Clone)]
pub struct ImportStats {
    pub revisions_added: u64,
    pub ghosts_recorded: u64,
    pub nodes_inserted: u64,
    pub groups_inserted: u64,
}

struct ProgressSink<'a> {
    callback: Option<&'a mut dyn for<'r> FnMut(&'r Progress) -> bool>,
}

fn reborrow_progress_callback<'a>(
    callback: &'a mut Option<Box<dyn for<'r> FnMut(&'r Progress) -> bool>>,
) -> Option<&'a mut (dyn for<'r> FnMut(&'r Progress) -> bool + 'a)> {
    match callback {
        Some(b) => Some(b.as_mut()),
        None => None,
    }
}

impl ProgressSink<'_> {
    fn update(&mut self, phase: &'static str, current: usize, total: usize) -> bool {
        match &mut self.callback {
            Some(callback) => callback(&Progress {
                phase,
                current,
                total,
            }),
            None => true,
        }
    }
}

/// One node ready for insertion, tip first within its import.
struct InsertNode {
    db_id: DbId,
    merge_depth: usize,
    revno: RevnoVec,
    end_of_merge: bool,
}

enum GroupInsert {
    Inserted,
    AlreadyPresent,
}

/// The single writer of the index.
pub struct Importer {
    conn: Connection,
    db_path: PathBuf,
    options: ImportOptions,
    interner: RevisionInterner,
    parents: ParentStore,
    ranges: MainlineRangeCache,
    progress: Option<Box<dyn for<'r> FnMut(&'r Progress) -> bool>>,
    stats: ImportStats,
}

impl Importer {
    /// Open (and bootstrap if needed) the database at `db_path`.
    pub fn open(db_path: &Path, options: ImportOptions) -> Result<Importer> {
        options.check()?;
        let (conn, actual_path) = schema::ensure(db_path)?;
        if let Some(bytes) = options.max_cache_size_bytes {
            schema::apply_cache_size(&conn, bytes)?;
        }
        let ranges = MainlineRangeCache::new(options.mainline_range_len);
        Ok(Importer {
            conn,
            db_path: actual_path,
            options,
            interner: RevisionInterner::new(),
            parents: ParentStore::new(),
            ranges,
            progress: None,
            stats: ImportStats::default(),
        })
    }

    /// Install a progress callback; it may cancel by returning `false` and
    /// never affects what gets written.
    pub fn set_progress_fn(&mut self, callback: Box<dyn for<'r> FnMut(&'r Progress) -> bool>) {
        self.progress = Some(callback);
    }

    pub fn stats(&self) -> &ImportStats {
        &self.stats
    }

    /// The file the index actually lives in (a `.v<N>` sibling of the
    /// requested path when schema versions diverged).
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Import the ancestry of the repository tip, or of `tip_revision_id`
    /// when given.
    pub fn import_tip(
        &mut self,
        repo: &dyn Repository,
        tip_revision_id: Option<RevisionId>,
    ) -> Result<Outcome> {
        let tip = match tip_revision_id {
            Some(tip) => tip,
            None => repo.tip_revision_id()?,
        };
        if tip.is_null() {
            return Ok(Outcome::EmptyBranch);
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut progress = ProgressSink {
            callback: reborrow_progress_callback(&mut self.progress),
        };

        let prior_numbering: bool = tx
            .query_row("SELECT count(*) > 0 FROM dotted_revno LIMIT 1", [], |row| {
                row.get(0)
            })?;
        let nodes = if self.options.incremental && prior_numbering {
            if !Self::update_ancestry(
                &tx,
                repo,
                &mut self.interner,
                &mut self.parents,
                &mut progress,
                &mut self.stats,
                &tip,
            )? {
                return Ok(Outcome::Cancelled);
            }
            let tip_db_id = self
                .interner
                .lookup_db_id(&tx, &tip)?
                .ok_or_else(|| Error::NotFound(tip.clone()))?;
            if is_imported(&tx, tip_db_id)? {
                return Ok(Outcome::AlreadyPresent);
            }
            if !progress.update("sorting", 0, 0) {
                return Ok(Outcome::Cancelled);
            }
            let scheduled =
                IncrementalMergeSorter::new(&tx, &mut self.parents, tip_db_id).topo_order()?;
            if self.options.validate {
                Self::validate_incremental(&tx, repo, &mut self.interner, &scheduled, &tip)?;
            }
            scheduled
                .into_iter()
                .map(|node| InsertNode {
                    db_id: node.db_id,
                    merge_depth: node.merge_depth,
                    revno: node.revno,
                    end_of_merge: node.end_of_merge,
                })
                .collect()
        } else {
            let (parent_map, ghosts) = match Self::load_whole_ancestry(repo, &mut progress, &tip)?
            {
                Some(found) => found,
                None => return Ok(Outcome::Cancelled),
            };
            if !progress.update("sorting", 0, 0) {
                return Ok(Outcome::Cancelled);
            }
            let rows = history_graph::merge_sort(parent_map.clone(), tip.clone())?;
            Self::persist_ancestry(
                &tx,
                &mut self.interner,
                &mut self.parents,
                &mut self.stats,
                &parent_map,
                &ghosts,
            )?;
            let mut nodes = Vec::with_capacity(rows.len());
            for row in rows {
                let db_id = self.interner.intern(&tx, &row.key)?;
                nodes.push(InsertNode {
                    db_id,
                    merge_depth: row.merge_depth,
                    revno: row.revno,
                    end_of_merge: row.end_of_merge,
                });
            }
            nodes
        };

        match Self::insert_dotted_groups(&tx, &mut progress, &mut self.stats, &nodes)? {
            Some(GroupInsert::Inserted) => {}
            Some(GroupInsert::AlreadyPresent) => return Ok(Outcome::AlreadyPresent),
            None => return Ok(Outcome::Cancelled),
        }
        let tip_db_id = self
            .interner
            .lookup_db_id(&tx, &tip)?
            .ok_or_else(|| Error::NotFound(tip.clone()))?;
        self.ranges.extend(&tx, &mut self.parents, tip_db_id)?;
        tx.commit()?;
        debug!(
            "imported tip {}: {} nodes in {} groups, {} new revisions, {} ghosts",
            tip,
            self.stats.nodes_inserted,
            self.stats.groups_inserted,
            self.stats.revisions_added,
            self.stats.ghosts_recorded
        );
        Ok(Outcome::Imported { nodes: nodes.len() })
    }

    /// Walk the repository upward from `tip` until revisions the store
    /// already knows, recording new revisions with their gdfo and parent
    /// edges. Returns `false` when cancelled.
    fn update_ancestry(
        conn: &Connection,
        repo: &dyn Repository,
        interner: &mut RevisionInterner,
        parents: &mut ParentStore,
        progress: &mut ProgressSink<'_>,
        stats: &mut ImportStats,
        tip: &RevisionId,
    ) -> Result<bool> {
        let mut needed = vec![tip.clone()];
        let mut all_needed: HashSet<RevisionId> = needed.iter().cloned().collect();
        let mut children: HashMap<RevisionId, Vec<RevisionId>> = HashMap::new();
        let mut parent_map: HashMap<RevisionId, Vec<RevisionId>> = HashMap::new();
        let mut known: HashMap<RevisionId, i64> = HashMap::new();
        let mut ghosts: HashSet<RevisionId> = HashSet::new();

        while !needed.is_empty() {
            if !progress.update("finding ancestry", all_needed.len(), all_needed.len()) {
                return Ok(false);
            }
            let mut batch = Vec::new();
            while batch.len() < ORACLE_BATCH {
                let rev_id = match needed.pop() {
                    Some(rev_id) => rev_id,
                    None => break,
                };
                if known.contains_key(&rev_id) || parent_map.contains_key(&rev_id) {
                    continue;
                }
                let recorded: Option<i64> = conn
                    .query_row(
                        "SELECT gdfo FROM revision WHERE revision_id = ?",
                        [rev_id.as_bytes()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(gdfo) = recorded {
                    known.insert(rev_id, gdfo);
                    continue;
                }
                batch.push(rev_id);
            }
            if batch.is_empty() {
                continue;
            }
            let pmap = repo.get_parent_map(&batch)?;
            for rev_id in batch {
                match pmap.get(&rev_id) {
                    None => {
                        // referenced but not available: a ghost
                        parent_map.insert(rev_id.clone(), Vec::new());
                        ghosts.insert(rev_id);
                    }
                    Some(parent_ids) => {
                        let parent_ids = strip_null_parents(parent_ids);
                        for parent_id in &parent_ids {
                            children
                                .entry(parent_id.clone())
                                .or_default()
                                .push(rev_id.clone());
                            if !known.contains_key(parent_id)
                                && all_needed.insert(parent_id.clone())
                            {
                                needed.push(parent_id.clone());
                            }
                        }
                        parent_map.insert(rev_id, parent_ids);
                    }
                }
            }
        }
        Self::record_new_ancestry(conn, interner, stats, &mut known, &children, &parent_map, &ghosts)?;
        // parent edges, in db-id order
        let mut db_parent_map: HashMap<DbId, Vec<DbId>> = HashMap::new();
        for (rev_id, parent_ids) in &parent_map {
            let child = interner.intern(conn, rev_id)?;
            let mut parent_db_ids = Vec::with_capacity(parent_ids.len());
            for parent_id in parent_ids {
                parent_db_ids.push(interner.intern(conn, parent_id)?);
            }
            db_parent_map.insert(child, parent_db_ids);
        }
        parents.set_all(conn, &db_parent_map)?;
        Ok(true)
    }

    /// Bottom-up gdfo assignment for the newly discovered revisions; each
    /// becomes a `revision` row (plus a `ghost` row where applicable) as
    /// soon as every parent's gdfo is known.
    fn record_new_ancestry(
        conn: &Connection,
        interner: &mut RevisionInterner,
        stats: &mut ImportStats,
        known: &mut HashMap<RevisionId, i64>,
        children: &HashMap<RevisionId, Vec<RevisionId>>,
        parent_map: &HashMap<RevisionId, Vec<RevisionId>>,
        ghosts: &HashSet<RevisionId>,
    ) -> Result<()> {
        for (rev_id, parent_ids) in parent_map {
            if !parent_ids.is_empty() {
                continue;
            }
            let db_id = interner.intern(conn, rev_id)?;
            interner.set_gdfo(conn, db_id, 1)?;
            stats.revisions_added += 1;
            if ghosts.contains(rev_id) {
                interner.mark_ghost(conn, db_id)?;
                stats.ghosts_recorded += 1;
            }
            known.insert(rev_id.clone(), 1);
        }
        let mut pending: Vec<(i64, RevisionId)> = known
            .iter()
            .map(|(rev_id, gdfo)| (*gdfo, rev_id.clone()))
            .collect();
        while let Some((gdfo, rev_id)) = pending.pop() {
            let kids = match children.get(&rev_id) {
                Some(kids) => kids,
                None => continue,
            };
            for child in kids {
                if let Some(child_gdfo) = known.get(child) {
                    if *child_gdfo <= gdfo {
                        return Err(Error::CorruptIndex(format!(
                            "gdfo of {} does not exceed its parent {}",
                            child, rev_id
                        )));
                    }
                    continue;
                }
                let parent_ids = parent_map.get(child).ok_or_else(|| {
                    Error::CorruptIndex(format!("parents of {} were never discovered", child))
                })?;
                let mut max_gdfo = 0;
                let mut complete = true;
                for parent_id in parent_ids {
                    match known.get(parent_id) {
                        None => {
                            // some parent's gdfo is still pending
                            complete = false;
                            break;
                        }
                        Some(parent_gdfo) => max_gdfo = max_gdfo.max(*parent_gdfo),
                    }
                }
                if !complete {
                    continue;
                }
                let child_gdfo = max_gdfo + 1;
                let db_id = interner.intern(conn, child)?;
                interner.set_gdfo(conn, db_id, child_gdfo)?;
                stats.revisions_added += 1;
                known.insert(child.clone(), child_gdfo);
                pending.push((child_gdfo, child.clone()));
            }
        }
        Ok(())
    }

    /// Pull the complete ancestry of `tip` out of the repository. `None`
    /// when cancelled.
    #[allow(clippy::type_complexity)]
    fn load_whole_ancestry(
        repo: &dyn Repository,
        progress: &mut ProgressSink<'_>,
        tip: &RevisionId,
    ) -> Result<Option<(HashMap<RevisionId, Vec<RevisionId>>, HashSet<RevisionId>)>> {
        let mut parent_map: HashMap<RevisionId, Vec<RevisionId>> = HashMap::new();
        let mut ghosts: HashSet<RevisionId> = HashSet::new();
        let mut pending = vec![tip.clone()];
        let mut seen: HashSet<RevisionId> = pending.iter().cloned().collect();
        while !pending.is_empty() {
            if !progress.update("finding ancestry", parent_map.len(), parent_map.len()) {
                return Ok(None);
            }
            let batch: Vec<RevisionId> = pending
                .drain(pending.len().saturating_sub(ORACLE_BATCH)..)
                .collect();
            let pmap = repo.get_parent_map(&batch)?;
            for rev_id in batch {
                match pmap.get(&rev_id) {
                    None => {
                        ghosts.insert(rev_id);
                    }
                    Some(parent_ids) => {
                        let parent_ids = strip_null_parents(parent_ids);
                        for parent_id in &parent_ids {
                            if seen.insert(parent_id.clone()) {
                                pending.push(parent_id.clone());
                            }
                        }
                        parent_map.insert(rev_id, parent_ids);
                    }
                }
            }
        }
        Ok(Some((parent_map, ghosts)))
    }

    /// Intern a freshly loaded whole ancestry: revisions with gdfo, ghost
    /// markers, parent edges.
    fn persist_ancestry(
        conn: &Connection,
        interner: &mut RevisionInterner,
        parents: &mut ParentStore,
        stats: &mut ImportStats,
        parent_map: &HashMap<RevisionId, Vec<RevisionId>>,
        ghosts: &HashSet<RevisionId>,
    ) -> Result<()> {
        let gdfo = history_graph::compute_gdfo(parent_map)?;
        for (rev_id, g) in &gdfo {
            let db_id = interner.intern(conn, rev_id)?;
            interner.set_gdfo(conn, db_id, *g as i64)?;
            stats.revisions_added += 1;
        }
        for ghost in ghosts {
            let db_id = interner.intern(conn, ghost)?;
            interner.set_gdfo(conn, db_id, 1)?;
            interner.mark_ghost(conn, db_id)?;
            stats.ghosts_recorded += 1;
        }
        let mut db_parent_map: HashMap<DbId, Vec<DbId>> = HashMap::new();
        for (rev_id, parent_ids) in parent_map {
            let child = interner.intern(conn, rev_id)?;
            let mut parent_db_ids = Vec::with_capacity(parent_ids.len());
            for parent_id in parent_ids {
                parent_db_ids.push(interner.intern(conn, parent_id)?);
            }
            db_parent_map.insert(child, parent_db_ids);
        }
        parents.set_all(conn, &db_parent_map)
    }

    /// Write the numbered nodes grouped by mainline revision.
    ///
    /// A uniqueness conflict on the very first group means the tip itself is
    /// already numbered (an equivalent import won the race): the caller
    /// rolls everything back. A conflict on a later group means the
    /// remaining, older history is already present; the new groups stand.
    /// Returns `None` when cancelled.
    fn insert_dotted_groups(
        conn: &Connection,
        progress: &mut ProgressSink<'_>,
        stats: &mut ImportStats,
        nodes: &[InsertNode],
    ) -> Result<Option<GroupInsert>> {
        if nodes.is_empty() {
            return Ok(Some(GroupInsert::Inserted));
        }
        if nodes[0].merge_depth != 0 {
            return Err(Error::CorruptIndex(
                "merge sort did not start at a mainline revision".into(),
            ));
        }
        let mut stmt = conn.prepare_cached(
            "INSERT INTO dotted_revno
                 (tip_revision, merged_revision, revno, end_of_merge, merge_depth, dist)
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        let mut group_tip: Option<DbId> = None;
        let mut dist: i64 = 0;
        let mut first_group = true;
        for (idx, node) in nodes.iter().enumerate() {
            if idx & 0xff == 0 && !progress.update("importing", idx, nodes.len()) {
                return Ok(None);
            }
            if node.merge_depth == 0 {
                if group_tip.is_some() {
                    first_group = false;
                    stats.groups_inserted += 1;
                }
                group_tip = Some(node.db_id);
                dist = 0;
            }
            let tip = group_tip.expect("first node is mainline");
            let res = stmt.execute(rusqlite::params![
                tip,
                node.db_id,
                node.revno.to_string(),
                node.end_of_merge,
                node.merge_depth as i64,
                dist,
            ]);
            match res {
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Ok(Some(if first_group {
                        GroupInsert::AlreadyPresent
                    } else {
                        // older groups are already recorded; ours stand
                        GroupInsert::Inserted
                    }));
                }
                other => {
                    other?;
                }
            }
            stats.nodes_inserted += 1;
            dist += 1;
        }
        stats.groups_inserted += 1;
        Ok(Some(GroupInsert::Inserted))
    }

    /// Compare an incremental numbering against the reference sorter over
    /// the full ancestry.
    fn validate_incremental(
        conn: &Connection,
        repo: &dyn Repository,
        interner: &mut RevisionInterner,
        scheduled: &[crate::incremental::ScheduledNode],
        tip: &RevisionId,
    ) -> Result<()> {
        let mut silent = ProgressSink { callback: None };
        let (parent_map, _ghosts) = Self::load_whole_ancestry(repo, &mut silent, tip)?
            .expect("no callback, no cancellation");
        let reference = history_graph::merge_sort(parent_map, tip.clone())?;
        if reference.len() < scheduled.len() {
            return Err(Error::CorruptIndex(format!(
                "incremental sort produced {} nodes, reference only {}",
                scheduled.len(),
                reference.len()
            )));
        }
        for (node, expected) in scheduled.iter().zip(reference.iter()) {
            let rev_id = interner.lookup_rev(conn, node.db_id)?;
            if rev_id != expected.key
                || node.revno != expected.revno
                || node.merge_depth != expected.merge_depth
                || node.end_of_merge != expected.end_of_merge
            {
                return Err(Error::CorruptIndex(format!(
                    "incremental numbering diverges from reference: \
                     {} as {} depth {} vs {} as {} depth {}",
                    rev_id,
                    node.revno,
                    node.merge_depth,
                    expected.key,
                    expected.revno,
                    expected.merge_depth
                )));
            }
        }
        if let Some(next) = reference.get(scheduled.len()) {
            let db_id = interner
                .lookup_db_id(conn, &next.key)?
                .ok_or_else(|| Error::NotFound(next.key.clone()))?;
            if !is_imported(conn, db_id)? {
                return Err(Error::CorruptIndex(format!(
                    "reference sorter continues with {} which is not imported",
                    next.key
                )));
            }
        }
        Ok(())
    }
}

/// Does `db_id` head its own `dotted_revno` group?
pub(crate) fn is_imported(conn: &Connection, db_id: DbId) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM dotted_revno
          WHERE tip_revision = ? AND tip_revision = merged_revision",
        [db_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// `[NULL_REVISION]` stands for "no parents"; strip it.
fn strip_null_parents(parent_ids: &[RevisionId]) -> Vec<RevisionId> {
    if parent_ids.len() == 1 && parent_ids[0].is_null() {
        Vec::new()
    } else {
        parent_ids.to_vec()
    }
}
