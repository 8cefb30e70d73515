//! Incremental extension of a persisted merge-sort numbering.
//!
//! Given a store already holding the numbering for some older tip and a new
//! tip whose ancestry is a superset, produce the numbering of just the added
//! revisions, such that the union equals a from-scratch merge sort of the
//! new ancestry.
//!
//! All ids in this module are database ids; the revisions were interned and
//! their parent edges stored before the sorter runs.
//!
//! The work splits in two:
//!
//! 1. Find the *interesting* revisions: newly reachable, not yet numbered.
//!    The new mainline segment (left-hand parents from the new tip down to
//!    the youngest imported mainline revision) is interesting by
//!    construction. Every non-left parent hanging off that segment is a
//!    search tip that is either interesting too, or an ancestor of the
//!    imported history. Two cheap filters classify them: a tip whose gdfo
//!    is at least the gdfo at the imported-mainline search frontier cannot
//!    be an ancestor of it, and a tip all of whose children are interesting
//!    or imported has nothing left to merge it. Whenever neither filter
//!    decides, one more step of the imported mainline's numbering is loaded
//!    and the filters rerun. Unclassified tips then step to their parents.
//!
//! 2. Number the interesting revisions with the same depth-first walk the
//!    reference sorter uses, consulting the loaded historical numbering for
//!    first-child and branch-count decisions so new allocations never
//!    collide with numbers handed out by earlier imports.

use std::collections::{HashMap, HashSet};

use log::debug;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use history_graph::RevnoVec;

use crate::parents::ParentStore;
use crate::sql::{n_params, MAX_IN_PARAMS};
use crate::{DbId, Error, Result};

/// One numbered row loaded from or destined for `dotted_revno`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DottedInfo {
    pub revno: RevnoVec,
    pub end_of_merge: bool,
    pub merge_depth: usize,
}

/// Output of the incremental sort, tip first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduledNode {
    pub db_id: DbId,
    pub merge_depth: usize,
    pub revno: RevnoVec,
    pub end_of_merge: bool,
}

/// Which sub-branch a revision belongs to, for child counting. The mainline
/// is its own key, distinct from any dotted `(base, branch)` pair,
/// including the `(0, n)` branches of merged roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BranchKey {
    Mainline,
    Branch(usize, usize),
}

fn branch_key_of(revno: &RevnoVec) -> (BranchKey, usize) {
    if revno.len() > 1 {
        (BranchKey::Branch(revno[0], revno[1]), revno[2])
    } else {
        (BranchKey::Mainline, revno[0])
    }
}

/// A node on the depth-first numbering stack.
struct PendingNode {
    db_id: DbId,
    merge_depth: usize,
    /// Left-hand parent used for numbering; `None` for roots and ghost
    /// left-hand parents.
    left_parent: Option<DbId>,
    /// Left-hand parent not yet walked.
    left_pending_parent: Option<DbId>,
    /// Non-left parents, walked from the end (right to left).
    pending_parents: Vec<DbId>,
    is_first: bool,
}

pub(crate) struct IncrementalMergeSorter<'a> {
    conn: &'a Connection,
    parents: &'a mut ParentStore,
    tip_db_id: DbId,

    /// New mainline revisions, newest first.
    mainline_db_ids: Vec<DbId>,
    /// Search frontier into the already-imported mainline; `None` once the
    /// walk ran off the start of history.
    imported_mainline_id: Option<DbId>,
    /// gdfo of `imported_mainline_id`; 0 once off the mainline, so that
    /// every remaining candidate classifies as interesting.
    imported_gdfo: i64,

    known_gdfo: HashMap<DbId, i64>,
    /// Revisions that need numbering under the new tip.
    interesting: HashSet<DbId>,
    /// Numbering of imported mainline steps loaded so far, plus everything
    /// numbered by this run.
    imported_dotted_revno: HashMap<DbId, DottedInfo>,
    /// Every revno value present in `imported_dotted_revno`.
    known_dotted: HashSet<RevnoVec>,
    search_tips: HashSet<DbId>,

    /// mainline base revno -> number of sub-branches rooted there; key 0
    /// counts new-root branches.
    revno_to_branch_count: HashMap<usize, usize>,
    /// sub-branch -> largest in-branch revno seen.
    branch_to_child_count: HashMap<BranchKey, usize>,

    depth_first_stack: Vec<PendingNode>,
    scheduled: Vec<ScheduledNode>,
    /// Left-hand parents claimed during this walk.
    seen_parents: HashSet<DbId>,
    ghosts: HashSet<DbId>,

    mainline_steps: u64,
}

impl<'a> IncrementalMergeSorter<'a> {
    pub fn new(
        conn: &'a Connection,
        parents: &'a mut ParentStore,
        tip_db_id: DbId,
    ) -> Self {
        IncrementalMergeSorter {
            conn,
            parents,
            tip_db_id,
            mainline_db_ids: Vec::new(),
            imported_mainline_id: None,
            imported_gdfo: 0,
            known_gdfo: HashMap::new(),
            interesting: HashSet::new(),
            imported_dotted_revno: HashMap::new(),
            known_dotted: HashSet::new(),
            search_tips: HashSet::new(),
            revno_to_branch_count: HashMap::new(),
            branch_to_child_count: HashMap::new(),
            depth_first_stack: Vec::new(),
            scheduled: Vec::new(),
            seen_parents: HashSet::new(),
            ghosts: HashSet::new(),
            mainline_steps: 0,
        }
    }

    /// Run the sort; the result covers exactly the newly reachable
    /// revisions, tip first.
    pub fn topo_order(mut self) -> Result<Vec<ScheduledNode>> {
        self.find_interesting_ancestry()?;
        self.compute_merge_sort()?;
        debug!(
            "incremental sort: {} new revisions, {} imported mainline steps",
            self.scheduled.len(),
            self.mainline_steps
        );
        let mut scheduled = self.scheduled;
        scheduled.reverse();
        Ok(scheduled)
    }

    fn is_imported_db_id(&self, db_id: DbId) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM dotted_revno
              WHERE tip_revision = ? AND tip_revision = merged_revision",
            [db_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Walk left-hand parents from the tip until an imported revision.
    fn find_needed_mainline(&mut self) -> Result<()> {
        let mut needed = Vec::new();
        let mut cur = Some(self.tip_db_id);
        while let Some(db_id) = cur {
            if self.is_imported_db_id(db_id)? {
                break;
            }
            needed.push(db_id);
            cur = self.parents.get_lh_parent(self.conn, db_id)?;
        }
        self.interesting.extend(needed.iter().copied());
        self.mainline_db_ids = needed;
        self.imported_mainline_id = cur;
        Ok(())
    }

    /// The non-left parents of the new mainline are the candidates that
    /// might be newly merged.
    fn get_initial_search_tips(&mut self) -> Result<()> {
        let mut res: Vec<(DbId, i64)> = Vec::new();
        for chunk in self.mainline_db_ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT parent, gdfo FROM parent, revision
                  WHERE parent.parent = revision.db_id
                    AND parent_idx != 0
                    AND child IN ({})",
                n_params(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, DbId>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                res.push(row?);
            }
        }
        self.search_tips = res.iter().map(|r| r.0).collect();
        self.known_gdfo.extend(res);
        // One mainline step up front: it seeds the numbering and makes the
        // cheap filters effective immediately.
        self.step_mainline()?;
        let mut stmt = self.conn.prepare("SELECT db_id FROM ghost")?;
        let ghosts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<DbId>, _>>()?;
        self.ghosts = ghosts;
        Ok(())
    }

    /// Load the numbering group of the current imported-mainline revision
    /// and move the frontier one revision older.
    fn step_mainline(&mut self) -> Result<()> {
        self.mainline_steps += 1;
        let mainline_id = match self.imported_mainline_id {
            Some(id) => id,
            None => {
                self.imported_gdfo = 0;
                return Ok(());
            }
        };
        let mut stmt = self.conn.prepare_cached(
            "SELECT merged_revision, revno, end_of_merge, merge_depth
               FROM dotted_revno WHERE tip_revision = ? ORDER BY dist",
        )?;
        let rows = stmt
            .query_map([mainline_id], |row| {
                Ok((
                    row.get::<_, DbId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Err(Error::CorruptIndex(format!(
                "imported mainline revision {} has no dotted_revno rows",
                mainline_id
            )));
        }
        let mut dotted_info = Vec::with_capacity(rows.len());
        for (db_id, revno_str, end_of_merge, merge_depth) in rows {
            let revno: RevnoVec = revno_str.parse().map_err(|_| {
                Error::CorruptIndex(format!(
                    "unparseable revno {:?} for merged revision {}",
                    revno_str, db_id
                ))
            })?;
            dotted_info.push((
                db_id,
                DottedInfo {
                    revno,
                    end_of_merge,
                    merge_depth: merge_depth as usize,
                },
            ));
        }
        self.update_info_from_dotted(dotted_info);
        let res = self
            .conn
            .query_row(
                "SELECT parent, gdfo FROM parent, revision
                  WHERE parent = db_id AND parent_idx = 0 AND child = ?",
                [mainline_id],
                |row| Ok((row.get::<_, DbId>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        match res {
            None => {
                // walked off the start of the mainline
                self.imported_mainline_id = None;
                self.imported_gdfo = 0;
            }
            Some((parent, gdfo)) => {
                self.imported_mainline_id = Some(parent);
                self.imported_gdfo = gdfo;
                self.known_gdfo.insert(parent, gdfo);
            }
        }
        Ok(())
    }

    /// Fold loaded or freshly assigned numbering into the branch counters.
    fn update_info_from_dotted(&mut self, dotted_info: Vec<(DbId, DottedInfo)>) {
        for (db_id, info) in dotted_info {
            if info.revno.len() > 1 {
                let base_revno = info.revno[0];
                let branch = info.revno[1];
                let entry = self.revno_to_branch_count.entry(base_revno).or_insert(0);
                if branch > *entry {
                    *entry = branch;
                }
            } else {
                // a mainline revision: mark the mainline root as allocated
                self.revno_to_branch_count.entry(0).or_insert(0);
            }
            let (branch_key, mini_revno) = branch_key_of(&info.revno);
            let entry = self.branch_to_child_count.entry(branch_key).or_insert(0);
            if mini_revno > *entry {
                *entry = mini_revno;
            }
            self.known_dotted.insert(info.revno.clone());
            self.imported_dotted_revno.insert(db_id, info);
        }
    }

    /// Classify search tips by gdfo. Tips already numbered drop out; tips
    /// that cannot be ancestors of the frontier become interesting; the
    /// rest stay unknown.
    fn split_search_tips_by_gdfo(&mut self, unknown: Vec<DbId>) -> Result<Vec<DbId>> {
        let mut still_unknown = Vec::new();
        for db_id in unknown {
            if self.imported_dotted_revno.contains_key(&db_id)
                || Some(db_id) == self.imported_mainline_id
            {
                // an ancestor of an imported revision, not interesting
                self.search_tips.remove(&db_id);
                continue;
            }
            let gdfo = self.known_gdfo.get(&db_id).copied().ok_or_else(|| {
                Error::CorruptIndex(format!("no gdfo recorded for revision {}", db_id))
            })?;
            if gdfo >= self.imported_gdfo {
                self.interesting.insert(db_id);
            } else {
                still_unknown.push(db_id);
            }
        }
        Ok(still_unknown)
    }

    /// Classify search tips by their children: a tip with no child that
    /// could still be merged into imported history is interesting.
    fn split_interesting_using_children(
        &mut self,
        unknown_search_tips: Vec<DbId>,
    ) -> Result<Vec<DbId>> {
        let mut parent_child: Vec<(DbId, DbId)> = Vec::new();
        for chunk in unknown_search_tips.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT parent, child FROM parent WHERE parent IN ({})",
                n_params(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, DbId>(0)?, row.get::<_, DbId>(1)?))
            })?;
            for row in rows {
                parent_child.push(row?);
            }
        }
        let mut parent_to_children: HashMap<DbId, Vec<DbId>> = HashMap::new();
        let mut already_imported: HashSet<DbId> = HashSet::new();
        for (parent, child) in &parent_child {
            if self.imported_dotted_revno.contains_key(child)
                || Some(*child) == self.imported_mainline_id
            {
                // the child is imported, so the parent must be too
                already_imported.insert(*parent);
                already_imported.insert(*child);
            }
            parent_to_children.entry(*parent).or_default().push(*child);
        }
        for db_id in &already_imported {
            self.search_tips.remove(db_id);
        }
        let mut possibly_merged_children: HashSet<DbId> = parent_child
            .iter()
            .filter(|(parent, child)| {
                !self.interesting.contains(child) && !already_imported.contains(parent)
            })
            .map(|(_, child)| *child)
            .collect();
        let unknown_gdfos: Vec<DbId> = possibly_merged_children
            .iter()
            .filter(|child| !self.known_gdfo.contains_key(child))
            .copied()
            .collect();
        for chunk in unknown_gdfos.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT db_id, gdfo FROM revision WHERE db_id IN ({})",
                n_params(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, DbId>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (db_id, gdfo) = row?;
                self.known_gdfo.insert(db_id, gdfo);
            }
        }
        // children at or above the frontier gdfo cannot be merged into the
        // remaining imported ancestry
        let min_gdfo = self.imported_gdfo;
        let known_gdfo = &self.known_gdfo;
        possibly_merged_children
            .retain(|child| known_gdfo.get(child).copied().unwrap_or(min_gdfo) < min_gdfo);
        let mut still_unknown = Vec::new();
        for parent in unknown_search_tips {
            if already_imported.contains(&parent) {
                continue;
            }
            let children = parent_to_children.get(&parent);
            let has_mergeable_child = children
                .map(|c| c.iter().any(|child| possibly_merged_children.contains(child)))
                .unwrap_or(false);
            if has_mergeable_child {
                still_unknown.push(parent);
            } else {
                self.interesting.insert(parent);
            }
        }
        Ok(still_unknown)
    }

    /// Advance every remaining search tip to its parents.
    fn step_search_tips(&mut self) -> Result<()> {
        let tips: Vec<DbId> = self.search_tips.iter().copied().collect();
        let mut res: Vec<(DbId, i64)> = Vec::new();
        for chunk in tips.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT parent, gdfo FROM parent, revision
                  WHERE parent = db_id AND child IN ({})",
                n_params(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, DbId>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                res.push(row?);
            }
        }
        // tips already found interesting via another path stop here; the
        // numbering walk will reach them anyway
        self.search_tips = res
            .iter()
            .map(|r| r.0)
            .filter(|parent| !self.interesting.contains(parent))
            .collect();
        self.known_gdfo.extend(res);
        Ok(())
    }

    /// The left-hand parent of every interesting revision must either be
    /// interesting itself or have its numbering loaded; load more mainline
    /// as needed.
    fn ensure_lh_parent_info(&mut self) -> Result<()> {
        let interesting: Vec<DbId> = self.interesting.iter().copied().collect();
        let mut missing_parent_ids: HashSet<DbId> = HashSet::new();
        for db_id in interesting {
            let parent_ids = self.parents.get_parents(self.conn, db_id)?;
            let lh_parent = match parent_ids.first() {
                None => continue,
                Some(parent) => *parent,
            };
            if self.interesting.contains(&lh_parent)
                || self.imported_dotted_revno.contains_key(&lh_parent)
            {
                continue;
            }
            missing_parent_ids.insert(lh_parent);
        }
        for ghost in &self.ghosts {
            missing_parent_ids.remove(ghost);
        }
        while !missing_parent_ids.is_empty() {
            if self.imported_mainline_id.is_none() {
                return Err(Error::CorruptIndex(format!(
                    "left-hand parents {:?} never appear in the imported numbering",
                    missing_parent_ids
                )));
            }
            self.step_mainline()?;
            let imported = &self.imported_dotted_revno;
            missing_parent_ids.retain(|db_id| !imported.contains_key(db_id));
        }
        Ok(())
    }

    fn find_interesting_ancestry(&mut self) -> Result<()> {
        self.find_needed_mainline()?;
        self.get_initial_search_tips()?;
        while !self.search_tips.is_empty() {
            let mut unknown: Vec<DbId> = self.search_tips.iter().copied().collect();
            while !unknown.is_empty() {
                unknown = self.split_search_tips_by_gdfo(unknown)?;
                if unknown.is_empty() {
                    break;
                }
                unknown = self.split_interesting_using_children(unknown)?;
                if unknown.is_empty() {
                    break;
                }
                // The remaining tips have children that might be merged into
                // an earlier mainline revision; load more of it to decide.
                self.step_mainline()?;
            }
            self.step_search_tips()?;
        }
        self.ensure_lh_parent_info()
    }

    /// Has any child of `parent_id` been seen, in this walk or in the
    /// numbering loaded so far?
    fn is_first_child(&mut self, parent_id: DbId) -> bool {
        if !self.seen_parents.insert(parent_id) {
            return false;
        }
        let info = match self.imported_dotted_revno.get(&parent_id) {
            // never merged before, so no child of it can have been numbered
            None => return true,
            Some(info) => info,
        };
        let (branch_key, mini_revno) = branch_key_of(&info.revno);
        // a larger in-branch revno means some other child continued the
        // branch already
        self.branch_to_child_count
            .get(&branch_key)
            .copied()
            .unwrap_or(0)
            <= mini_revno
    }

    fn push_node(&mut self, db_id: DbId, merge_depth: usize) -> Result<()> {
        if !self.interesting.contains(&db_id) {
            return Ok(());
        }
        let parent_ids = self.parents.get_parents(self.conn, db_id)?;
        let (left_parent, is_first) = match parent_ids.first() {
            None => (None, true),
            Some(parent) if self.ghosts.contains(parent) => (None, true),
            Some(parent) => (Some(*parent), self.is_first_child(*parent)),
        };
        let pending_parents: Vec<DbId> = parent_ids
            .get(1..)
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|parent| !self.ghosts.contains(parent))
            .collect();
        self.depth_first_stack.push(PendingNode {
            db_id,
            merge_depth,
            left_parent,
            left_pending_parent: left_parent,
            pending_parents,
            is_first,
        });
        Ok(())
    }

    /// Load imported mainline until the most recent sub-branch rooted at
    /// `base_revno` is known, so a fresh branch counter cannot collide with
    /// numbers allocated by earlier imports.
    ///
    /// Walking backwards, the first revision seen of *any* sub-branch of
    /// `base_revno` is necessarily from the most recently merged one; and
    /// reaching `base_revno` itself means every sub-branch is loaded.
    /// `base_revno` 0 stands for the new-root pseudo-branch.
    fn step_to_latest_branch(&mut self, base_revno: usize) -> Result<()> {
        while self.imported_mainline_id.is_some() {
            if self.known_dotted.contains(&RevnoVec::from(base_revno)) {
                break;
            }
            let branch_count = self
                .revno_to_branch_count
                .get(&base_revno)
                .copied()
                .unwrap_or(0);
            let root_of_branch = RevnoVec::from(vec![base_revno, branch_count, 1]);
            if self.known_dotted.contains(&root_of_branch) {
                break;
            }
            self.step_mainline()?;
        }
        Ok(())
    }

    /// Number the node on top of the stack and move it to the schedule.
    fn pop_node(&mut self) -> Result<()> {
        let node = self.depth_first_stack.pop().unwrap();
        let revno = if let Some(left_parent) = node.left_parent {
            let parent_revno = self
                .imported_dotted_revno
                .get(&left_parent)
                .ok_or_else(|| {
                    Error::CorruptIndex(format!(
                        "left-hand parent {} of {} has no numbering",
                        left_parent, node.db_id
                    ))
                })?
                .revno
                .clone();
            if node.is_first {
                if parent_revno.len() == 1 {
                    let mini_revno = parent_revno[0] + 1;
                    let entry = self
                        .branch_to_child_count
                        .entry(BranchKey::Mainline)
                        .or_insert(0);
                    if mini_revno > *entry {
                        *entry = mini_revno;
                    }
                    RevnoVec::from(mini_revno)
                } else {
                    parent_revno.bump_last()
                }
            } else {
                // A new branch number. When the parent is itself merged, the
                // start of its base's newest branch may not be loaded yet.
                if parent_revno.len() > 1 {
                    self.step_to_latest_branch(parent_revno[0])?;
                }
                let base_revno = parent_revno[0];
                let branch_count = self
                    .revno_to_branch_count
                    .get(&base_revno)
                    .copied()
                    .unwrap_or(0)
                    + 1;
                self.revno_to_branch_count.insert(base_revno, branch_count);
                RevnoVec::from(vec![base_revno, branch_count, 1])
            }
        } else {
            // A new root: either the very first revision of the branch, or a
            // parent-less (or ghost-parented) revision merged later. The
            // root counter decides, exactly as `is_first` does for real
            // parents when the null revision is read as revno 0.
            self.step_to_latest_branch(0)?;
            let branch_count = self
                .revno_to_branch_count
                .get(&0)
                .map(|count| count + 1)
                .unwrap_or(0);
            self.revno_to_branch_count.insert(0, branch_count);
            if branch_count == 0 {
                self.branch_to_child_count.insert(BranchKey::Mainline, 1);
                RevnoVec::from(1)
            } else {
                RevnoVec::from(vec![0, branch_count, 1])
            }
        };
        let end_of_merge = match self.scheduled.last() {
            None => {
                // The oldest scheduled revision closes its group unless it
                // continues the mainline into imported history.
                !(node.left_parent.is_some() && node.merge_depth == 0)
            }
            Some(prev_node) => {
                if prev_node.merge_depth < node.merge_depth {
                    true
                } else if prev_node.merge_depth == node.merge_depth {
                    let node_parents = self.parents.get_parents(self.conn, node.db_id)?;
                    // same depth but not our parent: a sibling merge
                    !node_parents.contains(&prev_node.db_id)
                } else {
                    false
                }
            }
        };
        self.known_dotted.insert(revno.clone());
        self.imported_dotted_revno.insert(
            node.db_id,
            DottedInfo {
                revno: revno.clone(),
                end_of_merge,
                merge_depth: node.merge_depth,
            },
        );
        self.scheduled.push(ScheduledNode {
            db_id: node.db_id,
            merge_depth: node.merge_depth,
            revno,
            end_of_merge,
        });
        Ok(())
    }

    fn compute_merge_sort(&mut self) -> Result<()> {
        self.depth_first_stack.clear();
        self.scheduled.clear();
        self.seen_parents.clear();
        if self.mainline_db_ids.is_empty() {
            return Ok(());
        }
        self.push_node(self.mainline_db_ids[0], 0)?;
        while !self.depth_first_stack.is_empty() {
            let mut action = None;
            {
                let top = self.depth_first_stack.last_mut().unwrap();
                while top.left_pending_parent.is_some() || !top.pending_parents.is_empty() {
                    let next_db_id = match top.left_pending_parent.take() {
                        Some(parent) => parent,
                        None => top.pending_parents.pop().unwrap(),
                    };
                    if self.imported_dotted_revno.contains_key(&next_db_id) {
                        continue;
                    }
                    let next_merge_depth = if Some(next_db_id) == top.left_parent {
                        top.merge_depth
                    } else {
                        top.merge_depth + 1
                    };
                    action = Some((next_db_id, next_merge_depth));
                    break;
                }
            }
            match action {
                Some((next_db_id, next_merge_depth)) => {
                    self.push_node(next_db_id, next_merge_depth)?;
                }
                None => self.pop_node()?,
            }
        }
        Ok(())
    }
}
