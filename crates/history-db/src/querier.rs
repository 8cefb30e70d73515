//! The read path of the index.
//!
//! Every query walks the mainline from the branch tip, jumping whole ranges
//! at a time where the range cache covers it and falling back to one
//! left-hand parent per step where it does not. Before reading, the querier
//! makes sure the branch tip has been imported, delegating to [`Importer`]
//! under the optional writer lock when it has not.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use lru::LruCache;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use history_graph::RevnoVec;

use crate::importer::is_imported;
use crate::ranges::MainlineRangeCache;
use crate::sql::{n_params, MAX_IN_PARAMS};
use crate::{
    schema, DbId, Error, ImportOptions, Importer, Repository, Result, RevisionId,
};

/// Bounded cache of `revision_id -> db_id` lookups.
const DB_ID_CACHE_LEN: usize = 10_000;

#[derive(Debug, Default, Clone)]
pub struct QueryStats {
    /// Mainline positions visited across all queries, range jumps counted
    /// as one.
    pub mainline_steps: u64,
}

/// Read-only access to an index, bound to one branch tip.
pub struct Querier<'r> {
    conn: Connection,
    /// The path the caller asked for; imports resolve it the same way the
    /// querier's own connection did.
    db_path: PathBuf,
    repo: &'r dyn Repository,
    options: ImportOptions,
    writer_lock: Option<Arc<Mutex<()>>>,
    branch_tip: RevisionId,
    branch_tip_db_id: Option<DbId>,
    tip_is_imported: bool,
    db_id_cache: LruCache<RevisionId, DbId>,
    ranges: MainlineRangeCache,
    stats: QueryStats,
}

impl<'r> Querier<'r> {
    pub fn open(
        db_path: &Path,
        repo: &'r dyn Repository,
        options: ImportOptions,
    ) -> Result<Querier<'r>> {
        options.check()?;
        let (conn, _actual_path) = schema::ensure(db_path)?;
        let branch_tip = repo.tip_revision_id()?;
        let ranges = MainlineRangeCache::new(options.mainline_range_len);
        let mut querier = Querier {
            conn,
            db_path: db_path.to_path_buf(),
            repo,
            options,
            writer_lock: None,
            branch_tip,
            branch_tip_db_id: None,
            tip_is_imported: false,
            db_id_cache: LruCache::new(NonZeroUsize::new(DB_ID_CACHE_LEN).unwrap()),
            ranges,
            stats: QueryStats::default(),
        };
        querier.branch_tip_db_id = querier.get_db_id(&querier.branch_tip.clone())?;
        Ok(querier)
    }

    /// Serialize the reader-to-writer transition against other queriers
    /// sharing the lock. Without one, concurrent imports still converge but
    /// may duplicate work.
    pub fn set_writer_lock(&mut self, lock: Arc<Mutex<()>>) {
        self.writer_lock = Some(lock);
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    /// Import the branch tip if the index does not cover it yet.
    pub fn ensure_branch_tip(&mut self) -> Result<()> {
        if self.branch_tip.is_null() || self.tip_is_imported {
            return Ok(());
        }
        if let Some(db_id) = self.branch_tip_db_id {
            if is_imported(&self.conn, db_id)? {
                self.tip_is_imported = true;
                return Ok(());
            }
        }
        self.import_tip()
    }

    fn import_tip(&mut self) -> Result<()> {
        let guard = self.writer_lock.as_ref().map(|lock| {
            // a poisoned lock only means another writer panicked; the
            // database transaction already rolled its work back
            lock.lock().unwrap_or_else(|poison| poison.into_inner())
        });
        let mut importer = Importer::open(&self.db_path, self.options.clone())?;
        let outcome = importer.import_tip(self.repo, Some(self.branch_tip.clone()))?;
        drop(guard);
        debug!("on-the-fly import of {}: {:?}", self.branch_tip, outcome);
        self.branch_tip_db_id = self.get_db_id(&self.branch_tip.clone())?;
        self.tip_is_imported = true;
        Ok(())
    }

    fn get_db_id(&mut self, rev_id: &RevisionId) -> Result<Option<DbId>> {
        if let Some(db_id) = self.db_id_cache.get(rev_id) {
            return Ok(Some(*db_id));
        }
        let db_id: Option<DbId> = self
            .conn
            .query_row(
                "SELECT db_id FROM revision WHERE revision_id = ?",
                [rev_id.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(db_id) = db_id {
            self.db_id_cache.put(rev_id.clone(), db_id);
        }
        Ok(db_id)
    }

    /// Dotted revnos of the given revisions as seen from the branch tip.
    /// Revisions the index does not know are omitted.
    pub fn get_dotted_revnos(
        &mut self,
        revision_ids: &[RevisionId],
    ) -> Result<HashMap<RevisionId, RevnoVec>> {
        self.ensure_branch_tip()?;
        let tip_db_id = match self.branch_tip_db_id {
            Some(db_id) => db_id,
            None => return Ok(HashMap::new()),
        };
        let mut db_ids: HashSet<DbId> = HashSet::new();
        let mut db_id_to_rev_id: HashMap<DbId, RevisionId> = HashMap::new();
        for rev_id in revision_ids {
            if let Some(db_id) = self.get_db_id(rev_id)? {
                db_ids.insert(db_id);
                db_id_to_rev_id.insert(db_id, rev_id.clone());
            }
        }
        let mut revnos = HashMap::new();
        let mut steps = 0;
        let tx = self.conn.unchecked_transaction()?;
        let mut cur = Some(tip_db_id);
        while let Some(tip) = cur {
            if db_ids.is_empty() {
                break;
            }
            steps += 1;
            let (range_key, next) = range_key_and_tail(&tx, &self.ranges, tip)?;
            let wanted: Vec<DbId> = db_ids.iter().copied().collect();
            for chunk in wanted.chunks(MAX_IN_PARAMS) {
                let rows: Vec<(DbId, String)> = match range_key {
                    None => {
                        let sql = format!(
                            "SELECT merged_revision, revno FROM dotted_revno
                              WHERE tip_revision = ? AND merged_revision IN ({})",
                            n_params(chunk.len())
                        );
                        let mut stmt = tx.prepare(&sql)?;
                        let params = std::iter::once(tip).chain(chunk.iter().copied());
                        let result = stmt
                            .query_map(params_from_iter(params), |row| {
                                Ok((row.get(0)?, row.get(1)?))
                            })?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                    Some(range_key) => {
                        let sql = format!(
                            "SELECT merged_revision, revno
                               FROM dotted_revno, mainline_parent
                              WHERE tip_revision = mainline_parent.revision
                                AND mainline_parent.range_key = ?
                                AND merged_revision IN ({})",
                            n_params(chunk.len())
                        );
                        let mut stmt = tx.prepare(&sql)?;
                        let params = std::iter::once(range_key).chain(chunk.iter().copied());
                        let result = stmt
                            .query_map(params_from_iter(params), |row| {
                                Ok((row.get(0)?, row.get(1)?))
                            })?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                };
                for (db_id, revno_str) in rows {
                    db_ids.remove(&db_id);
                    let revno = parse_revno(&revno_str, db_id)?;
                    revnos.insert(db_id_to_rev_id[&db_id].clone(), revno);
                }
            }
            cur = next;
        }
        tx.commit()?;
        self.stats.mainline_steps += steps;
        Ok(revnos)
    }

    /// Map dotted revnos back to revision ids. Numbers not present under
    /// this tip are omitted.
    pub fn get_revision_ids(
        &mut self,
        revnos: &[RevnoVec],
    ) -> Result<HashMap<RevnoVec, RevisionId>> {
        self.ensure_branch_tip()?;
        let tip_db_id = match self.branch_tip_db_id {
            Some(db_id) => db_id,
            None => return Ok(HashMap::new()),
        };
        let mut revno_strs: HashSet<String> = revnos.iter().map(|r| r.to_string()).collect();
        let mut revno_map = HashMap::new();
        let mut steps = 0;
        let tx = self.conn.unchecked_transaction()?;
        let mut cur = Some(tip_db_id);
        while let Some(tip) = cur {
            if revno_strs.is_empty() {
                break;
            }
            steps += 1;
            let (range_key, next) = range_key_and_tail(&tx, &self.ranges, tip)?;
            let wanted: Vec<String> = revno_strs.iter().cloned().collect();
            for chunk in wanted.chunks(MAX_IN_PARAMS) {
                let rows: Vec<(Vec<u8>, String)> = match range_key {
                    None => {
                        let sql = format!(
                            "SELECT revision_id, revno FROM dotted_revno, revision
                              WHERE merged_revision = revision.db_id
                                AND tip_revision = ?
                                AND revno IN ({})",
                            n_params(chunk.len())
                        );
                        let mut stmt = tx.prepare(&sql)?;
                        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&tip];
                        params.extend(chunk.iter().map(|s| s as &dyn rusqlite::ToSql));
                        let result = stmt
                            .query_map(&params[..], |row| Ok((row.get(0)?, row.get(1)?)))?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                    Some(range_key) => {
                        let sql = format!(
                            "SELECT revision_id, revno
                               FROM dotted_revno, mainline_parent, revision
                              WHERE tip_revision = mainline_parent.revision
                                AND merged_revision = revision.db_id
                                AND mainline_parent.range_key = ?
                                AND revno IN ({})",
                            n_params(chunk.len())
                        );
                        let mut stmt = tx.prepare(&sql)?;
                        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&range_key];
                        params.extend(chunk.iter().map(|s| s as &dyn rusqlite::ToSql));
                        let result = stmt
                            .query_map(&params[..], |row| Ok((row.get(0)?, row.get(1)?)))?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                };
                for (rev_bytes, revno_str) in rows {
                    revno_strs.remove(&revno_str);
                    let revno: RevnoVec = revno_str
                        .parse()
                        .map_err(|_| Error::CorruptIndex(format!("bad revno {:?}", revno_str)))?;
                    revno_map.insert(revno, RevisionId::from(rev_bytes));
                }
            }
            cur = next;
        }
        tx.commit()?;
        self.stats.mainline_steps += steps;
        Ok(revno_map)
    }

    /// For each revision, the mainline revision that merged it (as seen
    /// from the branch tip). Unknown revisions are omitted.
    pub fn get_mainline_where_merged(
        &mut self,
        revision_ids: &[RevisionId],
    ) -> Result<HashMap<RevisionId, RevisionId>> {
        self.ensure_branch_tip()?;
        let tip_db_id = match self.branch_tip_db_id {
            Some(db_id) => db_id,
            None => return Ok(HashMap::new()),
        };
        let mut db_ids: HashSet<DbId> = HashSet::new();
        let mut db_id_to_rev_id: HashMap<DbId, RevisionId> = HashMap::new();
        for rev_id in revision_ids {
            if let Some(db_id) = self.get_db_id(rev_id)? {
                db_ids.insert(db_id);
                db_id_to_rev_id.insert(db_id, rev_id.clone());
            }
        }
        let mut merged_in = HashMap::new();
        let mut steps = 0;
        let tx = self.conn.unchecked_transaction()?;
        let mut cur = Some(tip_db_id);
        while let Some(tip) = cur {
            if db_ids.is_empty() {
                break;
            }
            steps += 1;
            let (range_key, next) = range_key_and_tail(&tx, &self.ranges, tip)?;
            let wanted: Vec<DbId> = db_ids.iter().copied().collect();
            for chunk in wanted.chunks(MAX_IN_PARAMS) {
                let rows: Vec<(Vec<u8>, DbId)> = match range_key {
                    None => {
                        let sql = format!(
                            "SELECT revision_id, merged_revision
                               FROM dotted_revno, revision
                              WHERE tip_revision = ?
                                AND tip_revision = revision.db_id
                                AND merged_revision IN ({})",
                            n_params(chunk.len())
                        );
                        let mut stmt = tx.prepare(&sql)?;
                        let params = std::iter::once(tip).chain(chunk.iter().copied());
                        let result = stmt
                            .query_map(params_from_iter(params), |row| {
                                Ok((row.get(0)?, row.get(1)?))
                            })?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                    Some(range_key) => {
                        let sql = format!(
                            "SELECT revision_id, merged_revision
                               FROM dotted_revno, mainline_parent, revision
                              WHERE tip_revision = mainline_parent.revision
                                AND tip_revision = revision.db_id
                                AND mainline_parent.range_key = ?
                                AND merged_revision IN ({})",
                            n_params(chunk.len())
                        );
                        let mut stmt = tx.prepare(&sql)?;
                        let params = std::iter::once(range_key).chain(chunk.iter().copied());
                        let result = stmt
                            .query_map(params_from_iter(params), |row| {
                                Ok((row.get(0)?, row.get(1)?))
                            })?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                };
                for (mainline_rev_bytes, merged_db_id) in rows {
                    db_ids.remove(&merged_db_id);
                    merged_in.insert(
                        db_id_to_rev_id[&merged_db_id].clone(),
                        RevisionId::from(mainline_rev_bytes),
                    );
                }
            }
            cur = next;
        }
        tx.commit()?;
        self.stats.mainline_steps += steps;
        Ok(merged_in)
    }

    /// The whole mainline, tip first.
    pub fn walk_mainline(&mut self) -> Result<Vec<RevisionId>> {
        self.ensure_branch_tip()?;
        let mut db_ids: Vec<DbId> = Vec::new();
        let mut steps = 0;
        {
            let tx = self.conn.unchecked_transaction()?;
            let mut cur = self.branch_tip_db_id;
            while let Some(db_id) = cur {
                steps += 1;
                match self.ranges.range_for_head(&tx, db_id)? {
                    None => {
                        db_ids.push(db_id);
                        cur = lh_parent(&tx, db_id)?;
                    }
                    Some(range) => {
                        db_ids.extend(self.ranges.members(&tx, range.range_key)?);
                        cur = range.tail;
                    }
                }
            }
            tx.commit()?;
        }
        self.stats.mainline_steps += steps;
        let names = self.revision_ids_for(&db_ids)?;
        db_ids
            .iter()
            .map(|db_id| {
                names
                    .get(db_id)
                    .cloned()
                    .ok_or_else(|| Error::NotFoundDbId(*db_id))
            })
            .collect()
    }

    /// Every revision reachable from the branch tip.
    pub fn walk_ancestry(&mut self) -> Result<HashSet<RevisionId>> {
        self.ensure_branch_tip()?;
        let mut merged: HashSet<DbId> = HashSet::new();
        let mut steps = 0;
        {
            let tx = self.conn.unchecked_transaction()?;
            let mut cur = self.branch_tip_db_id;
            while let Some(db_id) = cur {
                steps += 1;
                let (range_key, next) = range_key_and_tail(&tx, &self.ranges, db_id)?;
                let rows: Vec<DbId> = match range_key {
                    None => {
                        let mut stmt = tx.prepare_cached(
                            "SELECT merged_revision FROM dotted_revno WHERE tip_revision = ?",
                        )?;
                        let result = stmt
                            .query_map([db_id], |row| row.get(0))?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                    Some(range_key) => {
                        let mut stmt = tx.prepare_cached(
                            "SELECT merged_revision FROM dotted_revno, mainline_parent
                              WHERE tip_revision = mainline_parent.revision
                                AND mainline_parent.range_key = ?",
                        )?;
                        let result = stmt
                            .query_map([range_key], |row| row.get(0))?
                            .collect::<std::result::Result<_, _>>()?;
                        result
                    }
                };
                merged.extend(rows);
                cur = next;
            }
            tx.commit()?;
        }
        self.stats.mainline_steps += steps;
        let db_ids: Vec<DbId> = merged.into_iter().collect();
        let names = self.revision_ids_for(&db_ids)?;
        Ok(names.into_values().collect())
    }

    /// Stream merge-sorted rows from `start` (inclusive, default the branch
    /// tip) to `stop` (exclusive, default the start of history).
    pub fn iter_merge_sorted_revisions(
        &mut self,
        start_revision_id: Option<&RevisionId>,
        stop_revision_id: Option<&RevisionId>,
    ) -> Result<MergeSortedCursor<'_>> {
        self.ensure_branch_tip()?;
        let tip_db_id = match self.branch_tip_db_id {
            Some(db_id) => db_id,
            None => return Ok(MergeSortedCursor::empty(&self.conn, self.ranges)),
        };
        let start_db_id = match start_revision_id {
            None => None,
            Some(rev_id) => Some(
                self.get_db_id(rev_id)?
                    .ok_or_else(|| Error::NotFound(rev_id.clone()))?,
            ),
        };
        let stop_db_id = match stop_revision_id {
            None => None,
            Some(rev_id) => Some(
                self.get_db_id(rev_id)?
                    .ok_or_else(|| Error::NotFound(rev_id.clone()))?,
            ),
        };
        let mut steps = 0;
        let containing_tip = match start_db_id {
            None => Some(tip_db_id),
            Some(start) => {
                find_tip_containing(&self.conn, &self.ranges, tip_db_id, start, &mut steps)?
            }
        };
        self.stats.mainline_steps += steps;
        let found_start = match (start_db_id, containing_tip) {
            (None, _) => true,
            (Some(start), Some(tip)) => start == tip,
            (Some(_), None) => false,
        };
        Ok(MergeSortedCursor {
            conn: &self.conn,
            ranges: self.ranges,
            tip: containing_tip,
            start: start_db_id,
            stop: stop_db_id,
            found_start,
            buffered: VecDeque::new(),
            finished: containing_tip.is_none(),
        })
    }

    /// The left-hand parent recorded for a revision, if any.
    pub fn get_lh_parent_rev_id(&mut self, revision_id: &RevisionId) -> Result<Option<RevisionId>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT p.revision_id
                   FROM parent, revision AS c, revision AS p
                  WHERE parent.child = c.db_id
                    AND parent.parent = p.db_id
                    AND c.revision_id = ?
                    AND parent_idx = 0",
                [revision_id.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.map(RevisionId::from))
    }

    /// All children the index records for a revision, across every import.
    pub fn get_children(&mut self, revision_id: &RevisionId) -> Result<Vec<RevisionId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT c.revision_id
               FROM revision AS p, parent, revision AS c
              WHERE parent.child = c.db_id
                AND parent.parent = p.db_id
                AND p.revision_id = ?",
        )?;
        let rows = stmt
            .query_map([revision_id.as_bytes()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(RevisionId::from).collect())
    }

    fn revision_ids_for(&self, db_ids: &[DbId]) -> Result<HashMap<DbId, RevisionId>> {
        let mut names = HashMap::with_capacity(db_ids.len());
        for chunk in db_ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT db_id, revision_id FROM revision WHERE db_id IN ({})",
                n_params(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, DbId>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (db_id, bytes) = row?;
                names.insert(db_id, RevisionId::from(bytes));
            }
        }
        Ok(names)
    }
}

/// One streamed row of the merge-sorted ancestry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSortedRow {
    pub revision_id: RevisionId,
    pub merge_depth: usize,
    pub revno: RevnoVec,
    pub end_of_merge: bool,
}

struct RawRow {
    db_id: DbId,
    revision_id: Vec<u8>,
    merge_depth: usize,
    revno: RevnoVec,
    end_of_merge: bool,
}

/// Pull-style cursor over merge-sorted rows; also an [`Iterator`].
/// Dropping it releases the underlying statements.
pub struct MergeSortedCursor<'q> {
    conn: &'q Connection,
    ranges: MainlineRangeCache,
    tip: Option<DbId>,
    start: Option<DbId>,
    stop: Option<DbId>,
    found_start: bool,
    buffered: VecDeque<RawRow>,
    finished: bool,
}

impl<'q> MergeSortedCursor<'q> {
    fn empty(conn: &'q Connection, ranges: MainlineRangeCache) -> Self {
        MergeSortedCursor {
            conn,
            ranges,
            tip: None,
            start: None,
            stop: None,
            found_start: true,
            buffered: VecDeque::new(),
            finished: true,
        }
    }

    /// The next merge-sorted row, or `None` past the stop revision or the
    /// start of history.
    pub fn next_row(&mut self) -> Result<Option<MergeSortedRow>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if let Some(row) = self.buffered.pop_front() {
                if !self.found_start {
                    if Some(row.db_id) == self.start {
                        self.found_start = true;
                    } else {
                        continue;
                    }
                }
                if Some(row.db_id) == self.stop {
                    self.finished = true;
                    return Ok(None);
                }
                return Ok(Some(MergeSortedRow {
                    revision_id: RevisionId::from(row.revision_id),
                    merge_depth: row.merge_depth,
                    revno: row.revno,
                    end_of_merge: row.end_of_merge,
                }));
            }
            let tip = match self.tip {
                None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(tip) => tip,
            };
            let (range_key, next) = range_key_and_tail(self.conn, &self.ranges, tip)?;
            let rows: Vec<RawRow> = match range_key {
                None => {
                    let mut stmt = self.conn.prepare_cached(
                        "SELECT db_id, revision_id, merge_depth, revno, end_of_merge
                           FROM dotted_revno, revision
                          WHERE tip_revision = ? AND db_id = merged_revision
                          ORDER BY dist",
                    )?;
                    let mapped = stmt.query_map([tip], map_raw_row)?;
                    collect_raw_rows(mapped)?
                }
                Some(range_key) => {
                    let mut stmt = self.conn.prepare_cached(
                        "SELECT db_id, revision_id, merge_depth, revno, end_of_merge
                           FROM dotted_revno, revision, mainline_parent
                          WHERE tip_revision = mainline_parent.revision
                            AND mainline_parent.range_key = ?
                            AND db_id = merged_revision
                          ORDER BY mainline_parent.dist, dotted_revno.dist",
                    )?;
                    let mapped = stmt.query_map([range_key], map_raw_row)?;
                    collect_raw_rows(mapped)?
                }
            };
            self.buffered.extend(rows);
            self.tip = next;
        }
    }
}

type RawRowFields = (DbId, Vec<u8>, i64, String, bool);

fn map_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRowFields> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn collect_raw_rows<F>(mapped: rusqlite::MappedRows<'_, F>) -> Result<Vec<RawRow>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<RawRowFields>,
{
    let mut rows = Vec::new();
    for row in mapped {
        let (db_id, revision_id, merge_depth, revno_str, end_of_merge) = row?;
        rows.push(RawRow {
            db_id,
            revision_id,
            merge_depth: merge_depth as usize,
            revno: parse_revno(&revno_str, db_id)?,
            end_of_merge,
        });
    }
    Ok(rows)
}

impl Iterator for MergeSortedCursor<'_> {
    type Item = Result<MergeSortedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

fn parse_revno(revno_str: &str, db_id: DbId) -> Result<RevnoVec> {
    revno_str.parse().map_err(|_| {
        Error::CorruptIndex(format!(
            "unparseable revno {:?} for revision {}",
            revno_str, db_id
        ))
    })
}

fn lh_parent(conn: &Connection, db_id: DbId) -> Result<Option<DbId>> {
    Ok(conn
        .query_row(
            "SELECT parent FROM parent WHERE child = ? AND parent_idx = 0",
            [db_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// The best range at `tip`, or the plain left-hand parent when no range
/// covers it.
fn range_key_and_tail(
    conn: &Connection,
    ranges: &MainlineRangeCache,
    tip: DbId,
) -> Result<(Option<i64>, Option<DbId>)> {
    match ranges.range_for_head(conn, tip)? {
        None => Ok((None, lh_parent(conn, tip)?)),
        Some(range) => Ok((Some(range.range_key), range.tail)),
    }
}

/// Walk tips from `tip_db_id` until one whose group (or range of groups)
/// contains `merged_db_id`.
fn find_tip_containing(
    conn: &Connection,
    ranges: &MainlineRangeCache,
    tip_db_id: DbId,
    merged_db_id: DbId,
    steps: &mut u64,
) -> Result<Option<DbId>> {
    let mut cur = Some(tip_db_id);
    while let Some(tip) = cur {
        if tip == merged_db_id {
            return Ok(Some(tip));
        }
        *steps += 1;
        let (range_key, next) = range_key_and_tail(conn, ranges, tip)?;
        let present = match range_key {
            None => conn
                .query_row(
                    "SELECT 1 FROM dotted_revno
                      WHERE tip_revision = ? AND merged_revision = ?",
                    [tip, merged_db_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some(),
            Some(range_key) => conn
                .query_row(
                    "SELECT 1 FROM dotted_revno, mainline_parent
                      WHERE tip_revision = mainline_parent.revision
                        AND mainline_parent.range_key = ?
                        AND merged_revision = ?
                      LIMIT 1",
                    [range_key, merged_db_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some(),
        };
        if present {
            return Ok(Some(tip));
        }
        cur = next;
    }
    Ok(None)
}
