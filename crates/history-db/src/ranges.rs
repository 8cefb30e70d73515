//! Packed runs of left-hand-mainline ancestors.
//!
//! Walking a mainline one left-hand parent at a time costs one query per
//! revision. Ranges pack runs of up to `max_len` mainline revisions so a
//! walk jumps from a range head straight to its tail. Ranges are append
//! only: extending the mainline inserts new ranges, absorbing at most the
//! one sub-maximal range at the old head, so any chain holds at most one
//! range shorter than `max_len`.

use log::debug;
use rusqlite::{Connection, OptionalExtension};

use crate::parents::ParentStore;
use crate::{DbId, Result};

pub const DEFAULT_RANGE_LEN: usize = 100;

/// A range row: its key, member count and the revision just older than the
/// oldest member (`None` at the start of history).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeInfo {
    pub range_key: i64,
    pub count: usize,
    pub tail: Option<DbId>,
}

#[derive(Debug, Clone, Copy)]
pub struct MainlineRangeCache {
    max_len: usize,
}

impl MainlineRangeCache {
    /// Panics if `max_len < 2`; ranges that short cannot converge. The
    /// importer and querier validate their options before getting here.
    pub fn new(max_len: usize) -> Self {
        assert!(max_len >= 2, "ranges of length < 2 cannot converge");
        MainlineRangeCache { max_len }
    }

    /// The best (longest) range whose head is `head`.
    pub fn range_for_head(&self, conn: &Connection, head: DbId) -> Result<Option<RangeInfo>> {
        let res = conn
            .query_row(
                "SELECT pkey, count, tail FROM mainline_parent_range
                  WHERE head = ? ORDER BY count DESC LIMIT 1",
                [head],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<DbId>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(res.map(|(range_key, count, tail)| RangeInfo {
            range_key,
            count: count as usize,
            tail,
        }))
    }

    /// Members of a range ordered newest first (`dist` ascending).
    pub fn members(&self, conn: &Connection, range_key: i64) -> Result<Vec<DbId>> {
        let mut stmt = conn.prepare_cached(
            "SELECT revision FROM mainline_parent WHERE range_key = ? ORDER BY dist ASC",
        )?;
        let members = stmt
            .query_map([range_key], |row| row.get(0))?
            .collect::<std::result::Result<Vec<DbId>, _>>()?;
        Ok(members)
    }

    /// Extend the range cover so the mainline from `head` can be walked in
    /// `ceil(chain_len / max_len)` jumps.
    ///
    /// Walks left-hand parents from `head` until a revision that already
    /// heads a range. A sub-maximal range there is absorbed into the
    /// collection; then the collection is chunked from the oldest end into
    /// blocks of up to `max_len`, each inserted with its tail pointing at
    /// the next older revision.
    pub fn extend(
        &self,
        conn: &Connection,
        parents: &mut ParentStore,
        head: DbId,
    ) -> Result<()> {
        let mut collected: Vec<DbId> = Vec::new(); // newest first
        let mut cur = Some(head);
        while let Some(db_id) = cur {
            match self.range_for_head(conn, db_id)? {
                Some(range) => {
                    if !collected.is_empty() && range.count < self.max_len {
                        collected.extend(self.members(conn, range.range_key)?);
                        cur = range.tail;
                    }
                    break;
                }
                None => {
                    collected.push(db_id);
                    cur = parents.get_lh_parent(conn, db_id)?;
                }
            }
        }
        let mut inserted = 0;
        let mut tail = cur;
        while !collected.is_empty() {
            let split = collected.len().saturating_sub(self.max_len);
            let block = collected.split_off(split); // oldest block, newest first
            self.insert_range(conn, &block, tail)?;
            inserted += 1;
            tail = Some(block[0]);
        }
        if inserted > 0 {
            debug!("inserted {} mainline ranges below {}", inserted, head);
        }
        Ok(())
    }

    fn insert_range(
        &self,
        conn: &Connection,
        members: &[DbId],
        tail: Option<DbId>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO mainline_parent_range (head, tail, count) VALUES (?, ?, ?)",
            rusqlite::params![members[0], tail, members.len() as i64],
        )?;
        let range_key = conn.last_insert_rowid();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO mainline_parent (range_key, revision, dist) VALUES (?, ?, ?)",
        )?;
        for (dist, db_id) in members.iter().enumerate() {
            stmt.execute(rusqlite::params![range_key, db_id, dist as i64])?;
        }
        Ok(())
    }
}

impl Default for MainlineRangeCache {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE_LEN)
    }
}
