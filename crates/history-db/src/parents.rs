//! Ordered parent edges.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};

use crate::{DbId, Result};

/// Access to the `parent` table with a per-run cache of full parent lists.
///
/// Edges are written once and never mutated; `parent_idx` 0 is the left-hand
/// parent. Cycles cannot be expressed because gdfo strictly decreases along
/// every parent edge.
pub struct ParentStore {
    cache: HashMap<DbId, Vec<DbId>>,
}

impl ParentStore {
    pub fn new() -> Self {
        ParentStore {
            cache: HashMap::new(),
        }
    }

    /// Record the ordered parent list of one child. Already-present edges
    /// are left alone.
    pub fn set_parents(&mut self, conn: &Connection, child: DbId, parents: &[DbId]) -> Result<()> {
        if self.cache.contains_key(&child) {
            return Ok(());
        }
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO parent (child, parent, parent_idx) VALUES (?, ?, ?)",
        )?;
        for (idx, parent) in parents.iter().enumerate() {
            stmt.execute([child, *parent, idx as i64])?;
        }
        self.cache.insert(child, parents.to_vec());
        Ok(())
    }

    /// Record a whole parent map. Rows go in sorted by child id; insertion
    /// in key order keeps the uniqueness checks local.
    pub fn set_all(
        &mut self,
        conn: &Connection,
        parent_map: &HashMap<DbId, Vec<DbId>>,
    ) -> Result<()> {
        let mut data: Vec<(DbId, DbId, i64)> = Vec::new();
        for (child, parents) in parent_map.iter() {
            if self.cache.contains_key(child) {
                continue;
            }
            self.cache.insert(*child, parents.clone());
            for (idx, parent) in parents.iter().enumerate() {
                data.push((*child, *parent, idx as i64));
            }
        }
        data.sort_unstable();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO parent (child, parent, parent_idx) VALUES (?, ?, ?)",
        )?;
        for (child, parent, idx) in data {
            stmt.execute([child, parent, idx])?;
        }
        Ok(())
    }

    /// The ordered parents of `child`; empty for roots and ghosts.
    pub fn get_parents(&mut self, conn: &Connection, child: DbId) -> Result<Vec<DbId>> {
        if let Some(parents) = self.cache.get(&child) {
            return Ok(parents.clone());
        }
        let mut stmt = conn.prepare_cached(
            "SELECT parent FROM parent WHERE child = ? ORDER BY parent_idx",
        )?;
        let parents = stmt
            .query_map([child], |row| row.get(0))?
            .collect::<std::result::Result<Vec<DbId>, _>>()?;
        self.cache.insert(child, parents.clone());
        Ok(parents)
    }

    /// The left-hand parent of `child`, if it has one.
    pub fn get_lh_parent(&mut self, conn: &Connection, child: DbId) -> Result<Option<DbId>> {
        if let Some(parents) = self.cache.get(&child) {
            return Ok(parents.first().copied());
        }
        Ok(conn
            .query_row(
                "SELECT parent FROM parent WHERE child = ? AND parent_idx = 0",
                [child],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl Default for ParentStore {
    fn default() -> Self {
        Self::new()
    }
}
