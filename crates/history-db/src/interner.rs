//! Mapping between external revision ids and dense database ids.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};

use crate::{DbId, Error, Result, RevisionId};

/// Write-through bidirectional map from revision ids to `db_id`s.
///
/// The in-memory maps belong to one importer or querier run; the `revision`
/// table is the durable side. Ids are allocated in order of first sight and
/// mean nothing beyond joining tables.
pub struct RevisionInterner {
    rev_to_db: HashMap<RevisionId, DbId>,
    db_to_rev: HashMap<DbId, RevisionId>,
}

impl RevisionInterner {
    pub fn new() -> Self {
        RevisionInterner {
            rev_to_db: HashMap::new(),
            db_to_rev: HashMap::new(),
        }
    }

    /// The db_id for `rev_id`, allocating one on first sight. Idempotent.
    pub fn intern(&mut self, conn: &Connection, rev_id: &RevisionId) -> Result<DbId> {
        if let Some(db_id) = self.rev_to_db.get(rev_id) {
            return Ok(*db_id);
        }
        let db_id = match self.query_db_id(conn, rev_id)? {
            Some(db_id) => db_id,
            None => {
                conn.execute(
                    "INSERT INTO revision (revision_id, gdfo) VALUES (?, 0)",
                    [rev_id.as_bytes()],
                )?;
                conn.last_insert_rowid()
            }
        };
        self.remember(rev_id.clone(), db_id);
        Ok(db_id)
    }

    /// The db_id for `rev_id` if it is recorded; never allocates.
    pub fn lookup_db_id(&mut self, conn: &Connection, rev_id: &RevisionId) -> Result<Option<DbId>> {
        if let Some(db_id) = self.rev_to_db.get(rev_id) {
            return Ok(Some(*db_id));
        }
        let db_id = self.query_db_id(conn, rev_id)?;
        if let Some(db_id) = db_id {
            self.remember(rev_id.clone(), db_id);
        }
        Ok(db_id)
    }

    /// The revision id behind `db_id`; `NotFoundDbId` when absent.
    pub fn lookup_rev(&mut self, conn: &Connection, db_id: DbId) -> Result<RevisionId> {
        if let Some(rev_id) = self.db_to_rev.get(&db_id) {
            return Ok(rev_id.clone());
        }
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT revision_id FROM revision WHERE db_id = ?",
                [db_id],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => {
                let rev_id = RevisionId::from(bytes);
                self.remember(rev_id.clone(), db_id);
                Ok(rev_id)
            }
            None => Err(Error::NotFoundDbId(db_id)),
        }
    }

    pub fn set_gdfo(&self, conn: &Connection, db_id: DbId, gdfo: i64) -> Result<()> {
        conn.execute(
            "UPDATE revision SET gdfo = ? WHERE db_id = ?",
            [gdfo, db_id],
        )?;
        Ok(())
    }

    pub fn mark_ghost(&self, conn: &Connection, db_id: DbId) -> Result<()> {
        conn.execute("INSERT OR IGNORE INTO ghost (db_id) VALUES (?)", [db_id])?;
        Ok(())
    }

    fn query_db_id(&self, conn: &Connection, rev_id: &RevisionId) -> Result<Option<DbId>> {
        Ok(conn
            .query_row(
                "SELECT db_id FROM revision WHERE revision_id = ?",
                [rev_id.as_bytes()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn remember(&mut self, rev_id: RevisionId, db_id: DbId) {
        self.rev_to_db.insert(rev_id.clone(), db_id);
        self.db_to_rev.insert(db_id, rev_id);
    }
}

impl Default for RevisionInterner {
    fn default() -> Self {
        Self::new()
    }
}
