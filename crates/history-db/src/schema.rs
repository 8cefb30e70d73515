//! On-disk layout of the index and database bootstrap.
//!
//! The whole index lives in one SQLite file. `ensure` opens it, creates the
//! tables on first use, and redirects to a fresh sibling file when the
//! persisted schema version is not the one this code speaks; the old file
//! is never touched.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

pub const SCHEMA_VERSION: i32 = 1;

const CREATE_STATEMENTS: &str = "
    CREATE TABLE meta (
        schema_version INTEGER NOT NULL
    );

    CREATE TABLE revision (
        db_id INTEGER PRIMARY KEY AUTOINCREMENT,
        revision_id BLOB NOT NULL,
        gdfo INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX revision_revision_id_index
        ON revision (revision_id);

    -- Revisions named as a parent somewhere but whose content is unknown.
    CREATE TABLE ghost (
        db_id INTEGER PRIMARY KEY REFERENCES revision (db_id)
    );

    -- Ordered parent edges; parent_idx 0 is the left-hand parent.
    CREATE TABLE parent (
        child INTEGER NOT NULL REFERENCES revision (db_id),
        parent INTEGER NOT NULL REFERENCES revision (db_id),
        parent_idx INTEGER NOT NULL,
        CONSTRAINT parent_child_unique UNIQUE (child, parent_idx)
    );
    CREATE INDEX parent_parent_index ON parent (parent);

    -- The numbering, grouped by the mainline revision that merged each
    -- node. dist 0 is the mainline revision itself.
    CREATE TABLE dotted_revno (
        tip_revision INTEGER NOT NULL REFERENCES revision (db_id),
        merged_revision INTEGER NOT NULL REFERENCES revision (db_id),
        revno TEXT NOT NULL,
        end_of_merge BOOL NOT NULL,
        merge_depth INTEGER NOT NULL,
        dist INTEGER NOT NULL,
        CONSTRAINT dotted_revno_key UNIQUE (tip_revision, merged_revision)
    );
    CREATE INDEX dotted_revno_tip_index ON dotted_revno (tip_revision);

    -- Contiguous runs of left-hand-parent ancestors. tail is the revision
    -- just older than the oldest member and is not itself a member; NULL
    -- at the start of history.
    CREATE TABLE mainline_parent_range (
        pkey INTEGER PRIMARY KEY AUTOINCREMENT,
        head INTEGER NOT NULL REFERENCES revision (db_id),
        tail INTEGER REFERENCES revision (db_id),
        count INTEGER NOT NULL
    );
    CREATE INDEX mainline_parent_range_head_index
        ON mainline_parent_range (head);

    CREATE TABLE mainline_parent (
        range_key INTEGER NOT NULL REFERENCES mainline_parent_range (pkey),
        revision INTEGER NOT NULL REFERENCES revision (db_id),
        dist INTEGER NOT NULL,
        CONSTRAINT mainline_parent_range_dist_unique UNIQUE (range_key, dist)
    );
";

/// Create all tables and record the schema version.
pub fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_STATEMENTS)?;
    conn.execute(
        "INSERT INTO meta (schema_version) VALUES (?)",
        [SCHEMA_VERSION],
    )?;
    debug!("initialized history database, schema version {}", SCHEMA_VERSION);
    Ok(())
}

pub fn is_initialized(conn: &Connection) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// The persisted schema version. `SchemaMismatch` when the meta table exists
/// but carries no readable version.
pub fn version(conn: &Connection) -> Result<i32> {
    let version: Option<i32> = conn
        .query_row("SELECT schema_version FROM meta", [], |row| row.get(0))
        .optional()?;
    version.ok_or(Error::SchemaMismatch {
        found: 0,
        expected: SCHEMA_VERSION,
    })
}

/// The sibling file used when `db_path` carries a foreign schema version.
fn versioned_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(format!(".v{}", SCHEMA_VERSION));
    PathBuf::from(name)
}

/// Open the database at `db_path`, bootstrapping the schema if needed.
///
/// Returns the connection and the path actually used: `db_path` itself, or
/// the `.v<N>` sibling when the file at `db_path` holds a different schema
/// version.
pub fn ensure(db_path: &Path) -> Result<(Connection, PathBuf)> {
    let conn = Connection::open(db_path)?;
    if !is_initialized(&conn)? {
        create(&conn)?;
        return Ok((conn, db_path.to_path_buf()));
    }
    let found = version(&conn)?;
    if found == SCHEMA_VERSION {
        return Ok((conn, db_path.to_path_buf()));
    }
    let sibling = versioned_path(db_path);
    warn!(
        "{} has schema version {}, expected {}; using {} instead",
        db_path.display(),
        found,
        SCHEMA_VERSION,
        sibling.display()
    );
    let conn = Connection::open(&sibling)?;
    if !is_initialized(&conn)? {
        create(&conn)?;
        return Ok((conn, sibling));
    }
    let found = version(&conn)?;
    if found != SCHEMA_VERSION {
        return Err(Error::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        });
    }
    Ok((conn, sibling))
}

/// Size the SQLite page cache to roughly `bytes`.
pub fn apply_cache_size(conn: &Connection, bytes: u64) -> Result<()> {
    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
    let pages = (bytes / page_size.max(1) as u64).max(1);
    conn.pragma_update(None, "cache_size", pages as i64)?;
    Ok(())
}
