//! Persistent merge-sort index for revision history.
//!
//! The index numbers every revision reachable from a branch tip with a
//! dotted revision number and stores the numbering in a single SQLite file,
//! keyed by the mainline revision that merged it. When the branch tip moves,
//! the numbering is extended incrementally: only the revisions that became
//! reachable are walked and numbered, and the result matches what a
//! from-scratch merge sort of the new ancestry would produce.
//!
//! [`Importer`] writes the index, [`Querier`] reads it. Revision data comes
//! from a [`Repository`] implementation supplied by the caller.

use std::collections::HashMap;

pub mod schema;

mod importer;
mod incremental;
mod interner;
mod parents;
mod querier;
mod ranges;
mod sql;

pub use importer::{ImportOptions, ImportStats, Importer, Outcome, Progress};
pub use interner::RevisionInterner;
pub use parents::ParentStore;
pub use querier::{MergeSortedCursor, MergeSortedRow, Querier, QueryStats};
pub use ranges::{MainlineRangeCache, RangeInfo};

/// Dense integer key for a revision inside the database. Only meaningful for
/// joins; allocation order carries no semantics.
pub type DbId = i64;

/// The revision id of the empty ancestry. Never stored in the index.
pub const NULL_REVISION: &[u8] = b"null:";

/// An opaque revision identifier: a non-empty byte string of at most 256
/// bytes, globally unique within a repository.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevisionId(Vec<u8>);

fn check_valid(id: &[u8]) {
    assert!(!id.is_empty(), "empty revision id");
    assert!(id.len() <= 256, "revision id longer than 256 bytes");
}

impl RevisionId {
    pub fn is_null(&self) -> bool {
        self.0 == NULL_REVISION
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<Vec<u8>> for RevisionId {
    fn from(v: Vec<u8>) -> Self {
        check_valid(&v);
        RevisionId(v)
    }
}

impl From<&[u8]> for RevisionId {
    fn from(v: &[u8]) -> Self {
        check_valid(v);
        RevisionId(v.to_vec())
    }
}

impl From<&str> for RevisionId {
    fn from(v: &str) -> Self {
        RevisionId::from(v.as_bytes())
    }
}

impl From<RevisionId> for Vec<u8> {
    fn from(v: RevisionId) -> Self {
        v.0
    }
}

#[derive(Debug)]
pub enum Error {
    /// A revision id the store was asked about is not recorded.
    NotFound(RevisionId),
    /// A database id the store was asked about is not recorded.
    NotFoundDbId(DbId),
    /// The persisted index contradicts itself: a missing expected row, a
    /// cycle, or a gdfo violation.
    CorruptIndex(String),
    /// The database carries a schema version this code does not speak.
    SchemaMismatch { found: i32, expected: i32 },
    /// An option value the index cannot operate with.
    Config(String),
    /// The repository supplying revision data failed.
    Repository(Box<dyn std::error::Error + Send + Sync>),
    Sqlite(rusqlite::Error),
    Graph(history_graph::Error<RevisionId>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound(rev_id) => write!(f, "revision {} not in the index", rev_id),
            Error::NotFoundDbId(db_id) => write!(f, "db_id {} not in the index", db_id),
            Error::CorruptIndex(msg) => write!(f, "corrupt index: {}", msg),
            Error::SchemaMismatch { found, expected } => write!(
                f,
                "schema version {} in the database, this code speaks {}",
                found, expected
            ),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Repository(err) => write!(f, "repository error: {}", err),
            Error::Sqlite(err) => write!(f, "database error: {}", err),
            Error::Graph(err) => write!(f, "graph error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sqlite(err) => Some(err),
            Error::Repository(err) => Some(err.as_ref()),
            Error::Graph(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err)
    }
}

impl From<history_graph::Error<RevisionId>> for Error {
    fn from(err: history_graph::Error<RevisionId>) -> Self {
        Error::Graph(err)
    }
}

/// The source of revision data: a branch tip and the parent relation.
///
/// `get_parent_map` returns an empty parent list for a parent-less root and
/// omits the key entirely for a ghost. Implementations may block on disk or
/// network.
pub trait Repository {
    fn tip_revision_id(&self) -> Result<RevisionId>;

    fn get_parent_map(
        &self,
        revision_ids: &[RevisionId],
    ) -> Result<HashMap<RevisionId, Vec<RevisionId>>>;
}

/// A [`Repository`] backed by an in-memory parent map.
pub struct MemoryRepository {
    tip: RevisionId,
    parents: HashMap<RevisionId, Vec<RevisionId>>,
}

impl MemoryRepository {
    pub fn new(tip: RevisionId, parents: HashMap<RevisionId, Vec<RevisionId>>) -> Self {
        MemoryRepository { tip, parents }
    }

    /// Advance the tip, adding the given revisions to the parent map.
    pub fn extend(&mut self, tip: RevisionId, parents: HashMap<RevisionId, Vec<RevisionId>>) {
        self.parents.extend(parents);
        self.tip = tip;
    }
}

impl Repository for MemoryRepository {
    fn tip_revision_id(&self) -> Result<RevisionId> {
        Ok(self.tip.clone())
    }

    fn get_parent_map(
        &self,
        revision_ids: &[RevisionId],
    ) -> Result<HashMap<RevisionId, Vec<RevisionId>>> {
        Ok(revision_ids
            .iter()
            .filter_map(|rev_id| {
                self.parents
                    .get(rev_id)
                    .map(|parents| (rev_id.clone(), parents.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_revision_is_recognized() {
        let null = RevisionId::from(NULL_REVISION);
        assert!(null.is_null());
        assert!(!RevisionId::from("rev-1").is_null());
    }

    #[test]
    #[should_panic(expected = "empty revision id")]
    fn empty_revision_id_is_rejected() {
        let _ = RevisionId::from(&b""[..]);
    }

    #[test]
    fn memory_repository_omits_ghosts() {
        let repo = MemoryRepository::new(
            RevisionId::from("b"),
            maplit::hashmap! {
                RevisionId::from("b") => vec![RevisionId::from("a")],
            },
        );
        let pmap = repo
            .get_parent_map(&[RevisionId::from("b"), RevisionId::from("a")])
            .unwrap();
        assert!(pmap.contains_key(&RevisionId::from("b")));
        assert!(!pmap.contains_key(&RevisionId::from("a")));
    }
}
