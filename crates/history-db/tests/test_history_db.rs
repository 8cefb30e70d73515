//! End-to-end behavior of the importer and querier against in-memory
//! repositories on temporary database files.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use history_db::{
    ImportOptions, Importer, MemoryRepository, Outcome, Querier, RevisionId, NULL_REVISION,
};
use history_graph::RevnoVec;
use tempfile::TempDir;

fn rev(name: &str) -> RevisionId {
    RevisionId::from(name)
}

fn revno(s: &str) -> RevnoVec {
    s.parse().unwrap()
}

fn parent_map(edges: &[(&str, &[&str])]) -> HashMap<RevisionId, Vec<RevisionId>> {
    edges
        .iter()
        .map(|(child, parents)| (rev(child), parents.iter().map(|p| rev(p)).collect()))
        .collect()
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("history.db")
}

fn import(path: &Path, repo: &MemoryRepository, options: ImportOptions) -> Outcome {
    let mut importer = Importer::open(path, options).unwrap();
    importer.import_tip(repo, None).unwrap()
}

fn validating() -> ImportOptions {
    ImportOptions {
        validate: true,
        ..ImportOptions::default()
    }
}

/// All dotted_revno rows with tips and merged revisions resolved to names.
fn dump_dotted(path: &Path) -> BTreeSet<(Vec<u8>, Vec<u8>, String, bool, i64, i64)> {
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT t.revision_id, m.revision_id, d.revno, d.end_of_merge,
                    d.merge_depth, d.dist
               FROM dotted_revno d, revision t, revision m
              WHERE d.tip_revision = t.db_id AND d.merged_revision = m.db_id",
        )
        .unwrap();
    stmt.query_map([], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    })
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap()
}

/// The streamed merge-sorted rows must equal the reference sorter's output
/// over the repository's own graph.
fn assert_matches_reference(
    path: &Path,
    repo: &MemoryRepository,
    graph: &HashMap<RevisionId, Vec<RevisionId>>,
    tip: &str,
) {
    let reference = history_graph::merge_sort(graph.clone(), rev(tip)).unwrap();
    let mut querier = Querier::open(path, repo, ImportOptions::default()).unwrap();
    let streamed: Vec<_> = querier
        .iter_merge_sorted_revisions(None, None)
        .unwrap()
        .collect::<history_db::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(streamed.len(), reference.len());
    for (got, want) in streamed.iter().zip(reference.iter()) {
        assert_eq!(got.revision_id, want.key);
        assert_eq!(got.revno, want.revno, "revno of {}", want.key);
        assert_eq!(got.merge_depth, want.merge_depth, "depth of {}", want.key);
        assert_eq!(
            got.end_of_merge, want.end_of_merge,
            "end_of_merge of {}",
            want.key
        );
    }
}

#[test]
fn linear_history() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[("A", &[]), ("B", &["A"]), ("C", &["B"]), ("D", &["C"])]);
    let repo = MemoryRepository::new(rev("D"), graph.clone());
    let outcome = import(&db_path(&dir), &repo, ImportOptions::default());
    assert_eq!(outcome, Outcome::Imported { nodes: 4 });

    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let revnos = querier
        .get_dotted_revnos(&[rev("A"), rev("B"), rev("C"), rev("D")])
        .unwrap();
    assert_eq!(revnos[&rev("D")], revno("4"));
    assert_eq!(revnos[&rev("C")], revno("3"));
    assert_eq!(revnos[&rev("B")], revno("2"));
    assert_eq!(revnos[&rev("A")], revno("1"));

    let rows: Vec<_> = querier
        .iter_merge_sorted_revisions(None, None)
        .unwrap()
        .collect::<history_db::Result<Vec<_>>>()
        .unwrap();
    assert!(rows.iter().all(|r| r.merge_depth == 0));
    let ends: Vec<bool> = rows.iter().map(|r| r.end_of_merge).collect();
    assert_eq!(ends, vec![false, false, false, true]);
    assert_matches_reference(&db_path(&dir), &repo, &graph, "D");
}

#[test]
fn simple_merge() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[
        ("A", &[]),
        ("B", &["A"]),
        ("C", &["A"]),
        ("D", &["B", "C"]),
    ]);
    let repo = MemoryRepository::new(rev("D"), graph.clone());
    import(&db_path(&dir), &repo, ImportOptions::default());

    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let revnos = querier
        .get_dotted_revnos(&[rev("A"), rev("B"), rev("C"), rev("D")])
        .unwrap();
    assert_eq!(revnos[&rev("A")], revno("1"));
    assert_eq!(revnos[&rev("B")], revno("2"));
    assert_eq!(revnos[&rev("C")], revno("1.1.1"));
    assert_eq!(revnos[&rev("D")], revno("3"));

    let rows: Vec<_> = querier
        .iter_merge_sorted_revisions(None, None)
        .unwrap()
        .collect::<history_db::Result<Vec<_>>>()
        .unwrap();
    let by_name: HashMap<_, _> = rows.iter().map(|r| (r.revision_id.clone(), r)).collect();
    assert_eq!(by_name[&rev("C")].merge_depth, 1);
    assert_eq!(by_name[&rev("D")].merge_depth, 0);
    assert!(by_name[&rev("C")].end_of_merge);
    assert!(by_name[&rev("A")].end_of_merge);
    assert!(!by_name[&rev("B")].end_of_merge);
    assert_matches_reference(&db_path(&dir), &repo, &graph, "D");
}

#[test]
fn two_branches_merged_separately() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[
        ("A", &[]),
        ("B", &["A", "C"]),
        ("C", &["A"]),
        ("D", &["B"]),
        ("E", &["B", "D"]),
        ("G", &["E"]),
    ]);
    let repo = MemoryRepository::new(rev("G"), graph.clone());
    import(&db_path(&dir), &repo, ImportOptions::default());

    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let revnos = querier
        .get_dotted_revnos(&[rev("A"), rev("B"), rev("C"), rev("D"), rev("E"), rev("G")])
        .unwrap();
    assert_eq!(revnos[&rev("A")], revno("1"));
    assert_eq!(revnos[&rev("B")], revno("2"));
    assert_eq!(revnos[&rev("C")], revno("1.1.1"));
    assert_eq!(revnos[&rev("D")], revno("2.1.1"));
    assert_eq!(revnos[&rev("E")], revno("3"));
    assert_eq!(revnos[&rev("G")], revno("4"));

    // and back again
    let ids = querier
        .get_revision_ids(&[revno("1.1.1"), revno("2.1.1"), revno("4")])
        .unwrap();
    assert_eq!(ids[&revno("1.1.1")], rev("C"));
    assert_eq!(ids[&revno("2.1.1")], rev("D"));
    assert_eq!(ids[&revno("4")], rev("G"));
    assert_matches_reference(&db_path(&dir), &repo, &graph, "G");
}

#[test]
fn incremental_import_equals_full_import() {
    let truncated = parent_map(&[
        ("A", &[]),
        ("B", &["A", "C"]),
        ("C", &["A"]),
        ("D", &["B"]),
        ("E", &["B", "D"]),
    ]);
    let full_graph = {
        let mut g = truncated.clone();
        g.insert(rev("G"), vec![rev("E")]);
        g
    };

    // two imports, the second incremental and self-validating
    let dir_inc = TempDir::new().unwrap();
    let mut repo = MemoryRepository::new(rev("E"), truncated);
    assert_eq!(
        import(&db_path(&dir_inc), &repo, validating()),
        Outcome::Imported { nodes: 5 }
    );
    repo.extend(rev("G"), parent_map(&[("G", &["E"])]));
    assert_eq!(
        import(&db_path(&dir_inc), &repo, validating()),
        Outcome::Imported { nodes: 1 }
    );

    // one import from scratch
    let dir_full = TempDir::new().unwrap();
    let repo_full = MemoryRepository::new(rev("G"), full_graph.clone());
    import(&db_path(&dir_full), &repo_full, ImportOptions::default());

    assert_eq!(dump_dotted(&db_path(&dir_inc)), dump_dotted(&db_path(&dir_full)));
    assert_matches_reference(&db_path(&dir_inc), &repo, &full_graph, "G");

    let mut q_inc = Querier::open(&db_path(&dir_inc), &repo, ImportOptions::default()).unwrap();
    let mut q_full =
        Querier::open(&db_path(&dir_full), &repo_full, ImportOptions::default()).unwrap();
    assert_eq!(q_inc.walk_mainline().unwrap(), q_full.walk_mainline().unwrap());
    assert_eq!(q_inc.walk_ancestry().unwrap(), q_full.walk_ancestry().unwrap());
}

#[test]
fn incremental_numbering_consults_history() {
    // B already merged one branch from A; the next import must give the new
    // branch the second branch number, and the merged root a 0-based one.
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepository::new(
        rev("B"),
        parent_map(&[("A", &[]), ("B", &["A", "C"]), ("C", &["A"])]),
    );
    import(&db_path(&dir), &repo, validating());

    repo.extend(
        rev("H"),
        parent_map(&[
            ("D", &["A"]),
            ("F", &["B", "D"]),
            ("R", &[]),
            ("H", &["F", "R"]),
        ]),
    );
    assert_eq!(
        import(&db_path(&dir), &repo, validating()),
        Outcome::Imported { nodes: 4 }
    );

    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let revnos = querier
        .get_dotted_revnos(&[rev("C"), rev("D"), rev("F"), rev("R"), rev("H")])
        .unwrap();
    assert_eq!(revnos[&rev("C")], revno("1.1.1"));
    assert_eq!(revnos[&rev("D")], revno("1.2.1"));
    assert_eq!(revnos[&rev("F")], revno("3"));
    assert_eq!(revnos[&rev("R")], revno("0.1.1"));
    assert_eq!(revnos[&rev("H")], revno("4"));
}

#[test]
fn ghost_parent_is_recorded_not_numbered() {
    let dir = TempDir::new().unwrap();
    // "ghost" is referenced by C but the repository cannot produce it
    let repo = MemoryRepository::new(
        rev("C"),
        parent_map(&[("A", &[]), ("B", &["A"]), ("C", &["B", "ghost"])]),
    );
    let outcome = import(&db_path(&dir), &repo, ImportOptions::default());
    assert_eq!(outcome, Outcome::Imported { nodes: 3 });

    let conn = rusqlite::Connection::open(db_path(&dir)).unwrap();
    let ghost_count: i64 = conn
        .query_row(
            "SELECT count(*) FROM ghost g, revision r
              WHERE g.db_id = r.db_id AND r.revision_id = ?",
            [rev("ghost").as_bytes()],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(ghost_count, 1);
    let numbered: i64 = conn
        .query_row(
            "SELECT count(*) FROM dotted_revno d, revision r
              WHERE d.merged_revision = r.db_id AND r.revision_id = ?",
            [rev("ghost").as_bytes()],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(numbered, 0);

    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let revnos = querier.get_dotted_revnos(&[rev("C")]).unwrap();
    assert_eq!(revnos[&rev("C")], revno("3"));
}

#[test]
fn ghost_left_hand_parent_in_incremental_import() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepository::new(rev("A"), parent_map(&[("A", &[])]));
    import(&db_path(&dir), &repo, validating());
    // X's left-hand parent is a ghost: X numbers as a merged new root
    repo.extend(
        rev("B"),
        parent_map(&[("X", &["ghost"]), ("B", &["A", "X"])]),
    );
    assert_eq!(
        import(&db_path(&dir), &repo, validating()),
        Outcome::Imported { nodes: 2 }
    );
    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let revnos = querier.get_dotted_revnos(&[rev("B"), rev("X")]).unwrap();
    assert_eq!(revnos[&rev("B")], revno("2"));
    assert_eq!(revnos[&rev("X")], revno("0.1.1"));
}

fn linear_repo(n: usize) -> (MemoryRepository, HashMap<RevisionId, Vec<RevisionId>>) {
    let mut graph = HashMap::new();
    graph.insert(rev("rev-0"), vec![]);
    for i in 1..n {
        graph.insert(rev(&format!("rev-{}", i)), vec![rev(&format!("rev-{}", i - 1))]);
    }
    let tip = rev(&format!("rev-{}", n - 1));
    (MemoryRepository::new(tip, graph.clone()), graph)
}

#[test]
fn range_chunking_and_query_jumps() {
    let dir = TempDir::new().unwrap();
    let (repo, _graph) = linear_repo(250);
    import(&db_path(&dir), &repo, ImportOptions::default());

    let conn = rusqlite::Connection::open(db_path(&dir)).unwrap();
    let counts: Vec<i64> = conn
        .prepare("SELECT count FROM mainline_parent_range ORDER BY pkey")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(counts, vec![100, 100, 50]);
    drop(conn);

    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let revnos = querier.get_dotted_revnos(&[rev("rev-0")]).unwrap();
    assert_eq!(revnos[&rev("rev-0")], revno("1"));
    assert_eq!(querier.stats().mainline_steps, 3);
}

#[test]
fn merge_sorted_window_across_ranges() {
    let dir = TempDir::new().unwrap();
    let (repo, _graph) = linear_repo(250);
    import(&db_path(&dir), &repo, ImportOptions::default());

    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let rows: Vec<_> = querier
        .iter_merge_sorted_revisions(Some(&rev("rev-200")), Some(&rev("rev-150")))
        .unwrap()
        .collect::<history_db::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows.len(), 50);
    assert_eq!(rows[0].revision_id, rev("rev-200"));
    assert_eq!(rows[0].revno, revno("201"));
    assert_eq!(rows.last().unwrap().revision_id, rev("rev-151"));
    assert_eq!(rows.last().unwrap().revno, revno("152"));
}

#[test]
fn import_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[("A", &[]), ("B", &["A"]), ("C", &["A", "B"])]);
    let repo = MemoryRepository::new(rev("C"), graph);
    import(&db_path(&dir), &repo, ImportOptions::default());
    let before = dump_dotted(&db_path(&dir));
    let outcome = import(&db_path(&dir), &repo, ImportOptions::default());
    assert_eq!(outcome, Outcome::AlreadyPresent);
    assert_eq!(dump_dotted(&db_path(&dir)), before);
}

#[test]
fn full_reimport_over_existing_data_converges() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepository::new(
        rev("E"),
        parent_map(&[
            ("A", &[]),
            ("B", &["A", "C"]),
            ("C", &["A"]),
            ("D", &["B"]),
            ("E", &["B", "D"]),
        ]),
    );
    import(&db_path(&dir), &repo, ImportOptions::default());
    repo.extend(rev("G"), parent_map(&[("G", &["E"])]));
    let no_incremental = ImportOptions {
        incremental: false,
        ..ImportOptions::default()
    };
    import(&db_path(&dir), &repo, no_incremental);

    let dir_full = TempDir::new().unwrap();
    let graph = parent_map(&[
        ("A", &[]),
        ("B", &["A", "C"]),
        ("C", &["A"]),
        ("D", &["B"]),
        ("E", &["B", "D"]),
        ("G", &["E"]),
    ]);
    let repo_full = MemoryRepository::new(rev("G"), graph);
    import(&db_path(&dir_full), &repo_full, ImportOptions::default());
    assert_eq!(dump_dotted(&db_path(&dir)), dump_dotted(&db_path(&dir_full)));
}

#[test]
fn gdfo_exceeds_every_parent() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[
        ("A", &[]),
        ("B", &["A", "C"]),
        ("C", &["A"]),
        ("D", &["B"]),
        ("E", &["B", "D"]),
        ("F", &["E", "ghost"]),
    ]);
    let repo = MemoryRepository::new(rev("F"), graph);
    import(&db_path(&dir), &repo, ImportOptions::default());
    let conn = rusqlite::Connection::open(db_path(&dir)).unwrap();
    let violations: i64 = conn
        .query_row(
            "SELECT count(*) FROM parent p, revision c, revision par
              WHERE p.child = c.db_id AND p.parent = par.db_id
                AND c.db_id NOT IN (SELECT db_id FROM ghost)
                AND par.db_id NOT IN (SELECT db_id FROM ghost)
                AND c.gdfo <= par.gdfo",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(violations, 0);
}

#[test]
fn revnos_are_unique_per_tip_and_mainline_is_single_component() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[
        ("A", &[]),
        ("B", &["A", "C"]),
        ("C", &["A"]),
        ("D", &["B"]),
        ("E", &["B", "D"]),
        ("G", &["E"]),
    ]);
    let repo = MemoryRepository::new(rev("G"), graph);
    import(&db_path(&dir), &repo, ImportOptions::default());
    let conn = rusqlite::Connection::open(db_path(&dir)).unwrap();
    let duplicate_revnos: i64 = conn
        .query_row(
            "SELECT count(*) FROM (
                 SELECT tip_revision, revno, count(*) AS n FROM dotted_revno
                  GROUP BY tip_revision, revno HAVING n > 1)",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(duplicate_revnos, 0);
    let dotted_mainlines: i64 = conn
        .query_row(
            "SELECT count(*) FROM dotted_revno
              WHERE merge_depth = 0 AND revno LIKE '%.%'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(dotted_mainlines, 0);
}

#[test]
fn cancelled_import_leaves_the_store_untouched() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);
    let repo = MemoryRepository::new(rev("C"), graph);
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    let mut importer = Importer::open(&db_path(&dir), ImportOptions::default()).unwrap();
    importer.set_progress_fn(Box::new(move |_progress| {
        seen.set(seen.get() + 1);
        false
    }));
    let outcome = importer.import_tip(&repo, None).unwrap();
    assert_eq!(outcome, Outcome::Cancelled);
    assert!(calls.get() > 0);
    drop(importer);

    let conn = rusqlite::Connection::open(db_path(&dir)).unwrap();
    for table in ["revision", "parent", "dotted_revno", "mainline_parent_range"] {
        let rows: i64 = conn
            .query_row(&format!("SELECT count(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 0, "{} not empty after cancel", table);
    }
}

#[test]
fn walking_ranges_equals_walking_parents() {
    let dir = TempDir::new().unwrap();
    let (repo, graph) = linear_repo(120);
    import(&db_path(&dir), &repo, ImportOptions::default());
    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let by_ranges = querier.walk_mainline().unwrap();

    // one left-hand parent at a time, through the repository's own graph
    let mut by_parents = Vec::new();
    let mut cur = Some(rev("rev-119"));
    while let Some(r) = cur {
        by_parents.push(r.clone());
        cur = graph[&r].first().cloned();
    }
    assert_eq!(by_ranges, by_parents);
}

#[test]
fn children_and_lh_parent_lookups() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[
        ("A", &[]),
        ("B", &["A", "C"]),
        ("C", &["A"]),
        ("D", &["B"]),
    ]);
    let repo = MemoryRepository::new(rev("D"), graph);
    import(&db_path(&dir), &repo, ImportOptions::default());
    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let mut children = querier.get_children(&rev("A")).unwrap();
    children.sort();
    assert_eq!(children, vec![rev("B"), rev("C")]);
    assert_eq!(querier.get_lh_parent_rev_id(&rev("D")).unwrap(), Some(rev("B")));
    assert_eq!(querier.get_lh_parent_rev_id(&rev("A")).unwrap(), None);
}

#[test]
fn mainline_where_merged() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[
        ("A", &[]),
        ("B", &["A", "C"]),
        ("C", &["A"]),
        ("D", &["B"]),
        ("E", &["B", "D"]),
    ]);
    let repo = MemoryRepository::new(rev("E"), graph);
    import(&db_path(&dir), &repo, ImportOptions::default());
    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    let merged = querier
        .get_mainline_where_merged(&[rev("C"), rev("D"), rev("B"), rev("unknown")])
        .unwrap();
    assert_eq!(merged[&rev("C")], rev("B"));
    assert_eq!(merged[&rev("D")], rev("E"));
    assert_eq!(merged[&rev("B")], rev("B"));
    assert!(!merged.contains_key(&rev("unknown")));
}

#[test]
fn querier_imports_on_demand() {
    let dir = TempDir::new().unwrap();
    let graph = parent_map(&[("A", &[]), ("B", &["A"])]);
    let repo = MemoryRepository::new(rev("B"), graph);
    // no Importer run beforehand: the querier does it on first use
    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    querier.set_writer_lock(std::sync::Arc::new(std::sync::Mutex::new(())));
    let revnos = querier.get_dotted_revnos(&[rev("B")]).unwrap();
    assert_eq!(revnos[&rev("B")], revno("2"));
}

#[test]
fn too_short_range_len_is_rejected_not_a_panic() {
    let dir = TempDir::new().unwrap();
    let bad = ImportOptions {
        mainline_range_len: 0,
        ..ImportOptions::default()
    };
    assert!(matches!(
        Importer::open(&db_path(&dir), bad.clone()),
        Err(history_db::Error::Config(_))
    ));
    let repo = MemoryRepository::new(rev("A"), parent_map(&[("A", &[])]));
    assert!(matches!(
        Querier::open(&db_path(&dir), &repo, bad),
        Err(history_db::Error::Config(_))
    ));
}

#[test]
fn empty_branch_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let repo = MemoryRepository::new(RevisionId::from(NULL_REVISION), HashMap::new());
    assert_eq!(
        import(&db_path(&dir), &repo, ImportOptions::default()),
        Outcome::EmptyBranch
    );
    let mut querier = Querier::open(&db_path(&dir), &repo, ImportOptions::default()).unwrap();
    assert!(querier.get_dotted_revnos(&[rev("A")]).unwrap().is_empty());
    assert!(querier.walk_mainline().unwrap().is_empty());
}
