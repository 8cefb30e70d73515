//! Merge-aware topological sorting with dotted revision numbers.
//!
//! The sort is a depth-first walk from the branch tip. At every node the
//! left-hand parent is followed first at the same merge depth; the remaining
//! parents are followed afterwards, right to left, one depth further down. A
//! node is numbered when all of its parents have been numbered:
//!
//! * first child of its left-hand parent: the parent's number with the last
//!   component incremented;
//! * any later child: the first revision of a fresh branch,
//!   `(base, branch_count + 1, 1)`, counted per mainline base;
//! * no (or ghost) left-hand parent: the root sequence, `1` for the first
//!   root and `(0, n, 1)` for every root after it.
//!
//! For the graph `{A: [], B: [A], C: [A, B]}` the numbers are `A: 1`,
//! `B: 1.1.1`, `C: 2`: A is the first commit on the trunk, B the first
//! commit of the first branch rooted at A, C the second trunk commit.
//!
//! A merge group ends when the next emitted node sits at a lesser depth, or
//! sits at the same depth without being a parent of the current node (two
//! branches merged by one commit).

use crate::{Error, RevnoVec};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// One numbered node, in merge-sort order (tip first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSortRow<K> {
    pub key: K,
    pub merge_depth: usize,
    pub revno: RevnoVec,
    pub end_of_merge: bool,
}

/// A node on the depth-first stack whose parents are still being walked.
struct PendingNode<K> {
    key: K,
    merge_depth: usize,
    /// Left-hand parent not yet visited. Consumed before `pending_parents`.
    left_pending_parent: Option<K>,
    /// Non-left parents, visited from the end (right to left).
    pending_parents: Vec<K>,
    /// Whether this node was the first child to claim its left-hand parent.
    /// `None` when there is no usable left-hand parent (root or ghost).
    first_child: Option<bool>,
}

pub struct MergeSorter<K: Eq + Hash + Clone> {
    /// Nodes not yet transferred to the stack. Entries are removed as the
    /// walk reaches them; a reference to a removed-but-uncompleted node is a
    /// cycle.
    graph: HashMap<K, Vec<K>>,
    /// Untouched copy, used for numbering and end-of-merge checks.
    original_graph: HashMap<K, Vec<K>>,
    /// node -> (assigned revno, no child has claimed this node yet)
    revnos: HashMap<K, (Option<RevnoVec>, bool)>,
    /// mainline base revno -> number of branches rooted there; key 0 counts
    /// the roots themselves.
    revno_to_branch_count: HashMap<usize, usize>,
    stack: Vec<PendingNode<K>>,
    completed: HashSet<K>,
    /// Nodes in scheduling order (left subtree, right subtrees, node), so
    /// the output is this stack popped from the end.
    scheduled: Vec<(K, usize, RevnoVec)>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> MergeSorter<K> {
    /// Build a sorter for the ancestry of `tip` within `graph`.
    ///
    /// Parents referenced but absent from `graph` are ghosts and are skipped;
    /// `tip` itself must be present.
    pub fn new(graph: HashMap<K, Vec<K>>, tip: K) -> Result<Self, Error<K>> {
        let original_graph = graph.clone();
        let revnos = graph
            .keys()
            .map(|k| (k.clone(), (None, true)))
            .collect::<HashMap<K, (Option<RevnoVec>, bool)>>();
        let mut sorter = MergeSorter {
            graph,
            original_graph,
            revnos,
            revno_to_branch_count: HashMap::new(),
            stack: Vec::new(),
            completed: HashSet::new(),
            scheduled: Vec::new(),
        };
        let parents = match sorter.graph.remove(&tip) {
            Some(parents) => parents,
            None => return Err(Error::MissingKey(tip)),
        };
        sorter.push_node(tip, 0, parents);
        Ok(sorter)
    }

    /// Consume the sorter, returning the numbered ancestry tip-first.
    pub fn sorted(mut self) -> Result<Vec<MergeSortRow<K>>, Error<K>> {
        self.build()?;
        let mut rows = Vec::with_capacity(self.scheduled.len());
        while let Some((key, merge_depth, revno)) = self.scheduled.pop() {
            let end_of_merge = match self.scheduled.last() {
                // the oldest revision always closes its merge group
                None => true,
                Some((next_key, next_depth, _)) => {
                    if *next_depth < merge_depth {
                        true
                    } else {
                        *next_depth == merge_depth
                            && !self.original_graph[&key].contains(next_key)
                    }
                }
            };
            rows.push(MergeSortRow {
                key,
                merge_depth,
                revno,
                end_of_merge,
            });
        }
        Ok(rows)
    }

    fn push_node(&mut self, key: K, merge_depth: usize, parents: Vec<K>) {
        // Claim the left-hand parent as we push: the first node to do so is
        // its first child and will continue the parent's branch.
        let first_child = match parents.first() {
            Some(lh_parent) => match self.revnos.get_mut(lh_parent) {
                Some(entry) => {
                    let first = entry.1;
                    entry.1 = false;
                    Some(first)
                }
                // ghost left-hand parent, treated as no parent at all
                None => None,
            },
            None => None,
        };
        let left_pending_parent = parents.first().cloned();
        let pending_parents = parents.get(1..).unwrap_or_default().to_vec();
        self.stack.push(PendingNode {
            key,
            merge_depth,
            left_pending_parent,
            pending_parents,
            first_child,
        });
    }

    /// Number the node on top of the stack and move it to `scheduled`.
    fn pop_node(&mut self) {
        let node = self.stack.pop().unwrap();
        let parent_revno = {
            let parents = &self.original_graph[&node.key];
            parents
                .first()
                .and_then(|lh_parent| self.revnos.get(lh_parent))
                .and_then(|entry| entry.0.clone())
        };
        let revno = if let Some(parent_revno) = parent_revno {
            if node.first_child == Some(true) {
                parent_revno.bump_last()
            } else {
                // a later child opens a new branch rooted at the parent's base
                let base_revno = parent_revno[0];
                let branch_count = self
                    .revno_to_branch_count
                    .get(&base_revno)
                    .copied()
                    .unwrap_or(0)
                    + 1;
                self.revno_to_branch_count.insert(base_revno, branch_count);
                parent_revno.new_branch(branch_count)
            }
        } else {
            // no parents, or the left-hand parent is a ghost: root sequence
            let root_count = match self.revno_to_branch_count.get(&0) {
                Some(count) => count + 1,
                None => 0,
            };
            self.revno_to_branch_count.insert(0, root_count);
            if root_count > 0 {
                RevnoVec::from(vec![0, root_count, 1])
            } else {
                RevnoVec::from(1)
            }
        };
        if let Some(entry) = self.revnos.get_mut(&node.key) {
            entry.0 = Some(revno.clone());
        }
        self.completed.insert(node.key.clone());
        self.scheduled.push((node.key, node.merge_depth, revno));
    }

    fn build(&mut self) -> Result<(), Error<K>> {
        while !self.stack.is_empty() {
            let (next, is_left) = {
                let top = self.stack.last_mut().unwrap();
                if let Some(lh_parent) = top.left_pending_parent.take() {
                    (Some(lh_parent), true)
                } else if let Some(parent) = top.pending_parents.pop() {
                    (Some(parent), false)
                } else {
                    (None, false)
                }
            };
            let next = match next {
                Some(next) => next,
                None => {
                    // all parents handled, the node can be numbered
                    self.pop_node();
                    continue;
                }
            };
            if self.completed.contains(&next) {
                // finished via another child lower on the stack
                continue;
            }
            match self.graph.remove(&next) {
                Some(parents) => {
                    let merge_depth =
                        self.stack.last().unwrap().merge_depth + usize::from(!is_left);
                    self.push_node(next, merge_depth, parents);
                }
                None => {
                    if self.original_graph.contains_key(&next) {
                        // already on the stack but not completed
                        return Err(Error::Cycle(
                            self.stack.iter().map(|n| n.key.clone()).collect(),
                        ));
                    }
                    // ghost parent, ignore
                }
            }
        }
        Ok(())
    }
}

/// Merge-sort the ancestry of `tip` within `graph`; rows come back
/// tip-first.
pub fn merge_sort<K: Eq + Hash + Clone + std::fmt::Debug>(
    graph: HashMap<K, Vec<K>>,
    tip: K,
) -> Result<Vec<MergeSortRow<K>>, Error<K>> {
    MergeSorter::new(graph, tip)?.sorted()
}
