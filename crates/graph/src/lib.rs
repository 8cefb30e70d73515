//! Numbering support for revision graphs.
//!
//! A revision graph is a DAG expressed as a map from node to ordered parent
//! list; index 0 is the left-hand parent. A parent that is referenced but has
//! no entry of its own is a ghost: it is known to exist but its ancestry is
//! not available. Ghosts are tolerated everywhere in this crate.

use std::collections::HashMap;
use std::hash::Hash;

pub mod merge_sort;
pub use merge_sort::{merge_sort, MergeSortRow, MergeSorter};

/// A dotted revision number, e.g. `1`, `1.2.1` or `0.3.1`.
///
/// One component for mainline revisions; three components
/// `(base, branch, revno-in-branch)` for merged revisions. Rendered with
/// dots.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevnoVec(Vec<usize>);

impl RevnoVec {
    /// The next revision number along the same branch.
    pub fn bump_last(&self) -> Self {
        let mut ret = self.clone();
        let last_index = ret.0.len() - 1;
        ret.0[last_index] += 1;
        ret
    }

    /// The first revision of a new branch rooted at this revision's base.
    pub fn new_branch(&self, branch_count: usize) -> Self {
        RevnoVec::from(vec![self[0], branch_count, 1])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True for a single-component (mainline) number.
    pub fn is_mainline(&self) -> bool {
        self.0.len() == 1
    }

    pub fn base(&self) -> usize {
        self.0[0]
    }

    pub fn last(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl std::ops::Index<usize> for RevnoVec {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl std::fmt::Debug for RevnoVec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RevnoVec({:?})", self.0)
    }
}

impl std::fmt::Display for RevnoVec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        for r in self.0.iter() {
            if first {
                first = false;
            } else {
                write!(f, ".")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl From<Vec<usize>> for RevnoVec {
    fn from(v: Vec<usize>) -> Self {
        assert!(!v.is_empty(), "a revno has at least one component");
        RevnoVec(v)
    }
}

impl From<usize> for RevnoVec {
    fn from(v: usize) -> Self {
        RevnoVec(vec![v])
    }
}

impl IntoIterator for RevnoVec {
    type Item = usize;
    type IntoIter = std::vec::IntoIter<usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Error when parsing a dotted revno string.
#[derive(Debug, PartialEq, Eq)]
pub struct ParseRevnoError(pub String);

impl std::fmt::Display for ParseRevnoError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "not a dotted revno: {:?}", self.0)
    }
}

impl std::error::Error for ParseRevnoError {}

impl std::str::FromStr for RevnoVec {
    type Err = ParseRevnoError;

    /// Parse a dot-separated ASCII decimal revno, e.g. `"1.2.1"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseRevnoError(s.to_string()));
        }
        let mut components = Vec::new();
        for part in s.split('.') {
            let n: usize = part
                .parse()
                .map_err(|_| ParseRevnoError(s.to_string()))?;
            components.push(n);
        }
        Ok(RevnoVec(components))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error<K> {
    /// The graph contains a cycle; the payload is the open traversal stack.
    Cycle(Vec<K>),
    /// A node required by the operation is not present in the graph.
    MissingKey(K),
}

impl<K: std::fmt::Display> std::fmt::Display for Error<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Cycle(cycle) => {
                write!(f, "Cycle: ")?;
                let mut first = true;
                for c in cycle.iter() {
                    if first {
                        first = false;
                    } else {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{}", c)?;
                }
                Ok(())
            }
            Error::MissingKey(key) => write!(f, "Missing key: {}", key),
        }
    }
}

impl<K: std::fmt::Debug + std::fmt::Display> std::error::Error for Error<K> {}

/// Compute generation-depth-from-origin for every node of a parent map.
///
/// A node with no parents has gdfo 1. A ghost parent counts as gdfo 1.
/// Otherwise gdfo is `1 + max(parent gdfo)`, so gdfo strictly increases
/// along every child edge. Returns `Error::Cycle` when some nodes can never
/// be scheduled.
pub fn compute_gdfo<K: Eq + Hash + Clone>(
    graph: &HashMap<K, Vec<K>>,
) -> Result<HashMap<K, u64>, Error<K>> {
    let mut children: HashMap<&K, Vec<&K>> = HashMap::new();
    let mut blocked: HashMap<&K, usize> = HashMap::new();
    for (child, parents) in graph.iter() {
        blocked.entry(child).or_insert(0);
        for parent in parents {
            if graph.contains_key(parent) {
                children.entry(parent).or_default().push(child);
                *blocked.entry(child).or_insert(0) += 1;
            }
            // ghost parents never block their children
        }
    }
    let mut pending: Vec<&K> = blocked
        .iter()
        .filter_map(|(k, n)| if *n == 0 { Some(*k) } else { None })
        .collect();
    let mut gdfo: HashMap<K, u64> = HashMap::new();
    while let Some(key) = pending.pop() {
        let parents = &graph[key];
        let g = if parents.is_empty() {
            1
        } else {
            let mut max_parent = 1; // ghosts
            for parent in parents {
                if let Some(pg) = gdfo.get(parent) {
                    max_parent = max_parent.max(*pg);
                }
            }
            1 + max_parent
        };
        gdfo.insert(key.clone(), g);
        for &child in children.get(key).map(|c| c.as_slice()).unwrap_or(&[]) {
            let n = blocked.get_mut(child).unwrap();
            *n -= 1;
            if *n == 0 {
                pending.push(child);
            }
        }
    }
    if gdfo.len() != graph.len() {
        let stuck: Vec<K> = graph
            .keys()
            .filter(|k| !gdfo.contains_key(*k))
            .cloned()
            .collect();
        return Err(Error::Cycle(stuck));
    }
    Ok(gdfo)
}

/// Create a child map from a parent map. Ghost parents get no entry.
pub fn invert_parent_map<K: Hash + Eq + Clone>(
    parent_map: &HashMap<K, Vec<K>>,
) -> HashMap<K, Vec<K>> {
    let mut child_map: HashMap<K, Vec<K>> = HashMap::new();
    for (child, parents) in parent_map.iter() {
        for p in parents.iter() {
            if parent_map.contains_key(p) {
                child_map.entry(p.clone()).or_default().push(child.clone());
            }
        }
    }
    child_map
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    #[test]
    fn revno_display_and_parse() {
        let revno = RevnoVec::from(vec![1, 2, 3]);
        assert_eq!(revno.to_string(), "1.2.3");
        assert_eq!("1.2.3".parse::<RevnoVec>().unwrap(), revno);
        assert_eq!("7".parse::<RevnoVec>().unwrap(), RevnoVec::from(7));
        assert!("".parse::<RevnoVec>().is_err());
        assert!("1..2".parse::<RevnoVec>().is_err());
        assert!("1.x.2".parse::<RevnoVec>().is_err());
    }

    #[test]
    fn revno_bump_and_branch() {
        let revno = RevnoVec::from(4);
        assert_eq!(revno.bump_last(), RevnoVec::from(5));
        assert_eq!(revno.new_branch(2), RevnoVec::from(vec![4, 2, 1]));
        let dotted = RevnoVec::from(vec![1, 2, 3]);
        assert_eq!(dotted.bump_last(), RevnoVec::from(vec![1, 2, 4]));
    }

    #[test]
    fn gdfo_linear() {
        let graph = hashmap! {
            'a' => vec![],
            'b' => vec!['a'],
            'c' => vec!['b'],
        };
        let gdfo = compute_gdfo(&graph).unwrap();
        assert_eq!(gdfo[&'a'], 1);
        assert_eq!(gdfo[&'b'], 2);
        assert_eq!(gdfo[&'c'], 3);
    }

    #[test]
    fn gdfo_merge_takes_max() {
        let graph = hashmap! {
            'a' => vec![],
            'b' => vec!['a'],
            'c' => vec!['b'],
            'd' => vec!['a', 'c'],
        };
        let gdfo = compute_gdfo(&graph).unwrap();
        assert_eq!(gdfo[&'d'], 4);
    }

    #[test]
    fn gdfo_ghost_parent_counts_as_one() {
        let graph = hashmap! {
            'a' => vec!['g'],
        };
        let gdfo = compute_gdfo(&graph).unwrap();
        assert_eq!(gdfo[&'a'], 2);
    }

    #[test]
    fn gdfo_cycle_is_an_error() {
        let graph = hashmap! {
            'a' => vec!['b'],
            'b' => vec!['a'],
        };
        match compute_gdfo(&graph) {
            Err(Error::Cycle(stuck)) => assert_eq!(stuck.len(), 2),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn invert_skips_ghosts() {
        let inverted = invert_parent_map(&hashmap! {
            2 => vec![1],
            3 => vec![1, 2, 99],
        });
        assert_eq!(inverted.get(&2), Some(&vec![3]));
        assert!(!inverted.contains_key(&99));
        assert!(!inverted.contains_key(&1));
    }
}
