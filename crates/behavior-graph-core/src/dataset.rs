//! Interaction files on disk.
//!
//! A dataset directory holds one `<behavior>.txt` per behavior plus
//! `test.txt`. Every non-empty line reads `user item item ...` with
//! whitespace-separated integer ids. Repeated user lines are merged.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::augment::GraphAugmentor;
use crate::error::{GraphError, GraphResult};
use crate::labels::InteractionMap;
use crate::relation::Behaviors;
use crate::similarity::SimilarityMatrix;
use crate::sparse::SparseAdjacency;

/// Name of the held-out file inside a dataset directory.
pub const TEST_FILE: &str = "test.txt";

/// Training interactions per behavior plus the held-out test set.
#[derive(Debug, Clone)]
pub struct InteractionData {
    behaviors: Behaviors,
    n_users: usize,
    n_items: usize,
    train: Vec<InteractionMap>,
    test: InteractionMap,
}

/// Parse `user item item ...` lines. `file` only labels errors.
pub fn parse_interactions<R: BufRead>(reader: R, file: &str) -> GraphResult<InteractionMap> {
    let mut map = InteractionMap::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let Some(user) = fields.next() else {
            continue;
        };
        let parse = |s: &str| {
            s.parse::<u32>().map_err(|e| GraphError::ParseError {
                file: file.to_string(),
                line: lineno + 1,
                message: format!("'{}': {}", s, e),
            })
        };
        let user = parse(user)?;
        let items = fields.map(parse).collect::<GraphResult<Vec<u32>>>()?;
        if !items.is_empty() {
            map.entry(user).or_default().extend(items);
        }
    }
    Ok(map)
}

fn read_file(path: &Path) -> GraphResult<InteractionMap> {
    let file = File::open(path).map_err(|e| GraphError::DataError {
        message: format!("cannot open '{}': {}", path.display(), e),
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_interactions(BufReader::new(file), &name)
}

fn max_ids(map: &InteractionMap) -> (Option<u32>, Option<u32>) {
    let max_user = map.keys().next_back().copied();
    let max_item = map.values().flat_map(|v| v.iter().copied()).max();
    (max_user, max_item)
}

impl InteractionData {
    /// Read `<behavior>.txt` for every behavior and `test.txt` from `dir`.
    pub fn load_dir(dir: impl AsRef<Path>, behaviors: &Behaviors) -> GraphResult<Self> {
        let dir = dir.as_ref();
        let mut train = Vec::with_capacity(behaviors.len());
        for name in behaviors.names() {
            train.push(read_file(&dir.join(format!("{}.txt", name)))?);
        }
        let test = read_file(&dir.join(TEST_FILE))?;
        let data = Self::from_maps(behaviors.clone(), train, test)?;
        tracing::info!(
            dir = %dir.display(),
            users = data.n_users,
            items = data.n_items,
            target = behaviors.target_name(),
            target_interactions = data.n_interactions(behaviors.target()),
            test_users = data.test.len(),
            "loaded interaction data"
        );
        Ok(data)
    }

    /// Id spaces are `0..=max id` seen anywhere, test set included.
    pub fn from_maps(
        behaviors: Behaviors,
        train: Vec<InteractionMap>,
        test: InteractionMap,
    ) -> GraphResult<Self> {
        behaviors.expect_len("training files", train.len())?;
        if train[behaviors.target()].is_empty() {
            return Err(GraphError::DataError {
                message: format!("target behavior '{}' has no interactions", behaviors.target_name()),
            });
        }
        let mut n_users = 0usize;
        let mut n_items = 0usize;
        for map in train.iter().chain(std::iter::once(&test)) {
            let (u, i) = max_ids(map);
            if let Some(u) = u {
                n_users = n_users.max(u as usize + 1);
            }
            if let Some(i) = i {
                n_items = n_items.max(i as usize + 1);
            }
        }
        Ok(Self {
            behaviors,
            n_users,
            n_items,
            train,
            test,
        })
    }

    pub fn behaviors(&self) -> &Behaviors {
        &self.behaviors
    }

    pub fn n_users(&self) -> usize {
        self.n_users
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn train(&self, behavior: usize) -> &InteractionMap {
        &self.train[behavior]
    }

    /// Per-behavior maps, target last.
    pub fn train_maps(&self) -> &[InteractionMap] {
        &self.train
    }

    pub fn test(&self) -> &InteractionMap {
        &self.test
    }

    pub fn n_interactions(&self, behavior: usize) -> usize {
        self.train[behavior].values().map(Vec::len).sum()
    }

    /// Distinct (user, item) pairs of one behavior.
    pub fn edges(&self, behavior: usize) -> Vec<(u32, u32)> {
        let set: BTreeSet<(u32, u32)> = self.train[behavior]
            .iter()
            .flat_map(|(&u, items)| items.iter().map(move |&i| (u, i)))
            .collect();
        set.into_iter().collect()
    }

    /// One normalized adjacency per behavior, in behavior order.
    pub fn static_adjacencies(&self) -> GraphResult<Vec<SparseAdjacency>> {
        (0..self.behaviors.len())
            .map(|b| SparseAdjacency::normalized_bipartite(self.n_users, self.n_items, self.edges(b)))
            .collect()
    }

    /// Augmentor over the target behavior's edges.
    pub fn augmentor(&self) -> GraphAugmentor {
        GraphAugmentor::new(self.n_users, self.n_items, self.edges(self.behaviors.target()))
    }

    /// Cosine similarity between users over the union of all behaviors.
    pub fn user_similarity(&self) -> SimilarityMatrix {
        let mut sets = vec![Vec::new(); self.n_users];
        for map in &self.train {
            for (&u, items) in map {
                sets[u as usize].extend_from_slice(items);
            }
        }
        SimilarityMatrix::cosine(&sets)
    }

    /// Cosine similarity between items over the union of all behaviors.
    pub fn item_similarity(&self) -> SimilarityMatrix {
        let mut sets = vec![Vec::new(); self.n_items];
        for map in &self.train {
            for (&u, items) in map {
                for &i in items {
                    sets[i as usize].push(u);
                }
            }
        }
        SimilarityMatrix::cosine(&sets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_dataset(dir: &Path) {
        fs::write(dir.join("view.txt"), "0 0 1 2\n1 1\n\n3 2\n").unwrap();
        fs::write(dir.join("buy.txt"), "0 1\n1 1 2\n2 0\n").unwrap();
        fs::write(dir.join(TEST_FILE), "0 2\n2 1\n4 3\n").unwrap();
    }

    #[test]
    fn test_load_dir_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let behaviors = Behaviors::parse("view,buy").unwrap();
        let data = InteractionData::load_dir(dir.path(), &behaviors).unwrap();
        // test.txt mentions user 4 and item 3
        assert_eq!(data.n_users(), 5);
        assert_eq!(data.n_items(), 4);
        assert_eq!(data.n_interactions(0), 5);
        assert_eq!(data.edges(1), vec![(0, 1), (1, 1), (1, 2), (2, 0)]);
        assert_eq!(data.test().get(&2), Some(&vec![1]));
        let adjs = data.static_adjacencies().unwrap();
        assert_eq!(adjs.len(), 2);
        assert_eq!(adjs[1].n_nodes(), 9);
    }

    #[test]
    fn test_parse_error_reports_line() {
        let input = "0 1\n1 x\n";
        let err = parse_interactions(input.as_bytes(), "buy.txt").unwrap_err();
        match err {
            GraphError::ParseError { file, line, .. } => {
                assert_eq!(file, "buy.txt");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_repeated_user_lines_merge() {
        let map = parse_interactions("5 1\n5 2 3\n".as_bytes(), "x").unwrap();
        assert_eq!(map[&5], vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_behavior_file() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let behaviors = Behaviors::parse("view,cart,buy").unwrap();
        let err = InteractionData::load_dir(dir.path(), &behaviors).unwrap_err();
        assert!(err.to_string().contains("cart.txt"));
    }

    #[test]
    fn test_empty_target_rejected() {
        let behaviors = Behaviors::parse("view,buy").unwrap();
        let mut view = InteractionMap::new();
        view.insert(0, vec![0]);
        let err =
            InteractionData::from_maps(behaviors, vec![view, InteractionMap::new()], InteractionMap::new())
                .unwrap_err();
        assert!(matches!(err, GraphError::DataError { .. }));
    }

    #[test]
    fn test_unified_similarity_uses_all_behaviors() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let behaviors = Behaviors::parse("view,buy").unwrap();
        let data = InteractionData::load_dir(dir.path(), &behaviors).unwrap();
        let users = data.user_similarity();
        assert_eq!(users.len(), 5);
        // user 1 {1, 2} (view: 1, buy: 1 2), user 3 {2}
        assert!(users.get(1, 3) > 0.0);
        assert_eq!(users.get(4, 4), 0.0);
        let items = data.item_similarity();
        assert_eq!(items.len(), 4);
        assert!(items.get(1, 2) > 0.0);
    }
}
