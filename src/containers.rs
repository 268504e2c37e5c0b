//! Generally useful container data structures

use unordered::UnorderedMap;

/// A deduplicating list: values keep the position of their first insertion
#[derive(Default)]
pub struct InsertionOrderedSet<T: Eq + std::hash::Hash + Ord + Clone> {
    data: Vec<T>,
    revmap: UnorderedMap<T, usize>,
}

impl<T: Eq + std::hash::Hash + Ord + Clone> InsertionOrderedSet<T> {
    pub fn new() -> Self {
        Self {
            data: Default::default(),
            revmap: Default::default(),
        }
    }

    /// The members, indexed as returned by [`Self::insert`]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Position of `v`, inserting it at the end if it is new
    pub fn insert(&mut self, v: T) -> usize {
        if let Some(idx) = self.revmap.get(&v) {
            *idx
        } else {
            let idx = self.data.len();
            self.data.push(v.clone());
            self.revmap.insert(v, idx);
            idx
        }
    }

    /// Number of distinct members
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A priority queue of block indices keyed by dominator-tree depth, as used when placing merge
/// operations. Extraction always yields an element of the greatest depth still queued.
#[derive(Default, Debug)]
pub struct DepthQueue {
    buckets: Vec<Vec<usize>>,
    curdepth: Option<usize>,
}

impl DepthQueue {
    /// A new, empty queue
    pub fn new() -> Self {
        Self {
            buckets: vec![],
            curdepth: None,
        }
    }

    /// Drop all queued elements, and prepare for depths up to `maxdepth`
    pub fn reset(&mut self, maxdepth: usize) {
        self.buckets.clear();
        self.buckets.resize_with(maxdepth + 1, Vec::new);
        self.curdepth = None;
    }

    /// Queue `x` at depth `depth`
    pub fn insert(&mut self, x: usize, depth: usize) {
        if depth >= self.buckets.len() {
            self.buckets.resize_with(depth + 1, Vec::new);
        }
        self.buckets[depth].push(x);
        if self.curdepth.map_or(true, |d| d < depth) {
            self.curdepth = Some(depth);
        }
    }

    /// Remove and return an element of greatest depth
    pub fn extract(&mut self) -> Option<usize> {
        loop {
            let d = self.curdepth?;
            if let Some(x) = self.buckets[d].pop() {
                return Some(x);
            }
            self.curdepth = d.checked_sub(1);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }
}

pub mod unordered {
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseMap<K, V> = std::collections::HashMap<K, V>;
    #[cfg(feature = "deterministic_containers")]
    type BaseMap<K, V> = std::collections::BTreeMap<K, V>;

    /// A map whose iteration order carries no meaning. With the `deterministic_containers`
    /// feature it is backed by an ordered map, so runs are reproducible.
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedMap<K: std::hash::Hash + Ord + Eq, V> {
        map: BaseMap<K, V>,
    }

    impl<K: std::hash::Hash + Ord + Eq, V> UnorderedMap<K, V> {
        pub fn new() -> Self {
            Self {
                map: Default::default(),
            }
        }

        pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get(k)
        }

        pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> bool
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.contains_key(k)
        }

        pub fn insert(&mut self, k: K, v: V) -> Option<V> {
            self.map.insert(k, v)
        }

        pub fn len(&self) -> usize {
            self.map.len()
        }

        pub fn is_empty(&self) -> bool {
            self.map.is_empty()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> Default for UnorderedMap<K, V> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> FromIterator<(K, V)> for UnorderedMap<K, V> {
        fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
            Self {
                map: BaseMap::from_iter(iter),
            }
        }
    }

    /// Always printed in key order, whatever the backing map
    impl<K: std::hash::Hash + Ord + Eq + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug
        for UnorderedMap<K, V>
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let mut entries: Vec<_> = self.map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            f.debug_map().entries(entries).finish()
        }
    }
}
