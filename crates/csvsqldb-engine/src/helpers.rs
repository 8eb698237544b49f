use std::hash::BuildHasherDefault;

/// `ahash`-backed `IndexMap`, matching the teacher's helper alias used
/// throughout for insertion-ordered, fast-hashing maps (catalog tables,
/// mappings, grouping keys).
pub type IndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<ahash::AHasher>>;
