//! The attribute tree: a hierarchical namespace of string paths mapped to
//! dense integer handles (quarks).
//!
//! Attributes are created lazily on first reference and never removed, so a
//! quark stays valid for the life of the history. The tree has exactly one
//! writer (the state-change thread) but is read concurrently by queries, so
//! the path lookup goes through a `DashMap` and the node table sits behind an
//! `RwLock` that the writer only takes for appends.
//!
//! # Quark density
//!
//! Quarks are handed out sequentially starting at 0 with no gaps; the state
//! system relies on this to index its ongoing-state vector directly.

use std::sync::RwLock;

use dashmap::DashMap;

use crate::errors::{Result, StateError};
use crate::interval::Quark;

struct AttributeNode {
    name: String,
    parent: Option<Quark>,
    children: Vec<Quark>,
}

pub struct AttributeTree {
    /// Full joined path -> quark. DashMap gives the query side lock-free
    /// reads while the writer thread inserts.
    lookup: DashMap<String, Quark>,
    nodes: RwLock<Vec<AttributeNode>>,
}

/// Initial capacity for the path map. Sized for a typical kernel trace
/// (threads + CPUs + IRQ vectors) without rehashing.
const INITIAL_PATH_CAPACITY: usize = 4096;

impl AttributeTree {
    pub fn new() -> Self {
        Self {
            lookup: DashMap::with_capacity(INITIAL_PATH_CAPACITY),
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Get or create the quark for an absolute path, creating any missing
    /// intermediate attributes. Idempotent; only ever called from the writer
    /// thread.
    pub fn quark_for_and_add(&self, path: &[&str]) -> Quark {
        debug_assert!(!path.is_empty(), "attribute path must have a segment");
        let mut parent: Option<Quark> = None;
        let mut joined = String::new();
        for segment in path {
            if !joined.is_empty() {
                joined.push('/');
            }
            joined.push_str(segment);
            parent = Some(self.child_and_add(parent, segment, &joined));
        }
        parent.unwrap()
    }

    /// Non-creating absolute lookup.
    pub fn quark_for(&self, path: &[&str]) -> Result<Quark> {
        let joined = path.join("/");
        self.lookup
            .get(&joined)
            .map(|q| *q)
            .ok_or(StateError::AttributeNotFound { path: joined })
    }

    /// Get or create a quark for a path relative to `parent`.
    pub fn quark_relative_and_add(&self, parent: Quark, path: &[&str]) -> Quark {
        debug_assert!(!path.is_empty());
        let mut cur = parent;
        let mut joined = self.full_path(cur);
        for segment in path {
            joined.push('/');
            joined.push_str(segment);
            cur = self.child_and_add(Some(cur), segment, &joined);
        }
        cur
    }

    /// Non-creating relative lookup.
    pub fn quark_relative(&self, parent: Quark, path: &[&str]) -> Result<Quark> {
        let mut joined = self.full_path(parent);
        for segment in path {
            joined.push('/');
            joined.push_str(segment);
        }
        self.lookup
            .get(&joined)
            .map(|q| *q)
            .ok_or(StateError::AttributeNotFound { path: joined })
    }

    fn child_and_add(&self, parent: Option<Quark>, name: &str, joined: &str) -> Quark {
        if let Some(q) = self.lookup.get(joined) {
            return *q;
        }
        // Single-writer discipline: no other thread can be inserting, so the
        // recheck under the entry lock is only there to keep DashMap's
        // invariants honest.
        *self.lookup.entry(joined.to_string()).or_insert_with(|| {
            let mut nodes = self.nodes.write().unwrap();
            let quark = nodes.len();
            nodes.push(AttributeNode {
                name: name.to_string(),
                parent,
                children: Vec::new(),
            });
            if let Some(p) = parent {
                nodes[p].children.push(quark);
            }
            quark
        })
    }

    /// Inverse lookup: path segments from the root down to `quark`.
    pub fn path_of(&self, quark: Quark) -> Vec<String> {
        let nodes = self.nodes.read().unwrap();
        let mut segments = Vec::new();
        let mut cur = Some(quark);
        while let Some(q) = cur {
            segments.push(nodes[q].name.clone());
            cur = nodes[q].parent;
        }
        segments.reverse();
        segments
    }

    /// Full slash-joined path for `quark`.
    pub fn full_path(&self, quark: Quark) -> String {
        self.path_of(quark).join("/")
    }

    /// Direct children of `quark`, or the whole subtree when `recursive`.
    /// The returned quarks are in creation order within each level.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Vec<Quark> {
        let nodes = self.nodes.read().unwrap();
        let mut out = Vec::new();
        let mut stack: Vec<Quark> = nodes[quark].children.clone();
        stack.reverse();
        while let Some(q) = stack.pop() {
            out.push(q);
            if recursive {
                for child in nodes[q].children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        out
    }

    /// Total number of attributes ever created.
    pub fn num_attributes(&self) -> usize {
        self.nodes.read().unwrap().len()
    }
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}
