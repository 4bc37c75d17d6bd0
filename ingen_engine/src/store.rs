//! The engine-wide path index.
//!
//! Maps every live object path to a reference usable by the pre-process
//! thread. The audio thread never touches the store; clients and the
//! pre-process worker share it under the mutex the engine wraps it in.
//! `BTreeMap` keeps subtrees contiguous, which the recursive operations
//! (get, delete, copy, move) rely on.

use std::collections::BTreeMap;

use ingen_core::{Path, Status};

use crate::block::Block;
use crate::port::Port;

/// A reference to a live object. Graphs are blocks whose kind is
/// `SubGraph`; ports are addressed through their owning block.
#[derive(Clone, Copy, Debug)]
pub enum ObjectRef {
    Block(*mut Block),
    Port(*mut Port),
}

// Safety: the pointers target objects owned by the graph tree; entries are
// removed before the objects are disposed, and all access happens with the
// store mutex held on non-real-time threads.
unsafe impl Send for ObjectRef {}

impl ObjectRef {
    pub fn as_block(self) -> Result<*mut Block, Status> {
        match self {
            ObjectRef::Block(b) => Ok(b),
            ObjectRef::Port(_) => Err(Status::BadObjectType),
        }
    }
    pub fn as_port(self) -> Result<*mut Port, Status> {
        match self {
            ObjectRef::Port(p) => Ok(p),
            ObjectRef::Block(_) => Err(Status::BadObjectType),
        }
    }
}

#[derive(Default)]
pub struct Store {
    objects: BTreeMap<Path, ObjectRef>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new object; the path must be free.
    pub fn insert(&mut self, path: Path, object: ObjectRef) -> Result<(), Status> {
        if self.objects.contains_key(&path) {
            return Err(Status::Exists);
        }
        self.objects.insert(path, object);
        Ok(())
    }

    pub fn remove(&mut self, path: &Path) -> Option<ObjectRef> {
        self.objects.remove(path)
    }

    /// Remove a subtree (the path and everything below it), returning the
    /// removed entries in path order.
    pub fn remove_subtree(&mut self, path: &Path) -> Vec<(Path, ObjectRef)> {
        let keys: Vec<Path> = self.subtree_paths(path);
        keys.into_iter()
            .filter_map(|p| self.objects.remove(&p).map(|o| (p, o)))
            .collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.objects.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Result<ObjectRef, Status> {
        self.objects.get(path).copied().ok_or(Status::NotFound)
    }

    pub fn block(&self, path: &Path) -> Result<*mut Block, Status> {
        self.get(path)?.as_block()
    }

    pub fn port(&self, path: &Path) -> Result<*mut Port, Status> {
        self.get(path)?.as_port()
    }

    /// The paths of `path` and all its descendants, in order.
    pub fn subtree_paths(&self, path: &Path) -> Vec<Path> {
        self.objects
            .range(path.clone()..)
            .take_while(|(p, _)| *p == path || path.is_parent_of(p))
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &ObjectRef)> {
        self.objects.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut store = Store::new();
        let p = path("/a");
        store.insert(p.clone(), ObjectRef::Block(core::ptr::null_mut())).unwrap();
        assert_eq!(
            store.insert(p, ObjectRef::Block(core::ptr::null_mut())),
            Err(Status::Exists)
        );
    }

    #[test]
    fn subtree_queries_are_contiguous() {
        let mut store = Store::new();
        for p in ["/a", "/a/b", "/a/b/c", "/ab", "/z"] {
            store
                .insert(path(p), ObjectRef::Block(core::ptr::null_mut()))
                .unwrap();
        }
        let subtree = store.subtree_paths(&path("/a"));
        assert_eq!(subtree, vec![path("/a"), path("/a/b"), path("/a/b/c")]);
        let removed = store.remove_subtree(&path("/a"));
        assert_eq!(removed.len(), 3);
        assert!(store.contains(&path("/ab")));
        assert_eq!(store.len(), 2);
    }
}
