//! Undo and redo stacks.
//!
//! Each successful event pushes the inverse event(s) its pre-process
//! constructed. Bundles group: while a bundle is open, inverses append to
//! the open entry, and one user-visible undo replays the whole entry in
//! reverse submission order.

use crate::event::Event;

#[derive(Default)]
pub struct UndoStack {
    entries: Vec<Vec<Event>>,
    open_depth: u32,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a grouped entry. Nested bundles deepen the same entry.
    pub fn begin_bundle(&mut self) {
        if self.open_depth == 0 {
            self.entries.push(Vec::new());
        }
        self.open_depth += 1;
    }

    /// Close a grouped entry; an empty group is dropped.
    pub fn end_bundle(&mut self) {
        if self.open_depth == 0 {
            return;
        }
        self.open_depth -= 1;
        if self.open_depth == 0
            && self.entries.last().is_some_and(|entry| entry.is_empty())
        {
            self.entries.pop();
        }
    }

    pub fn in_bundle(&self) -> bool {
        self.open_depth > 0
    }

    /// Push one inverse event: appended to the open bundle if any, its own
    /// entry otherwise.
    pub fn push(&mut self, event: Event) {
        if self.open_depth > 0 {
            self.entries
                .last_mut()
                .expect("an open bundle has a top entry")
                .push(event);
        } else {
            self.entries.push(vec![event]);
        }
    }

    /// Pop the newest entry. The events inside are returned in submission
    /// order; callers replay them reversed.
    pub fn pop(&mut self) -> Option<Vec<Event>> {
        if self.open_depth > 0 {
            return None;
        }
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn clear(&mut self) {
        self.entries.clear();
        self.open_depth = 0;
    }
}
