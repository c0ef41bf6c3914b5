//! Growable job slot storage.

use std::sync::Arc;

use crate::node::JobNode;

/// Dense, index-addressed job records with an explicit logical capacity.
///
/// Records are never removed individually; indices stay valid until
/// [`JobStore::clear`].
pub(crate) struct JobStore<H> {
    slots: Vec<Arc<JobNode<H>>>,
    capacity: usize,
}

impl<H> JobStore<H> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn get(&self, index: usize) -> Option<&Arc<JobNode<H>>> {
        self.slots.get(index)
    }

    /// Index the next pushed record will get.
    pub fn next_index(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, node: Arc<JobNode<H>>) {
        debug_assert!(!self.is_full(), "push into a full store");
        debug_assert_eq!(node.index, self.slots.len());
        self.slots.push(node);
    }

    /// Double the capacity.
    pub fn grow(&mut self) {
        let capacity = (self.capacity * 2).max(1);
        self.slots.reserve(capacity - self.slots.len());
        tracing::debug!("Job store grown from {} to {} slots", self.capacity, capacity);
        self.capacity = capacity;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<JobNode<H>>> {
        self.slots.iter()
    }

    /// Cheap copy of the record list for iterating without the store lock.
    pub fn snapshot(&self) -> Vec<Arc<JobNode<H>>> {
        self.slots.clone()
    }

    /// Drop every record; capacity is kept.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::JobSpec;

    fn push_one(store: &mut JobStore<()>) -> usize {
        let index = store.next_index();
        let spec = JobSpec::new("true", "/", format!("job-{index}"));
        store.push(Arc::new(JobNode::new(index, spec, PathBuf::from("/"), None, None)));
        index
    }

    #[test]
    fn fills_then_grows() {
        let mut store = JobStore::with_capacity(2);
        assert_eq!(push_one(&mut store), 0);
        assert_eq!(push_one(&mut store), 1);
        assert!(store.is_full());

        store.grow();
        assert_eq!(store.capacity(), 4);
        assert!(!store.is_full());
        assert_eq!(push_one(&mut store), 2);
        assert_eq!(store.get(2).map(|n| n.job_name.as_str()), Some("job-2"));
        assert!(store.get(3).is_none());
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut store = JobStore::with_capacity(1);
        push_one(&mut store);
        store.grow();
        store.clear();
        assert_eq!(store.len(), 0);
        assert_eq!(store.capacity(), 2);
        assert_eq!(store.snapshot().len(), 0);
    }
}
