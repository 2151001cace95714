//! # Transactional Queue
//!
//! A bounded FIFO queue built entirely on one `TRef<VecDeque<A>>`: `offer`
//! blocks (via retry) while the queue is full, `take` blocks while it is
//! empty. Blocked parties consume no scheduler turns; they are woken by the
//! commit that changes the queue.

use std::collections::VecDeque;

use crate::stm::{Stm, TRef};

/// A transactional FIFO queue with a fixed capacity.
pub struct TQueue<A> {
    items: TRef<VecDeque<A>>,
    capacity: usize,
}

impl<A> Clone for TQueue<A> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            capacity: self.capacity,
        }
    }
}

impl<A> TQueue<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// A queue holding at most `capacity` elements.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: TRef::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append an element, retrying while the queue is full.
    pub fn offer<E>(&self, value: A) -> Stm<(), E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let items = self.items.clone();
        let capacity = self.capacity;
        self.items.read().flat_map(move |q: VecDeque<A>| {
            let items = items.clone();
            let value = value.clone();
            Stm::<(), E>::check(q.len() < capacity).flat_map(move |_| {
                let mut q = q.clone();
                q.push_back(value.clone());
                items.write(q)
            })
        })
    }

    /// Remove the head element, retrying while the queue is empty.
    pub fn take<E>(&self) -> Stm<A, E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let items = self.items.clone();
        self.items.read().flat_map(move |q: VecDeque<A>| {
            let mut q = q.clone();
            match q.pop_front() {
                Some(head) => items.write(q).map(move |_| head.clone()),
                None => Stm::retry(),
            }
        })
    }

    /// Read the head element without removing it, retrying while empty.
    pub fn peek<E>(&self) -> Stm<A, E>
    where
        E: Clone + Send + Sync + 'static,
    {
        self.items.read().flat_map(|q: VecDeque<A>| match q.front() {
            Some(head) => Stm::succeed(head.clone()),
            None => Stm::retry(),
        })
    }

    /// Committed number of elements, read outside any transaction.
    pub fn size(&self) -> usize {
        self.items.snapshot().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_queue_is_empty() {
        let q: TQueue<u32> = TQueue::bounded(4);
        assert_eq!(q.size(), 0);
        assert_eq!(q.capacity(), 4);
    }

    #[test]
    fn test_clone_shares_backing_cell() {
        let q: TQueue<u32> = TQueue::bounded(4);
        let q2 = q.clone();
        assert_eq!(q2.capacity(), 4);
        assert_eq!(q.size(), q2.size());
    }
}
