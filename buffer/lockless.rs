// Lockless queue: received messages are popped without taking the connection lock
use crossbeam::queue::SegQueue;
use std::sync::Arc;

pub struct LocklessQueue<T> {
    queue: Arc<SegQueue<T>>,
}

impl<T> LocklessQueue<T> {
    pub fn new() -> Self {
        LocklessQueue {
            queue: Arc::new(SegQueue::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.queue.push(item)
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clone_handle(&self) -> Self {
        LocklessQueue {
            queue: self.queue.clone(),
        }
    }
}

impl<T> Default for LocklessQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for LocklessQueue<T> {
    fn clone(&self) -> Self {
        self.clone_handle()
    }
}
