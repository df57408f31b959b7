use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::messages::JoinRequest;

/// A join request waiting for the creator's decision, with the address it
/// came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingJoinRequest {
    pub request: JoinRequest,
    pub from: SocketAddr,
}

/// FIFO of pending join requests, filled by the discovery receive loop and
/// drained by the creator's decision loop.
///
/// The lock is only held for a push or a swap, so `enqueue` never waits on
/// a consumer that is busy deciding.
#[derive(Debug, Default)]
pub struct JoinRequestQueue {
    items: Mutex<VecDeque<PendingJoinRequest>>,
}

impl JoinRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<PendingJoinRequest>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the queue length after the push.
    pub fn enqueue(&self, item: PendingJoinRequest) -> usize {
        let mut items = self.items();
        items.push_back(item);
        items.len()
    }

    /// Take everything queued so far, oldest first. Items pushed after the
    /// swap stay for the next call.
    pub fn try_dequeue_all(&self) -> Vec<PendingJoinRequest> {
        let drained = mem::take(&mut *self.items());
        drained.into()
    }

    /// Put `items` back ahead of anything queued since they were drained,
    /// keeping their order.
    pub fn requeue_front(&self, items: Vec<PendingJoinRequest>) {
        let mut queued = self.items();
        for item in items.into_iter().rev() {
            queued.push_front(item);
        }
    }

    pub fn clear(&self) {
        self.items().clear();
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}
