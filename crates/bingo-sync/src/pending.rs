//! Writes that could not reach the server yet.
//!
//! Marks are the only queued operation. A newer mark for the same position
//! replaces the queued one, so replay sends the final state once.

use std::collections::VecDeque;

use bingo_core::MarkRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    Mark(MarkRequest),
}

impl PendingOp {
    fn position(&self) -> u32 {
        match self {
            PendingOp::Mark(request) => request.position,
        }
    }
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    ops: VecDeque<PendingOp>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PendingOp) {
        let position = op.position();
        self.ops.retain(|queued| queued.position() != position);
        self.ops.push_back(op);
    }

    /// Drops any queued write for `position`. Returns `true` if one was queued.
    pub fn discard(&mut self, position: u32) -> bool {
        let before = self.ops.len();
        self.ops.retain(|queued| queued.position() != position);
        self.ops.len() != before
    }

    pub fn front(&self) -> Option<&PendingOp> {
        self.ops.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingOp> {
        self.ops.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.ops.iter()
    }
}
