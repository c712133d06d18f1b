use std::collections::VecDeque;

use crate::protocol::{Chat, StatusReply};

/// Per-user delivery queues for a broadcast room.
///
/// Receive streams poll these instead of being pushed to. The drain calls
/// remove exactly the messages they return, so anything queued while a
/// drained batch is in flight stays behind for the next poll.
#[derive(Debug, Default)]
pub struct Mailbox {
    chats: VecDeque<Chat>,
    statuses: VecDeque<StatusReply>,
}

impl Mailbox {
    pub fn push_chat(&mut self, chat: Chat) {
        self.chats.push_back(chat);
    }

    pub fn push_status(&mut self, status: StatusReply) {
        self.statuses.push_back(status);
    }

    /// Removes and returns all queued chats in arrival order.
    pub fn drain_chats(&mut self) -> Vec<Chat> {
        self.chats.drain(..).collect()
    }

    /// Removes and returns all queued statuses in arrival order.
    pub fn drain_statuses(&mut self) -> Vec<StatusReply> {
        self.statuses.drain(..).collect()
    }
}
