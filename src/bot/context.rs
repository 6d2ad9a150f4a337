//! Rolling per-conversation history sent to the model.
//!
//! History is kept as alternating user/assistant turns. When the history grows
//! past `max_groups` pairs the oldest turns are evicted two at a time, so a
//! user turn is never separated from its reply.

use std::collections::VecDeque;

use crate::bot::openai::{Message, Role};

#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    turns: VecDeque<Message>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push_back(Message::text(role, content));
    }

    /// Drop oldest turns until at most `max_groups * 2` remain.
    ///
    /// Removes pairs from the front; a lone trailing turn is removed singly.
    pub fn trim(&mut self, max_groups: usize) {
        let cap = max_groups * 2;
        while self.turns.len() > cap {
            if self.turns.len() >= 2 {
                self.turns.pop_front();
                self.turns.pop_front();
            } else {
                self.turns.pop_front();
            }
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.turns.iter()
    }
}
