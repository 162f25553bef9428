//! Message types for LLM communication.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of exchanges a conversation remembers.
pub const DEFAULT_MAX_EXCHANGES: usize = 10;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Returns the role as a string for API requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message sent to a completion API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One question and the answer it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

/// Bounded chat history. The oldest exchange is dropped first.
#[derive(Debug, Clone)]
pub struct Conversation {
    exchanges: VecDeque<Exchange>,
    max_exchanges: usize,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::with_max_exchanges(DEFAULT_MAX_EXCHANGES)
    }

    /// Keeps only the last `max_exchanges` exchanges.
    pub fn with_max_exchanges(max_exchanges: usize) -> Self {
        Self {
            exchanges: VecDeque::new(),
            max_exchanges,
        }
    }

    /// Records an exchange, evicting the oldest past the cap.
    pub fn push(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.exchanges.push_back(Exchange {
            question: question.into(),
            answer: answer.into(),
        });
        while self.exchanges.len() > self.max_exchanges {
            self.exchanges.pop_front();
        }
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    /// Flattens the history into alternating user/assistant messages.
    pub fn to_messages(&self) -> Vec<Message> {
        self.exchanges
            .iter()
            .flat_map(|ex| {
                [
                    Message::user(ex.question.clone()),
                    Message::assistant(ex.answer.clone()),
                ]
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
