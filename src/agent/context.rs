//! Bounded, in-memory conversation context

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ContextConfig;

/// One completed user/assistant round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// Recent exchanges handed to the responder
///
/// Keeps at most `max_history` exchanges and forgets all of them after
/// `expiry` without a new one.
#[derive(Debug)]
pub struct ConversationContext {
    max_history: usize,
    expiry: Duration,
    exchanges: VecDeque<Exchange>,
    last_activity: Option<Instant>,
}

impl ConversationContext {
    #[must_use]
    pub fn new(max_history: usize, expiry: Duration) -> Self {
        Self {
            max_history,
            expiry,
            exchanges: VecDeque::with_capacity(max_history),
            last_activity: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.max_history, config.timeout)
    }

    /// Record a finished exchange, dropping the oldest past the bound
    pub fn push(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.expire();
        self.last_activity = Some(Instant::now());
        if self.max_history == 0 {
            return;
        }

        while self.exchanges.len() >= self.max_history {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back(Exchange {
            user: user.into(),
            assistant: assistant.into(),
        });
    }

    /// Exchanges still in the window, oldest first
    pub fn recent(&mut self) -> Vec<Exchange> {
        self.expire();
        self.exchanges.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
        self.last_activity = None;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    fn expire(&mut self) {
        if let Some(last) = self.last_activity
            && last.elapsed() > self.expiry
        {
            tracing::debug!(exchanges = self.exchanges.len(), "conversation context expired");
            self.clear();
        }
    }
}
