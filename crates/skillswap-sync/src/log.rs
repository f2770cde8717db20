use skillswap_core::{ChatMessage, ConversationKey};
use std::collections::HashSet;
use tracing::debug;

/// What happened to a live event offered to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveDisposition {
    /// Added to the end of the visible list
    Appended,
    /// Held until the running history load finishes
    Buffered,
    /// Sender/receiver pair is not this conversation
    Foreign,
    /// Carries an id that is already in the list
    Duplicate,
}

/// Ordered message list of one conversation.
///
/// The list is append-only: history lands first, live events after it in
/// arrival order. Live events that arrive while a history load is running
/// are held back and replayed once it completes; at any other time they
/// are appended directly.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    key: ConversationKey,
    messages: Vec<ChatMessage>,
    pending: Vec<ChatMessage>,
    seen_ids: HashSet<String>,
    loading: bool,
    loaded: bool,
}

impl ConversationLog {
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            messages: Vec::new(),
            pending: Vec::new(),
            seen_ids: HashSet::new(),
            loading: false,
            loaded: false,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Whether the history load has finished, successfully or not
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Mark a history fetch as in flight; live events are buffered until
    /// [`complete_history`](Self::complete_history) or
    /// [`fail_history`](Self::fail_history).
    pub fn begin_history(&mut self) {
        self.loading = true;
    }

    pub fn accept_live(&mut self, message: ChatMessage) -> LiveDisposition {
        if !self.key.contains(&message) {
            return LiveDisposition::Foreign;
        }
        if self.loading {
            self.pending.push(message);
            return LiveDisposition::Buffered;
        }
        self.append(message)
    }

    /// Install the fetched history, then replay buffered live events.
    /// Returns the number of history entries kept.
    pub fn complete_history(&mut self, history: Vec<ChatMessage>) -> usize {
        let total = history.len();
        self.messages.clear();
        self.seen_ids.clear();

        for message in history {
            if !self.key.contains(&message) {
                continue;
            }
            if let Some(id) = &message.id {
                if !self.seen_ids.insert(id.clone()) {
                    continue;
                }
            }
            self.messages.push(message);
        }

        let kept = self.messages.len();
        if kept < total {
            debug!(
                "Dropped {} history entries outside {}",
                total - kept,
                self.key
            );
        }

        self.finish_loading();
        kept
    }

    /// The history load failed: start from an empty list and replay
    /// whatever arrived live in the meantime.
    pub fn fail_history(&mut self) {
        self.messages.clear();
        self.seen_ids.clear();
        self.finish_loading();
    }

    fn finish_loading(&mut self) {
        self.loading = false;
        self.loaded = true;
        let pending = std::mem::take(&mut self.pending);
        for message in pending {
            self.append(message);
        }
    }

    fn append(&mut self, message: ChatMessage) -> LiveDisposition {
        if let Some(id) = &message.id {
            if !self.seen_ids.insert(id.clone()) {
                return LiveDisposition::Duplicate;
            }
        }
        self.messages.push(message);
        LiveDisposition::Appended
    }
}
