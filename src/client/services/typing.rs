use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Started,
    Stopped,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        self == TypingSignal::Started
    }
}

/// Turns keystrokes into "typing started / stopped" signals.
///
/// One `Started` at the beginning of a burst, one `Stopped` once no keystroke
/// arrived for `timeout`. Clearing the input does not stop a burst early.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    timeout: Duration,
    typing: bool,
    deadline: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            typing: false,
            deadline: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    /// Called on every keystroke with the full input text.
    pub fn on_local_text_changed(&mut self, text: &str, now: Instant) -> Option<TypingSignal> {
        self.deadline = Some(now + self.timeout);
        if !self.typing && !text.is_empty() {
            self.typing = true;
            return Some(TypingSignal::Started);
        }
        None
    }

    /// When the inactivity timer should fire, if a burst is in progress.
    pub fn deadline(&self) -> Option<Instant> {
        if self.typing {
            self.deadline
        } else {
            None
        }
    }

    pub fn on_timer(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.reset(),
            _ => None,
        }
    }

    /// Ends the current burst immediately, e.g. when the socket goes away.
    pub fn reset(&mut self) -> Option<TypingSignal> {
        self.deadline = None;
        if self.typing {
            self.typing = false;
            Some(TypingSignal::Stopped)
        } else {
            None
        }
    }
}
