#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub sender_is_local: bool,
    pub text: String,
}

/// Chat history for the current partner only. Never persisted.
#[derive(Debug, Default)]
pub struct ChatLog {
    lines: Vec<ChatLine>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_local(&mut self, text: impl Into<String>) -> ChatLine {
        self.push(true, text.into())
    }

    pub fn push_remote(&mut self, text: impl Into<String>) -> ChatLine {
        self.push(false, text.into())
    }

    fn push(&mut self, sender_is_local: bool, text: String) -> ChatLine {
        let line = ChatLine {
            sender_is_local,
            text,
        };
        self.lines.push(line.clone());
        line
    }

    pub fn lines(&self) -> &[ChatLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns true when there was anything to clear.
    pub fn clear(&mut self) -> bool {
        let had_lines = !self.lines.is_empty();
        self.lines.clear();
        had_lines
    }
}
