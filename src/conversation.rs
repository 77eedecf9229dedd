use crate::types::{ChatMessage, ChatRequest, ChatRequestBuilder, Role};

/// Append-only message history for one chat.
///
/// Each user send snapshots the history into a fresh [`ChatRequest`]; the assistant
/// reply is appended once its session completes. Messages are never edited in place.
///
/// # Examples
///
/// ```
/// # use conduit_llm::conversation::Conversation;
/// let mut conversation = Conversation::with_system("You are terse.");
/// let request = conversation
///     .send("What is a borrow checker?", "openai", "gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(request.messages.len(), 2);
///
/// conversation.record_reply("It enforces ownership rules at compile time.");
/// assert_eq!(conversation.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(prompt)],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Appends a user message and returns a builder seeded with the whole history.
    pub fn send(
        &mut self,
        text: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> ChatRequestBuilder {
        self.push(ChatMessage::user(text));
        self.request(provider, model)
    }

    /// Builder seeded with the current history, without appending anything.
    pub fn request(
        &self,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> ChatRequestBuilder {
        ChatRequest::builder(provider, model).messages(self.messages.iter().cloned())
    }

    /// Appends the assistant's completed reply. Empty replies are skipped.
    pub fn record_reply(&mut self, content: impl Into<String>) {
        let content = content.into();
        if !content.is_empty() {
            self.push(ChatMessage::assistant(content));
        }
    }

    /// Content of the most recent message with `role`.
    pub fn last(&self, role: Role) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == role)
            .map(|message| message.content.as_str())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
