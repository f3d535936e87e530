//! Opaque stream payloads and transport readiness.

/// A single inbound or outbound stream payload.
///
/// The client never inspects the contents; framing and encoding are left to
/// the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text payload.
    Text(String),
    /// Raw binary payload.
    Binary(Vec<u8>),
}

impl Message {
    /// Returns the kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Binary(_) => MessageKind::Binary,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Returns `true` for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the text payload, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Returns the binary payload, if this is a binary message.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Text(_) => None,
            Self::Binary(data) => Some(data),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Self::Binary(data.to_vec())
    }
}

/// Discriminant of a [`Message`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Readiness of a single transport connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}
