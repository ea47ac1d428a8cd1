//! Cloud-to-device message value type.

use bytes::Bytes;

/// A message addressed to a device through the hub. The client never
/// mutates a message; cloning is cheap (payload is reference-counted).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub properties: Vec<(String, String)>,
    pub message_id: Option<String>,
}

impl Message {
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: Vec::new(),
            message_id: None,
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_properties() {
        let msg = Message::new(&b"abc"[..])
            .with_property("content-type", "text/plain")
            .with_message_id("m-1");
        assert_eq!(msg.payload.as_ref(), b"abc");
        assert_eq!(msg.properties.len(), 1);
        assert_eq!(msg.message_id.as_deref(), Some("m-1"));
    }
}
