use bytes::Bytes;

/// Opaque message exchanged with the transport codec.
///
/// The core only reads the topic and headers; the body is handed through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub topic: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Envelope {
    #[must_use]
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers() {
        let envelope = Envelope::new("devices/d/messages/events/", "hello")
            .with_header("content-type", "text/plain")
            .with_header("trace", "abc");

        assert_eq!(envelope.header("trace"), Some("abc"));
        assert_eq!(envelope.header("missing"), None);
        assert_eq!(envelope.body, Bytes::from_static(b"hello"));
    }
}
