//! The two message types that flow through the pipeline.
//!
//! A [`ReceivedMessage`] is created by a session handler when the client's
//! `DATA` terminator arrives, and is released once the buffer has folded it
//! into a group. An [`OutgoingMessage`] is produced by the summary renderer
//! (or, with relay-all, straight from a received message) and consumed exactly
//! once by the upstream chain.

use std::{borrow::Cow, sync::Arc};

use ahash::AHashMap;
use chrono::{DateTime, Utc};

/// Parsed message headers: case-insensitive name lookup, value order
/// preserved per name.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    values: AHashMap<String, Vec<String>>,
}

impl HeaderMap {
    /// Parse the header block of a raw message.
    ///
    /// Parse failures are not fatal: a message with unparseable headers is
    /// still accepted with an empty map, and grouping proceeds on defaults.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let mut values: AHashMap<String, Vec<String>> = AHashMap::new();

        if let Ok((headers, _)) = mailparse::parse_headers(raw) {
            for header in headers {
                values
                    .entry(header.get_key().to_ascii_lowercase())
                    .or_default()
                    .push(header.get_value());
            }
        }

        Self { values }
    }

    /// First value of the named header, if any.
    #[must_use]
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of the named header, in order of appearance.
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        self.values
            .get(&name.to_ascii_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A message accepted from a client, immutable once constructed.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    from: String,
    to: Vec<String>,
    data: Arc<[u8]>,
    received_at: DateTime<Utc>,
    headers: HeaderMap,
    subject: String,
}

impl ReceivedMessage {
    /// Build a received message from the envelope and raw bytes, parsing the
    /// headers exactly once.
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        data: impl Into<Arc<[u8]>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let data = data.into();
        let headers = HeaderMap::parse(&data);
        let subject = headers.get_first("subject").unwrap_or_default().to_string();

        Self {
            from: from.into(),
            to,
            data,
            received_at,
            headers,
            subject,
        }
    }

    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn to(&self) -> &[String] {
        &self.to
    }

    #[must_use]
    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The raw `Subject:` header, or `""` when absent or unparseable.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The message body: everything after the first blank line, preserved
    /// byte for byte. No MIME normalization is attempted.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        split_body(&self.data)
    }
}

fn split_body(data: &[u8]) -> &[u8] {
    if let Some(pos) = find(data, b"\r\n\r\n") {
        return &data[pos + 4..];
    }
    if let Some(pos) = find(data, b"\n\n") {
        return &data[pos + 2..];
    }
    &[]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A message bound for the upstream chain.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    sender: String,
    recipients: Vec<String>,
    data: Arc<[u8]>,
}

impl OutgoingMessage {
    pub fn new(sender: impl Into<String>, recipients: Vec<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            sender: sender.into(),
            recipients,
            data: data.into(),
        }
    }

    /// Envelope sender for `MAIL FROM`.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Envelope recipients for `RCPT TO`.
    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    /// The message bytes as text, for the debug upstream and logging.
    #[must_use]
    pub fn contents(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Relay-all forwards the raw message unsummarized.
impl From<&ReceivedMessage> for OutgoingMessage {
    fn from(msg: &ReceivedMessage) -> Self {
        Self {
            sender: msg.from.clone(),
            recipients: msg.to.clone(),
            data: Arc::clone(&msg.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(data: &[u8]) -> ReceivedMessage {
        ReceivedMessage::new(
            "sender@example.com",
            vec!["rcpt@example.com".to_string()],
            data.to_vec(),
            Utc::now(),
        )
    }

    #[test]
    fn headers_are_case_insensitive_and_ordered() {
        let msg = received(
            b"From: a@x\r\nX-Tag: one\r\nx-tag: two\r\nSubject: hello\r\n\r\nbody",
        );

        assert_eq!(msg.headers().get_first("SUBJECT"), Some("hello"));
        assert_eq!(
            msg.headers().get_all("X-Tag"),
            &["one".to_string(), "two".to_string()]
        );
        assert_eq!(msg.subject(), "hello");
    }

    #[test]
    fn missing_subject_falls_back_to_empty() {
        let msg = received(b"From: a@x\r\n\r\nbody");
        assert_eq!(msg.subject(), "");
    }

    #[test]
    fn garbage_is_accepted_with_empty_subject() {
        let msg = received(b"\xff\xfe\x00garbage");
        assert_eq!(msg.subject(), "");
    }

    #[test]
    fn body_preserves_bytes_after_blank_line() {
        let msg = received(b"Subject: s\r\n\r\nline one\r\nline two");
        assert_eq!(msg.body(), b"line one\r\nline two");

        let bare_lf = received(b"Subject: s\n\nbody");
        assert_eq!(bare_lf.body(), b"body");

        let headers_only = received(b"Subject: s\r\n");
        assert_eq!(headers_only.body(), b"");
    }

    #[test]
    fn relay_all_passthrough_keeps_envelope_and_bytes() {
        let msg = received(b"Subject: s\r\n\r\nb");
        let out = OutgoingMessage::from(&msg);

        assert_eq!(out.sender(), "sender@example.com");
        assert_eq!(out.recipients(), &["rcpt@example.com".to_string()]);
        assert_eq!(out.data().as_ref(), msg.data().as_ref());
        assert!(out.contents().contains("Subject: s"));
    }
}
