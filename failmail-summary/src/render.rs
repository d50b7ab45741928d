//! Renders a flushed summary into an outgoing digest email.

use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use failmail_common::message::OutgoingMessage;

use crate::buffer::{Group, Summary};

/// Builds the digest message for a finished summary.
///
/// Groups appear in descending count order (ties broken by earliest first
/// seen); single-message groups carry the original body, larger groups carry
/// the first body plus the remaining receive timestamps. Recipients are the
/// deduplicated, order-preserving union of every `To:` across the summary's
/// messages, and double as the envelope recipients.
#[derive(Debug, Clone)]
pub struct SummaryRenderer {
    from: String,
}

impl SummaryRenderer {
    #[must_use]
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }

    #[must_use]
    pub fn render(&self, summary: &Summary, now: DateTime<Utc>) -> OutgoingMessage {
        let groups = summary.sorted_groups();
        let recipients = recipients(&groups);

        let mut text = String::new();
        let _ = write!(text, "From: {}\r\n", self.from);
        let _ = write!(text, "To: {}\r\n", recipients.join(", "));
        let _ = write!(text, "Subject: [failmail] {} messages\r\n", summary.message_count());
        let _ = write!(text, "Date: {}\r\n", now.to_rfc2822());
        text.push_str("\r\n");

        for group in &groups {
            render_group(&mut text, group);
        }

        OutgoingMessage::new(self.from.clone(), recipients, text.into_bytes())
    }
}

fn render_group(text: &mut String, group: &Group) {
    let _ = write!(
        text,
        "{}x: {}\r\n    first seen {}, last seen {}\r\n\r\n",
        group.count(),
        group.subject(),
        rfc3339(group.first()),
        rfc3339(group.last()),
    );

    if let Some(first) = group.messages().first() {
        for line in String::from_utf8_lossy(first.body()).lines() {
            let _ = write!(text, "    {line}\r\n");
        }
        text.push_str("\r\n");
    }

    if group.count() > 1 {
        text.push_str("    also received at:\r\n");
        for message in &group.messages()[1..] {
            let _ = write!(text, "    - {}\r\n", rfc3339(message.received_at()));
        }
        text.push_str("\r\n");
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn recipients(groups: &[&Group]) -> Vec<String> {
    let mut seen = ahash::AHashSet::new();
    let mut recipients = Vec::new();

    for group in groups {
        for message in group.messages() {
            for to in message.to() {
                if seen.insert(to.clone()) {
                    recipients.push(to.clone());
                }
            }
        }
    }

    recipients
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use failmail_common::message::ReceivedMessage;

    use crate::{buffer::MessageBuffer, GroupBy};

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn add(buffer: &mut MessageBuffer, to: &str, raw: &[u8], seconds: i64) {
        buffer.add(Arc::new(ReceivedMessage::new(
            "src@example.com",
            vec![to.to_string()],
            raw.to_vec(),
            at(seconds),
        )));
    }

    fn summary_of(entries: &[(&str, &[u8], i64)]) -> Summary {
        let mut buffer = MessageBuffer::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
            GroupBy::Header {
                name: "X-Split".to_string(),
                default: String::new(),
            },
            GroupBy::SameSubject,
        );
        for (to, raw, seconds) in entries {
            add(&mut buffer, to, raw, *seconds);
        }
        buffer.flush(true, at(0)).remove(0)
    }

    #[test]
    fn groups_render_in_descending_count_order() {
        let summary = summary_of(&[
            ("ops@example.com", b"Subject: rare\r\n\r\nonce".as_slice(), 0),
            ("ops@example.com", b"Subject: common\r\n\r\nagain".as_slice(), 1),
            ("ops@example.com", b"Subject: common\r\n\r\nagain".as_slice(), 2),
        ]);

        let rendered = SummaryRenderer::new("failmail@example.com").render(&summary, at(100));
        let text = rendered.contents().into_owned();

        let common = text.find("2x: common").expect("common group present");
        let rare = text.find("1x: rare").expect("rare group present");
        assert!(common < rare, "larger group should render first");
    }

    #[test]
    fn count_ties_break_by_earliest_first_seen() {
        let summary = summary_of(&[
            ("ops@example.com", b"Subject: later\r\n\r\nb".as_slice(), 5),
            ("ops@example.com", b"Subject: earlier\r\n\r\nb".as_slice(), 1),
        ]);

        let rendered = SummaryRenderer::new("failmail@example.com").render(&summary, at(100));
        let text = rendered.contents().into_owned();

        assert!(text.find("1x: earlier").unwrap() < text.find("1x: later").unwrap());
    }

    #[test]
    fn single_message_groups_include_the_original_body() {
        let summary = summary_of(&[(
            "ops@example.com",
            b"Subject: s\r\n\r\nthe original body".as_slice(),
            0,
        )]);

        let rendered = SummaryRenderer::new("failmail@example.com").render(&summary, at(100));
        let text = rendered.contents().into_owned();

        assert!(text.contains("the original body"));
        assert!(!text.contains("also received at"));
    }

    #[test]
    fn larger_groups_list_subsequent_receive_times() {
        let summary = summary_of(&[
            ("ops@example.com", b"Subject: s\r\n\r\nfirst body".as_slice(), 0),
            ("ops@example.com", b"Subject: s\r\n\r\nsecond body".as_slice(), 60),
            ("ops@example.com", b"Subject: s\r\n\r\nthird body".as_slice(), 120),
        ]);

        let rendered = SummaryRenderer::new("failmail@example.com").render(&summary, at(200));
        let text = rendered.contents().into_owned();

        assert!(text.contains("first body"));
        assert!(!text.contains("second body"));
        assert!(text.contains("also received at:"));
        assert!(text.contains("- 1970-01-01T00:01:00Z"));
        assert!(text.contains("- 1970-01-01T00:02:00Z"));
        assert!(text.contains("first seen 1970-01-01T00:00:00Z, last seen 1970-01-01T00:02:00Z"));
    }

    #[test]
    fn recipients_are_the_deduplicated_union() {
        let summary = summary_of(&[
            ("one@example.com", b"Subject: a\r\n\r\nb".as_slice(), 0),
            ("two@example.com", b"Subject: a\r\n\r\nb".as_slice(), 1),
            ("one@example.com", b"Subject: b\r\n\r\nb".as_slice(), 2),
        ]);

        let rendered = SummaryRenderer::new("failmail@example.com").render(&summary, at(100));

        assert_eq!(rendered.sender(), "failmail@example.com");
        assert_eq!(
            rendered.recipients(),
            &["one@example.com".to_string(), "two@example.com".to_string()]
        );
    }

    #[test]
    fn headers_carry_from_subject_and_date() {
        let summary = summary_of(&[("ops@example.com", b"Subject: s\r\n\r\nb".as_slice(), 0)]);

        let rendered = SummaryRenderer::new("failmail@example.com").render(&summary, at(100));
        let text = rendered.contents().into_owned();

        assert!(text.starts_with("From: failmail@example.com\r\n"));
        assert!(text.contains("Subject: [failmail] 1 messages\r\n"));
        assert!(text.contains("Date: "));
    }
}
