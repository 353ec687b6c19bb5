//! Remote mailbox access.
//!
//! The ingestor only sees [`MailSession`]; [`imap::ImapConnector`] is the
//! production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use shared_types::EmailAccount;

use crate::error::MailError;

pub mod imap;

pub use imap::ImapConnector;

/// One message as fetched from the server, before it becomes an `Email`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub uid: u32,
    /// `Message-ID` header, or `uid-<uid>@<mailbox>` when the header is absent
    pub message_id: String,
    pub subject: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

/// An authenticated session against one account.
#[async_trait]
pub trait MailSession: Send {
    /// Fetch up to `limit` of the most recent messages in `mailbox`,
    /// newest first.
    async fn fetch_recent(&mut self, mailbox: &str, limit: u32)
        -> Result<Vec<RawMessage>, MailError>;

    async fn logout(&mut self) -> Result<(), MailError>;
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(&self, account: &EmailAccount) -> Result<Box<dyn MailSession>, MailError>;
}

impl RawMessage {
    /// Parse an RFC 822 message.
    pub fn parse(uid: u32, mailbox: &str, raw: &[u8]) -> Result<Self, MailError> {
        let parsed = mailparse::parse_mail(raw)
            .map_err(|e| MailError::Protocol(format!("Failed to parse message {}: {}", uid, e)))?;

        let header = |name: &str| parsed.headers.get_first_value(name).unwrap_or_default();

        let message_id = match header("Message-ID").trim() {
            "" => format!("uid-{}@{}", uid, mailbox),
            id => id.to_string(),
        };

        let mut body_text = None;
        let mut body_html = None;
        collect_bodies(&parsed, &mut body_text, &mut body_html);

        Ok(Self {
            uid,
            message_id,
            subject: header("Subject").trim().to_string(),
            from: header("From").trim().to_string(),
            date: parse_date(&header("Date")),
            body_text,
            body_html,
        })
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            mailparse::dateparse(value)
                .ok()
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
        })
}

/// First inline text/plain and text/html parts, depth first.
fn collect_bodies(part: &ParsedMail, text: &mut Option<String>, html: &mut Option<String>) {
    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return;
    }

    if part.subparts.is_empty() {
        let slot = match part.ctype.mimetype.as_str() {
            "text/plain" => text,
            "text/html" => html,
            _ => return,
        };
        if slot.is_none() {
            *slot = part.get_body().ok();
        }
        return;
    }

    for sub in &part.subparts {
        collect_bodies(sub, text, html);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MULTIPART: &str = "From: \"Jane Doe\" <jane@example.com>\r\n\
Subject: Quarterly numbers\r\n\
Date: Tue, 3 Mar 2026 09:15:00 +0100\r\n\
Message-ID: <abc@mail.example.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Numbers attached.\r\n\
--XX\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Numbers attached.</p>\r\n\
--XX--\r\n";

    #[test]
    fn test_parse_multipart_message() {
        let msg = RawMessage::parse(7, "INBOX", MULTIPART.as_bytes()).unwrap();

        assert_eq!(msg.uid, 7);
        assert_eq!(msg.message_id, "<abc@mail.example.com>");
        assert_eq!(msg.subject, "Quarterly numbers");
        assert_eq!(msg.from, "\"Jane Doe\" <jane@example.com>");
        assert_eq!(
            msg.date,
            Some(Utc.with_ymd_and_hms(2026, 3, 3, 8, 15, 0).unwrap())
        );
        assert_eq!(msg.body_text.as_deref().map(str::trim), Some("Numbers attached."));
        assert_eq!(
            msg.body_html.as_deref().map(str::trim),
            Some("<p>Numbers attached.</p>")
        );
    }

    #[test]
    fn test_missing_message_id_falls_back_to_uid() {
        let raw = "From: a@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let msg = RawMessage::parse(42, "INBOX", raw.as_bytes()).unwrap();

        assert_eq!(msg.message_id, "uid-42@INBOX");
        assert_eq!(msg.date, None);
        assert_eq!(msg.body_text.as_deref().map(str::trim), Some("body"));
        assert!(msg.body_html.is_none());
    }
}
