//! Metadata derivation from raw message headers

use std::collections::BTreeSet;
use std::sync::OnceLock;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailAddr, MailHeader, MailHeaderMap, addrparse};
use regex::Regex;

/// Metadata derived from one message's headers.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    /// Addresses from `From`, lower-cased.
    pub sender: Vec<String>,
    /// Addresses from `To`, `CC` and `Received: … for <addr>`, lower-cased.
    pub recipients: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    /// `Message-Id` header, empty when absent.
    pub email_id: String,
    /// `Subject` header, empty when absent.
    pub subject: String,
}

fn received_for_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bfor\s+<?([\w\-.]+@[\w\-.]+\w)>?").unwrap())
}

/// Parse the headers of a raw message into [`MessageHeaders`].
pub fn parse_message_meta(raw: &[u8]) -> Result<MessageHeaders> {
    let (headers, _) = mailparse::parse_headers(raw)?;

    let sender = address_set(&headers, "From");
    let mut recipients = address_set(&headers, "To");
    recipients.extend(address_set(&headers, "CC"));
    // Messages delivered via an alias or a distribution list often only
    // carry the real recipient in a Received trace.
    for value in headers.get_all_values("Received") {
        if let Some(captures) = received_for_re().captures(&value) {
            recipients.insert(captures[1].to_lowercase());
        }
    }

    let date = headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single());

    Ok(MessageHeaders {
        sender: sender.into_iter().collect(),
        recipients: recipients.into_iter().collect(),
        date,
        email_id: headers.get_first_value("Message-Id").unwrap_or_default(),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
    })
}

fn address_set(headers: &[MailHeader<'_>], name: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for value in headers.get_all_values(name) {
        let Ok(parsed) = addrparse(&value) else {
            continue;
        };
        for addr in parsed.iter() {
            match addr {
                MailAddr::Single(info) => {
                    out.insert(info.addr.to_lowercase());
                }
                MailAddr::Group(group) => {
                    for info in &group.addrs {
                        out.insert(info.addr.to_lowercase());
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: Test User <Test@Example.com>\r\n\
To: recipient@example.com\r\n\
CC: copy@example.com\r\n\
Received: from mx.example.com by mail.example.com for <hidden@example.com>; \
Wed, 20 Feb 2026 12:00:00 +0100\r\n\
Subject: Test Email\r\n\
Date: Wed, 20 Feb 2026 12:00:00 +0100\r\n\
Message-Id: <abc123@example.com>\r\n\
\r\n\
This is a test email body.\r\n";

    #[test]
    fn test_subject_and_message_id() {
        let meta = parse_message_meta(SAMPLE).unwrap();
        assert_eq!(meta.subject, "Test Email");
        assert_eq!(meta.email_id, "<abc123@example.com>");
    }

    #[test]
    fn test_addresses_lowercased_and_merged() {
        let meta = parse_message_meta(SAMPLE).unwrap();
        assert_eq!(meta.sender, vec!["test@example.com".to_string()]);
        assert!(meta.recipients.contains(&"recipient@example.com".to_string()));
        assert!(meta.recipients.contains(&"copy@example.com".to_string()));
        // From the Received trace.
        assert!(meta.recipients.contains(&"hidden@example.com".to_string()));
    }

    #[test]
    fn test_date_parsed() {
        let meta = parse_message_meta(SAMPLE).unwrap();
        let date = meta.date.unwrap();
        assert_eq!(date.timezone(), Utc);
        assert_eq!(date.to_rfc3339(), "2026-02-20T11:00:00+00:00");
    }

    #[test]
    fn test_missing_headers_default_empty() {
        let meta = parse_message_meta(b"X-Other: nothing\r\n\r\nbody\r\n").unwrap();
        assert!(meta.sender.is_empty());
        assert!(meta.recipients.is_empty());
        assert!(meta.date.is_none());
        assert_eq!(meta.email_id, "");
        assert_eq!(meta.subject, "");
    }
}
