//! Journal envelope unwrapping
//!
//! Compliance journaling delivers a wrapper message that carries the
//! original message as a `message/rfc822` attachment. The unwrapper
//! extracts the inner message's bytes, or reports that the wrapper is not
//! a journal item at all.

use anyhow::Result;
use log::{debug, warn};
use mailparse::ParsedMail;

/// Extract the original message from a journal wrapper.
///
/// Returns `None` when the input is not a journal item: no
/// `message/rfc822` part, or the inner message cannot be extracted.
///
/// Some providers reject the journal message at SMTP time and re-deliver
/// it wrapped in an "Undeliverable" notice, which adds a bounce report as
/// the first `message/rfc822` attachment and pushes the real journal copy
/// to the second. The bounce report's body mistakenly starts with a raw
/// header line, which is the tell used here. Best effort, not a protocol
/// guarantee.
pub fn unwrap_journal_message(raw: &[u8]) -> Result<Option<Vec<u8>>> {
    let cover = mailparse::parse_mail(raw)?;
    let mut parts = Vec::new();
    collect_rfc822_parts(&cover, &mut parts);
    if parts.is_empty() {
        return Ok(None);
    }

    let inner = extract_inner(parts[0]);
    if let Some(bytes) = &inner
        && bytes.starts_with(b"Content-Type:")
        && parts.len() > 1
    {
        let rescued = extract_inner(parts[1]);
        if rescued.is_some() {
            warn!("message was rescued from an 'Undeliverable' wrapper");
        }
        return Ok(rescued);
    }
    Ok(inner)
}

fn collect_rfc822_parts<'p, 'a>(part: &'p ParsedMail<'a>, out: &mut Vec<&'p ParsedMail<'a>>) {
    if part.ctype.mimetype.eq_ignore_ascii_case("message/rfc822") {
        out.push(part);
    }
    for sub in &part.subparts {
        collect_rfc822_parts(sub, out);
    }
}

/// Inner message bytes of a `message/rfc822` part.
///
/// Extraction policies are tried in order: transfer decoding first, the
/// raw body bytes as a fallback when decoding fails.
fn extract_inner(part: &ParsedMail<'_>) -> Option<Vec<u8>> {
    match part.get_body_raw() {
        Ok(body) if !body.is_empty() => return Some(body),
        Ok(_) => debug!("rfc822 attachment has an empty body"),
        Err(err) => debug!("rfc822 attachment transfer decoding failed: {}", err),
    }
    raw_body(part)
}

fn raw_body(part: &ParsedMail<'_>) -> Option<Vec<u8>> {
    let (_, offset) = mailparse::parse_headers(part.raw_bytes).ok()?;
    let body = &part.raw_bytes[offset..];
    if body.is_empty() {
        None
    } else {
        Some(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapper(attachments: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            b"From: journal@example.com\r\n\
To: vault@example.com\r\n\
Subject: Journaled message\r\n\
Content-Type: multipart/mixed; boundary=\"FRONTIER\"\r\n\
\r\n\
--FRONTIER\r\n\
Content-Type: text/plain\r\n\
\r\n\
Envelope summary\r\n",
        );
        for attachment in attachments {
            out.extend_from_slice(b"--FRONTIER\r\nContent-Type: message/rfc822\r\n\r\n");
            out.extend_from_slice(attachment);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--FRONTIER--\r\n");
        out
    }

    const INNER: &[u8] = b"From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: Original\r\n\
\r\n\
Hello Bob\r\n";

    #[test]
    fn test_single_attachment_unwrapped() {
        let raw = wrapper(&[INNER]);
        let inner = unwrap_journal_message(&raw).unwrap().unwrap();
        assert!(inner.starts_with(b"From: alice@example.com"));
        let text = String::from_utf8_lossy(&inner);
        assert!(text.contains("Hello Bob"));
    }

    #[test]
    fn test_no_attachment_is_not_a_journal_item() {
        let raw = b"From: someone@example.com\r\n\
Subject: Plain\r\n\
\r\n\
Just a normal message.\r\n";
        assert!(unwrap_journal_message(raw).unwrap().is_none());
    }

    #[test]
    fn test_undeliverable_wrapper_uses_second_attachment() {
        // Bounce report whose body starts with a raw header line.
        let bounce: &[u8] = b"Content-Type: text/plain\r\n\
\r\n\
Delivery has failed.\r\n";
        let raw = wrapper(&[bounce, INNER]);
        let inner = unwrap_journal_message(&raw).unwrap().unwrap();
        assert!(inner.starts_with(b"From: alice@example.com"));
    }

    #[test]
    fn test_single_header_like_attachment_kept() {
        // Only one attachment: nothing to rescue, the bytes are returned
        // as they are.
        let bounce: &[u8] = b"Content-Type: text/plain\r\n\
\r\n\
Delivery has failed.\r\n";
        let raw = wrapper(&[bounce]);
        let inner = unwrap_journal_message(&raw).unwrap().unwrap();
        assert!(inner.starts_with(b"Content-Type:"));
    }
}
