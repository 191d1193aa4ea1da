//! Message Record Mapper
//!
//! Turns a `ReceivedMail` into the document persisted for it. Mapping never
//! fails outright: when the payload cannot be parsed or its body cannot be
//! decoded, the fields that could be extracted are kept and the problem is
//! reported alongside the document.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailparse::ParsedMail;
use std::collections::BTreeMap;

use crate::types::{MessageDocument, ReceivedMail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingOutcome {
    Mapped(MessageDocument),
    Partial {
        document: MessageDocument,
        reason: String,
    },
}

impl MappingOutcome {
    pub fn into_document(self) -> MessageDocument {
        match self {
            MappingOutcome::Mapped(document) => document,
            MappingOutcome::Partial { document, .. } => document,
        }
    }
}

/// Lower-case the header name and drop every `-`.
pub fn normalize_header_name(name: &str) -> String {
    name.to_lowercase().replace('-', "")
}

/// Build the document for `mail`. The sequence number is left at 0; the
/// ledger assigns it.
pub fn map_message(mail: &ReceivedMail) -> MappingOutcome {
    let mut document = MessageDocument {
        envelope_sender: mail.envelope_sender().to_string(),
        envelope_receiver: mail.envelope_receiver().to_string(),
        bytes64: BASE64.encode(mail.data()),
        ..MessageDocument::default()
    };

    let parsed = match mail.parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            return MappingOutcome::Partial {
                document,
                reason: format!("headers unreadable: {}", e),
            }
        }
    };

    document.headers = extract_headers(&parsed);

    match extract_body(&parsed) {
        Ok(body) => {
            document.body = Some(body);
            MappingOutcome::Mapped(document)
        }
        Err(e) => MappingOutcome::Partial {
            document,
            reason: format!("body undecodable: {}", e),
        },
    }
}

fn extract_headers(parsed: &ParsedMail<'_>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for header in &parsed.headers {
        headers.insert(normalize_header_name(&header.get_key()), header.get_value());
    }
    headers
}

/// First `text/plain` part of a multipart message, otherwise the decoded
/// top-level body.
fn extract_body(parsed: &ParsedMail<'_>) -> Result<String, mailparse::MailParseError> {
    if parsed.subparts.is_empty() {
        return parsed.get_body();
    }
    match find_text_part(parsed) {
        Some(part) => part.get_body(),
        None => parsed.get_body(),
    }
}

fn find_text_part<'a>(parsed: &'a ParsedMail<'a>) -> Option<&'a ParsedMail<'a>> {
    if parsed.subparts.is_empty() {
        return (parsed.ctype.mimetype == "text/plain").then_some(parsed);
    }
    parsed.subparts.iter().find_map(find_text_part)
}
