use mailparse::{MailHeaderMap, MailParseError, ParsedMail};

/// One delivered copy of a mail transaction, as handed over by the SMTP
/// receiver. A transaction with N recipients yields N of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMail {
    envelope_sender: String,
    envelope_receiver: String,
    data: Vec<u8>,
}

impl ReceivedMail {
    pub fn new(
        envelope_sender: impl Into<String>,
        envelope_receiver: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            envelope_sender: envelope_sender.into(),
            envelope_receiver: envelope_receiver.into(),
            data: data.into(),
        }
    }

    pub fn envelope_sender(&self) -> &str {
        &self.envelope_sender
    }

    pub fn envelope_receiver(&self) -> &str {
        &self.envelope_receiver
    }

    /// Complete raw payload, headers and body.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn parse(&self) -> Result<ParsedMail<'_>, MailParseError> {
        mailparse::parse_mail(&self.data)
    }

    /// First value of the named header, if the payload parses and has it.
    pub fn header(&self, name: &str) -> Option<String> {
        self.parse().ok()?.headers.get_first_value(name)
    }

    pub fn subject(&self) -> Option<String> {
        self.header("Subject")
    }
}
