//! Per-connection SMTP command state machine
//!
//! Pure and synchronous: the server feeds it one line at a time and acts on
//! the returned `SessionAction`. Only the minimal RFC 5321 command set a
//! capture sink needs is understood.

use std::fmt;

pub const MAX_RECIPIENTS: usize = 100;
pub const MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;
/// RFC 5321 4.5.3.1.4, CRLF included
pub const MAX_COMMAND_LINE_BYTES: usize = 512;
/// RFC 5321 4.5.3.1.6, CRLF included
pub const MAX_TEXT_LINE_BYTES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpResponse {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// Wire form, CRLF terminated; continuation lines use `code-`.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Connected, no HELO/EHLO yet
    Connected,
    /// Greeted, no transaction open
    Ready,
    /// MAIL FROM accepted
    MailFrom,
    /// At least one RCPT TO accepted
    RcptTo,
    /// Reading message content
    Data,
}

/// A completed mail transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub helo: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Reply(SmtpResponse),
    /// DATA finished; the server answers once delivery is done
    Deliver(Transaction),
    /// Nothing to send (content line inside DATA)
    Continue,
    /// Send the reply, then close
    Close(SmtpResponse),
}

pub struct SmtpSession {
    hostname: String,
    state: SmtpState,
    helo: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    data: Vec<u8>,
    oversized: bool,
}

impl SmtpSession {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: SmtpState::Connected,
            helo: None,
            sender: None,
            recipients: Vec::new(),
            data: Vec::new(),
            oversized: false,
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    /// Longest line the next `handle_line` call may be given.
    pub fn max_line_bytes(&self) -> usize {
        match self.state {
            SmtpState::Data => MAX_TEXT_LINE_BYTES,
            _ => MAX_COMMAND_LINE_BYTES,
        }
    }

    pub fn greeting(&self) -> SmtpResponse {
        SmtpResponse::new(220, format!("{} ESMTP mailsink", self.hostname))
    }

    /// Feed one line, including its line terminator if any.
    pub fn handle_line(&mut self, line: &[u8]) -> SessionAction {
        if self.state == SmtpState::Data {
            return self.handle_data_line(line);
        }

        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match text.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (text, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.hello(arg, false),
            "EHLO" => self.hello(arg, true),
            "MAIL" => self.mail(arg),
            "RCPT" => self.rcpt(arg),
            "DATA" => self.start_data(),
            "RSET" => {
                self.reset_transaction();
                SessionAction::Reply(SmtpResponse::ok())
            }
            "NOOP" => SessionAction::Reply(SmtpResponse::ok()),
            "QUIT" => SessionAction::Close(SmtpResponse::new(
                221,
                format!("{} closing connection", self.hostname),
            )),
            "" => SessionAction::Reply(SmtpResponse::new(500, "Syntax error, command unrecognized")),
            _ => SessionAction::Reply(SmtpResponse::new(502, "Command not implemented")),
        }
    }

    fn hello(&mut self, arg: &str, extended: bool) -> SessionAction {
        if arg.is_empty() {
            return SessionAction::Reply(SmtpResponse::new(501, "Domain name required"));
        }
        self.reset_transaction();
        self.helo = Some(arg.to_string());
        self.state = SmtpState::Ready;

        let greeting = format!("{} Hello {}", self.hostname, arg);
        if extended {
            SessionAction::Reply(SmtpResponse::multiline(
                250,
                vec![
                    greeting,
                    "8BITMIME".to_string(),
                    format!("SIZE {}", MAX_MESSAGE_BYTES),
                ],
            ))
        } else {
            SessionAction::Reply(SmtpResponse::new(250, greeting))
        }
    }

    fn mail(&mut self, arg: &str) -> SessionAction {
        match self.state {
            SmtpState::Connected => {
                return SessionAction::Reply(SmtpResponse::new(503, "Send HELO/EHLO first"))
            }
            SmtpState::MailFrom | SmtpState::RcptTo => {
                return SessionAction::Reply(SmtpResponse::new(503, "Sender already specified"))
            }
            _ => {}
        }
        match parse_path(arg, "FROM:") {
            Some(sender) => {
                self.sender = Some(sender);
                self.state = SmtpState::MailFrom;
                SessionAction::Reply(SmtpResponse::ok())
            }
            None => SessionAction::Reply(SmtpResponse::new(501, "Syntax: MAIL FROM:<address>")),
        }
    }

    fn rcpt(&mut self, arg: &str) -> SessionAction {
        if !matches!(self.state, SmtpState::MailFrom | SmtpState::RcptTo) {
            return SessionAction::Reply(SmtpResponse::new(503, "Need MAIL before RCPT"));
        }
        if self.recipients.len() >= MAX_RECIPIENTS {
            return SessionAction::Reply(SmtpResponse::new(452, "Too many recipients"));
        }
        match parse_path(arg, "TO:") {
            Some(recipient) if !recipient.is_empty() => {
                self.recipients.push(recipient);
                self.state = SmtpState::RcptTo;
                SessionAction::Reply(SmtpResponse::ok())
            }
            _ => SessionAction::Reply(SmtpResponse::new(501, "Syntax: RCPT TO:<address>")),
        }
    }

    fn start_data(&mut self) -> SessionAction {
        if self.state != SmtpState::RcptTo {
            return SessionAction::Reply(SmtpResponse::new(503, "Need RCPT before DATA"));
        }
        self.data.clear();
        self.oversized = false;
        self.state = SmtpState::Data;
        SessionAction::Reply(SmtpResponse::new(354, "End data with <CR><LF>.<CR><LF>"))
    }

    fn handle_data_line(&mut self, line: &[u8]) -> SessionAction {
        let content = trim_line_ending(line);
        if content == b"." {
            return self.finish_data();
        }

        // Transparency: a leading dot was doubled by the client.
        let line = if line.starts_with(b"..") { &line[1..] } else { line };
        if self.data.len() + line.len() > MAX_MESSAGE_BYTES {
            self.oversized = true;
        } else {
            self.data.extend_from_slice(line);
        }
        SessionAction::Continue
    }

    fn finish_data(&mut self) -> SessionAction {
        let oversized = self.oversized;
        let transaction = Transaction {
            helo: self.helo.clone().unwrap_or_default(),
            sender: self.sender.clone().unwrap_or_default(),
            recipients: std::mem::take(&mut self.recipients),
            data: std::mem::take(&mut self.data),
        };
        self.reset_transaction();

        if oversized {
            SessionAction::Reply(SmtpResponse::new(552, "Message size exceeds fixed limit"))
        } else {
            SessionAction::Deliver(transaction)
        }
    }

    fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.data.clear();
        self.oversized = false;
        if self.state != SmtpState::Connected {
            self.state = SmtpState::Ready;
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Extract the address from `FROM:<a@b> PARAMS` / `TO:<a@b>`.
fn parse_path(arg: &str, keyword: &str) -> Option<String> {
    let prefix = arg.get(..keyword.len())?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start();
    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        return Some(inner[..end].trim().to_string());
    }
    rest.split_whitespace().next().map(str::to_string)
}
