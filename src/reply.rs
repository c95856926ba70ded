//! SMTP reply values.
//!
//! A [`Reply`] carries a three-digit numeric code and one or more text
//! lines. `Display` renders the RFC 5321 wire form: all lines but the
//! last are `<code>-<text>`, the last is `<code> <text>`, each CRLF
//! terminated.

use core::fmt::{self, Display, Formatter};
use std::{borrow::Cow, str::FromStr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<Cow<'static, str>>,
}

impl Reply {
    #[must_use]
    pub fn new(code: u16, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Append a continuation line.
    #[must_use]
    pub fn with_line(mut self, text: impl Into<Cow<'static, str>>) -> Self {
        self.lines.push(text.into());
        self
    }

    pub fn push(&mut self, text: impl Into<Cow<'static, str>>) {
        self.lines.push(text.into());
    }

    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn lines(&self) -> &[Cow<'static, str>] {
        &self.lines
    }

    /// Permanent rejection (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Temporary rejection (4xx).
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Success or intermediate (2xx/3xx).
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn greeting(host: &str, software: &str) -> Self {
        Self::new(220, format!("{host} ESMTP {software}"))
    }

    pub fn bye(host: &str) -> Self {
        Self::new(221, format!("{host} closing connection"))
    }

    pub fn ok() -> Self {
        Self::new(250, "2.0.0 Ok")
    }

    pub fn mail_ok() -> Self {
        Self::new(250, "2.1.0 Ok")
    }

    pub fn rcpt_ok() -> Self {
        Self::new(250, "2.1.5 Ok")
    }

    pub fn message_accepted() -> Self {
        Self::new(250, "2.6.0 Message accepted")
    }

    pub fn vrfy_unverified() -> Self {
        Self::new(
            252,
            "2.1.5 Cannot VRFY user, but will accept message and attempt delivery",
        )
    }

    pub fn help(verbs: &str) -> Self {
        Self::new(214, format!("2.0.0 Supported commands: {verbs}"))
    }

    pub fn auth_successful() -> Self {
        Self::new(235, "2.7.0 Authentication successful")
    }

    pub fn challenge(data: impl Into<Cow<'static, str>>) -> Self {
        Self::new(334, data)
    }

    pub fn start_mail_input() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn ready_to_start_tls() -> Self {
        Self::new(220, "Ready to start TLS")
    }

    pub fn shutting_down(host: &str) -> Self {
        Self::new(421, format!("{host} Service shutting down"))
    }

    pub fn too_many_connections(host: &str) -> Self {
        Self::new(421, format!("{host} Too many connections, try again later"))
    }

    pub fn timeout() -> Self {
        Self::new(421, "4.4.2 Timeout, closing connection")
    }

    pub fn too_many_recipients() -> Self {
        Self::new(452, "4.5.3 Too many recipients")
    }

    pub fn tls_unavailable() -> Self {
        Self::new(454, "4.7.0 TLS not available")
    }

    pub fn command_unrecognized() -> Self {
        Self::new(500, "5.5.1 Error: command not recognized")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "5.5.4 Line too long")
    }

    pub fn syntax_error(detail: impl Into<Cow<'static, str>>) -> Self {
        let detail = detail.into();
        if detail.is_empty() {
            Self::new(501, "5.5.4 Syntax error in parameters")
        } else {
            Self::new(501, format!("5.5.4 Syntax error in parameters: {detail}"))
        }
    }

    pub fn auth_aborted() -> Self {
        Self::new(501, "Authentication aborted")
    }

    pub fn cannot_decode() -> Self {
        Self::new(501, "5.5.2 Cannot decode response")
    }

    pub fn not_implemented() -> Self {
        Self::new(502, "5.5.1 Command not implemented")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, "5.5.1 Bad sequence of commands")
    }

    pub fn parameter_not_implemented(param: &str) -> Self {
        Self::new(504, format!("5.5.4 Parameter not implemented: {param}"))
    }

    pub fn unrecognized_auth_type() -> Self {
        Self::new(504, "5.5.4 Unrecognized authentication type")
    }

    pub fn not_accepting(host: &str) -> Self {
        Self::new(521, format!("{host} does not accept mail"))
    }

    pub fn auth_required() -> Self {
        Self::new(530, "5.7.0 Authentication required")
    }

    pub fn tls_required() -> Self {
        Self::new(530, "5.7.0 Must issue a STARTTLS command first")
    }

    pub fn auth_failed() -> Self {
        Self::new(535, "5.7.8 Authentication failed")
    }

    pub fn rejected() -> Self {
        Self::new(550, "5.7.1 Rejected")
    }

    pub fn size_exceeded() -> Self {
        Self::new(552, "5.3.4 Message size exceeds fixed limit")
    }

    pub fn transaction_failed() -> Self {
        Self::new(554, "5.0.0 Transaction failed")
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        for (idx, line) in self.lines.iter().enumerate() {
            let separator = if idx == last { ' ' } else { '-' };
            write!(fmt, "{}{}{}\r\n", self.code, separator, line)?;
        }
        Ok(())
    }
}

/// Error from [`Reply::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyParseError {
    #[error("Empty reply")]
    Empty,
    #[error("Reply line missing CRLF terminator")]
    MissingTerminator,
    #[error("Reply code is not three digits: {0}")]
    BadCode(String),
    #[error("Continuation line code {found} does not match {expected}")]
    CodeMismatch { expected: u16, found: u16 },
    #[error("Invalid separator after reply code")]
    BadSeparator,
    #[error("Continuation line after final line")]
    TrailingData,
}

impl FromStr for Reply {
    type Err = ReplyParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(ReplyParseError::Empty);
        }

        let mut code = None;
        let mut lines = Vec::new();
        let mut finished = false;

        let mut rest = input;
        while !rest.is_empty() {
            let Some(end) = rest.find("\r\n") else {
                return Err(ReplyParseError::MissingTerminator);
            };
            let line = &rest[..end];
            rest = &rest[end + 2..];

            if finished {
                return Err(ReplyParseError::TrailingData);
            }

            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(ReplyParseError::BadCode(line.to_string()));
            }
            let (digits, tail) = line.split_at(3);
            let parsed: u16 = digits
                .parse()
                .map_err(|_| ReplyParseError::BadCode(digits.to_string()))?;

            match code {
                None => code = Some(parsed),
                Some(expected) if expected != parsed => {
                    return Err(ReplyParseError::CodeMismatch {
                        expected,
                        found: parsed,
                    });
                }
                Some(_) => {}
            }

            let text = match tail.as_bytes().first() {
                None => {
                    finished = true;
                    ""
                }
                Some(b' ') => {
                    finished = true;
                    &tail[1..]
                }
                Some(b'-') => &tail[1..],
                Some(_) => return Err(ReplyParseError::BadSeparator),
            };
            lines.push(Cow::Owned(text.to_string()));
        }

        if !finished {
            return Err(ReplyParseError::MissingTerminator);
        }

        Ok(Self {
            code: code.ok_or(ReplyParseError::Empty)?,
            lines,
        })
    }
}
