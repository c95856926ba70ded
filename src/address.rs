//! RFC 5321 path parsing for MAIL FROM and RCPT TO arguments.
//!
//! Implements the Reverse-path / Forward-path grammar of RFC 5321
//! Section 4.1.2 as one forward scan over the input: angle brackets,
//! an optional (discarded) source route, a dot-string or quoted-string
//! local part, then a domain or address literal. Octet limits are 256
//! for the path, 64 for the local part, 255 for the domain.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AddressError>;

const MAX_PATH: usize = 256;
const MAX_LOCAL_PART: usize = 64;
const MAX_DOMAIN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("{part} exceeds {limit} octets")]
    TooLong { part: &'static str, limit: usize },

    #[error("address must be enclosed in '<' and '>'")]
    Unbracketed,

    /// Anything the grammar refuses, with the byte offset the scan
    /// stopped at.
    #[error("malformed address at offset {at}: {reason}")]
    Malformed { at: usize, reason: &'static str },
}

/// An SMTP mailbox, split at the '@'. A quoted local part keeps its
/// quotes; a literal domain keeps its brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: String,
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// Parse a MAIL FROM argument. `<>` is the null sender.
///
/// # Errors
///
/// Returns `AddressError` when the input is not `<>` and not a valid
/// path.
pub fn parse_reverse_path(input: &str) -> Result<Option<Mailbox>> {
    let path = input.trim();
    if path == "<>" {
        return Ok(None);
    }
    parse_path(path).map(Some)
}

/// Parse a RCPT TO argument. The null path is not accepted here.
///
/// # Errors
///
/// Returns `AddressError` when the input is not a valid path.
pub fn parse_forward_path(input: &str) -> Result<Mailbox> {
    parse_path(input.trim())
}

fn parse_path(path: &str) -> Result<Mailbox> {
    if path.is_empty() {
        return Err(AddressError::Empty);
    }
    if path.len() > MAX_PATH {
        return Err(AddressError::TooLong {
            part: "path",
            limit: MAX_PATH,
        });
    }
    if !path.is_ascii() {
        return Err(AddressError::Malformed {
            at: 0,
            reason: "path must be ASCII",
        });
    }

    let mut scanner = Scanner { input: path, pos: 0 };

    if !scanner.eat(b'<') {
        return Err(AddressError::Unbracketed);
    }
    if scanner.peek() == Some(b'@') {
        scanner.skip_source_route()?;
    }

    let local_part = scanner.local_part()?;
    if !scanner.eat(b'@') {
        return Err(scanner.fail("expected '@'"));
    }
    let domain = scanner.domain()?;

    if !scanner.eat(b'>') || !scanner.at_end() {
        return Err(scanner.fail("expected '>' at end of path"));
    }

    Ok(Mailbox { local_part, domain })
}

/// Byte cursor over an ASCII path.
struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl Scanner<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos == self.input.len()
    }

    fn fail(&self, reason: &'static str) -> AddressError {
        AddressError::Malformed {
            at: self.pos,
            reason,
        }
    }

    /// A-d-l: `@domain[,@domain]*:`. Deprecated; consumed and thrown
    /// away up to the ':'.
    fn skip_source_route(&mut self) -> Result<()> {
        loop {
            match self.bump() {
                Some(b':') => return Ok(()),
                Some(b'>') | None => return Err(self.fail("unterminated source route")),
                Some(_) => {}
            }
        }
    }

    /// Local-part = Dot-string / Quoted-string.
    fn local_part(&mut self) -> Result<String> {
        let start = self.pos;

        if self.eat(b'"') {
            self.quoted_string()?;
        } else {
            self.dot_string()?;
        }

        let local = &self.input[start..self.pos];
        if local.len() > MAX_LOCAL_PART {
            return Err(AddressError::TooLong {
                part: "local part",
                limit: MAX_LOCAL_PART,
            });
        }
        Ok(local.to_string())
    }

    /// Remainder of a quoted string, opening quote already consumed.
    /// quoted-pairSMTP allows '\' before any printable byte or space.
    fn quoted_string(&mut self) -> Result<()> {
        loop {
            match self.bump() {
                None => return Err(self.fail("unterminated quoted string")),
                Some(b'"') => return Ok(()),
                Some(b'\\') => match self.bump() {
                    Some(escaped) if (b' '..=b'~').contains(&escaped) => {}
                    _ => return Err(self.fail("invalid escape in quoted string")),
                },
                // qtextSMTP: printable ASCII minus '"' and '\'
                Some(32..=33 | 35..=91 | 93..=126) => {}
                Some(_) => return Err(self.fail("control byte in quoted string")),
            }
        }
    }

    /// Dot-string = Atom *("." Atom).
    fn dot_string(&mut self) -> Result<()> {
        loop {
            let mut atom_len = 0;
            while let Some(byte) = self.peek() {
                if !is_atom_byte(byte) {
                    break;
                }
                self.pos += 1;
                atom_len += 1;
            }

            if atom_len == 0 {
                return Err(self.fail("expected atom in local part"));
            }
            if !self.eat(b'.') {
                return Ok(());
            }
        }
    }

    /// Domain or address-literal, returned verbatim.
    fn domain(&mut self) -> Result<String> {
        let start = self.pos;

        if self.eat(b'[') {
            self.address_literal()?;
        } else {
            self.dotted_labels()?;
        }

        let domain = &self.input[start..self.pos];
        if domain.len() > MAX_DOMAIN {
            return Err(AddressError::TooLong {
                part: "domain",
                limit: MAX_DOMAIN,
            });
        }
        Ok(domain.to_string())
    }

    /// Labels separated by dots. A label is alphanumeric at both ends
    /// and may carry hyphens in between (Let-dig [Ldh-str]).
    fn dotted_labels(&mut self) -> Result<()> {
        loop {
            let mut previous = None;
            while let Some(byte) = self.peek() {
                let legal =
                    byte.is_ascii_alphanumeric() || (byte == b'-' && previous.is_some());
                if !legal {
                    break;
                }
                self.pos += 1;
                previous = Some(byte);
            }

            match previous {
                None => return Err(self.fail("expected domain label")),
                Some(b'-') => return Err(self.fail("domain label ends with '-'")),
                Some(_) => {}
            }
            if !self.eat(b'.') {
                return Ok(());
            }
        }
    }

    /// `[IPv4]`, `[IPv6:...]`, or `[tag:opaque]`, opening bracket
    /// already consumed.
    fn address_literal(&mut self) -> Result<()> {
        let content_start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b']' || byte == b'>' {
                break;
            }
            self.pos += 1;
        }

        let content = &self.input[content_start..self.pos];
        if !self.eat(b']') {
            return Err(self.fail("unterminated address literal"));
        }

        let valid = if let Some(v6) = content.strip_prefix("IPv6:") {
            v6.parse::<Ipv6Addr>().is_ok()
        } else if let Some((tag, rest)) = content.split_once(':') {
            // General-address-literal; the tagged payload is opaque
            !tag.is_empty() && !rest.is_empty() && tag.bytes().all(|b| b.is_ascii_alphanumeric())
        } else {
            content.parse::<Ipv4Addr>().is_ok()
        };

        if valid {
            Ok(())
        } else {
            Err(AddressError::Malformed {
                at: content_start,
                reason: "invalid address literal",
            })
        }
    }
}

fn is_atom_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-/=?^_`{|}~".contains(&byte)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_sender() {
        assert_eq!(parse_reverse_path("<>").unwrap(), None);
        assert_eq!(parse_reverse_path(" <> ").unwrap(), None);
    }

    #[test]
    fn plain_mailbox() {
        let mailbox = parse_reverse_path("<user@example.com>").unwrap().unwrap();
        assert_eq!(mailbox.local_part, "user");
        assert_eq!(mailbox.domain, "example.com");
        assert_eq!(mailbox.to_string(), "user@example.com");
    }

    #[test]
    fn forward_path_rejects_null() {
        assert!(parse_forward_path("<>").is_err());
        assert_eq!(parse_forward_path(""), Err(AddressError::Empty));
    }

    #[test]
    fn source_route_discarded() {
        let mailbox = parse_forward_path("<@relay1.test,@relay2.test:user@example.com>").unwrap();
        assert_eq!(mailbox.to_string(), "user@example.com");

        assert!(parse_forward_path("<@no-colon.test>").is_err());
    }

    #[test]
    fn brackets_required() {
        assert_eq!(
            parse_forward_path("user@example.com"),
            Err(AddressError::Unbracketed)
        );
        assert!(matches!(
            parse_forward_path("<user@example.com"),
            Err(AddressError::Malformed { .. })
        ));
        assert!(parse_forward_path("<user@example.com> x").is_err());
    }

    #[test]
    fn quoted_locals() {
        let mailbox = parse_forward_path("<\"john doe\"@example.com>").unwrap();
        assert_eq!(mailbox.local_part, "\"john doe\"");

        let mailbox = parse_forward_path("<\"with@sign\"@example.com>").unwrap();
        assert_eq!(mailbox.local_part, "\"with@sign\"");

        let mailbox = parse_forward_path("<\"esc\\\"aped\"@example.com>").unwrap();
        assert_eq!(mailbox.local_part, "\"esc\\\"aped\"");

        assert!(parse_forward_path("<\"unclosed@example.com>").is_err());
    }

    #[test]
    fn dot_string_shape() {
        assert!(parse_forward_path("<a.b.c@example.com>").is_ok());
        assert!(parse_forward_path("<.leading@example.com>").is_err());
        assert!(parse_forward_path("<trailing.@example.com>").is_err());
        assert!(parse_forward_path("<dou..ble@example.com>").is_err());
        assert!(parse_forward_path("<sp ace@example.com>").is_err());
    }

    #[test]
    fn domain_labels() {
        assert!(parse_forward_path("<a@sub-domain.example.com>").is_ok());
        assert!(parse_forward_path("<a@-bad.example.com>").is_err());
        assert!(parse_forward_path("<a@bad-.example.com>").is_err());
        assert!(parse_forward_path("<a@under_score.com>").is_err());
        assert!(parse_forward_path("<a@b..c>").is_err());
        assert!(parse_forward_path("<a@b.>").is_err());
        assert!(parse_forward_path("<a@>").is_err());
    }

    #[test]
    fn address_literals() {
        assert_eq!(
            parse_forward_path("<a@[127.0.0.1]>").unwrap().domain,
            "[127.0.0.1]"
        );
        assert!(parse_forward_path("<a@[IPv6:::1]>").is_ok());
        assert!(parse_forward_path("<a@[tag:payload]>").is_ok());
        assert!(parse_forward_path("<a@[999.0.0.1]>").is_err());
        assert!(parse_forward_path("<a@[IPv6:zzzz]>").is_err());
        assert!(parse_forward_path("<a@[127.0.0.1>").is_err());
    }

    #[test]
    fn octet_limits() {
        let long_local = format!("<{}@example.com>", "a".repeat(65));
        assert_eq!(
            parse_forward_path(&long_local),
            Err(AddressError::TooLong {
                part: "local part",
                limit: 64,
            })
        );

        let long_path = format!("<a@{}>", "b".repeat(300));
        assert_eq!(
            parse_forward_path(&long_path),
            Err(AddressError::TooLong {
                part: "path",
                limit: 256,
            })
        );
    }

    #[test]
    fn offsets_point_at_the_problem() {
        let Err(AddressError::Malformed { at, .. }) = parse_forward_path("<a@b_c>") else {
            panic!("expected a malformed-address error");
        };
        // The scan stops on the underscore
        assert_eq!(at, 4);
    }
}
