//! Command verbs, the dispatch registry, and argument parsing.
//!
//! Verbs are matched case-insensitively against the first
//! space-delimited token of a line. Each registered verb carries its
//! dispatch gates: whether it may run before HELO/EHLO, and whether it
//! is exempt from the require-TLS and require-auth policies. The
//! remainder of the line is handed to the per-verb argument parser
//! untouched apart from the single separating space.

use core::fmt::{self, Display, Formatter};

use crate::address::{self, Mailbox};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Auth,
    Vrfy,
    Expn,
    Help,
}

/// Registry entry: the verb plus its availability gates.
#[derive(Clone, Copy, Debug)]
pub struct Spec {
    pub verb: Verb,
    /// May the verb run before HELO/EHLO has been accepted?
    pub pre_helo: bool,
    /// Is the verb usable while `require_tls` is unsatisfied?
    pub tls_exempt: bool,
    /// Is the verb usable while `require_auth` is unsatisfied?
    pub auth_exempt: bool,
}

pub static REGISTRY: phf::Map<&'static str, Spec> = phf::phf_map! {
    "HELO" => Spec { verb: Verb::Helo, pre_helo: true, tls_exempt: true, auth_exempt: true },
    "EHLO" => Spec { verb: Verb::Ehlo, pre_helo: true, tls_exempt: true, auth_exempt: true },
    "MAIL" => Spec { verb: Verb::Mail, pre_helo: false, tls_exempt: false, auth_exempt: false },
    "RCPT" => Spec { verb: Verb::Rcpt, pre_helo: false, tls_exempt: false, auth_exempt: false },
    "DATA" => Spec { verb: Verb::Data, pre_helo: false, tls_exempt: false, auth_exempt: false },
    "RSET" => Spec { verb: Verb::Rset, pre_helo: true, tls_exempt: true, auth_exempt: true },
    "NOOP" => Spec { verb: Verb::Noop, pre_helo: true, tls_exempt: true, auth_exempt: true },
    "QUIT" => Spec { verb: Verb::Quit, pre_helo: true, tls_exempt: true, auth_exempt: true },
    "STARTTLS" => Spec { verb: Verb::StartTls, pre_helo: false, tls_exempt: true, auth_exempt: true },
    "AUTH" => Spec { verb: Verb::Auth, pre_helo: false, tls_exempt: false, auth_exempt: true },
    "VRFY" => Spec { verb: Verb::Vrfy, pre_helo: false, tls_exempt: false, auth_exempt: false },
    "EXPN" => Spec { verb: Verb::Expn, pre_helo: false, tls_exempt: false, auth_exempt: false },
    "HELP" => Spec { verb: Verb::Help, pre_helo: true, tls_exempt: false, auth_exempt: false },
};

/// Message body transfer mode negotiated via `BODY=` (RFC 1652).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BodyMode {
    #[default]
    SevenBit,
    EightBitMime,
}

/// Parameters accepted on MAIL FROM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailParameters {
    /// `SIZE=<n>` (RFC 1870) declared message size.
    pub size: Option<usize>,
    /// `BODY=7BIT|8BITMIME` (RFC 1652).
    pub body: Option<BodyMode>,
    /// `AUTH=<mailbox-or-<>>` (RFC 4954). Stored, not acted on.
    pub auth: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom {
        reverse_path: Option<Mailbox>,
        params: MailParameters,
    },
    RcptTo {
        forward_path: Mailbox,
    },
    Data,
    Rset,
    Noop,
    Quit,
    StartTls {
        has_argument: bool,
    },
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Vrfy(String),
    Expn(String),
    Help,
}

/// Why a line failed to parse into a [`Command`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Verb not in the registry (500 5.5.1).
    #[error("Command not recognized")]
    Unknown,
    /// Malformed argument (501 5.5.4).
    #[error("Syntax error: {0}")]
    Syntax(String),
    /// Recognized command, unrecognized parameter (504 5.5.4).
    #[error("Parameter not implemented: {0}")]
    UnsupportedParameter(String),
}

/// Split a command line into its verb token and the argument rest.
#[must_use]
pub fn split_verb(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, ""),
    }
}

/// Look up a verb's registry entry, case-insensitively.
#[must_use]
pub fn lookup(verb: &str) -> Option<&'static Spec> {
    if verb.len() > 8 || !verb.is_ascii() {
        return None;
    }
    REGISTRY.get(verb.to_ascii_uppercase().as_str())
}

impl Command {
    /// Parse the argument portion of a line for a registered verb.
    ///
    /// # Errors
    ///
    /// `CommandError::Syntax` for malformed arguments,
    /// `CommandError::UnsupportedParameter` for unknown ESMTP
    /// parameters.
    pub fn parse(spec: &Spec, args: &str) -> Result<Self, CommandError> {
        match spec.verb {
            Verb::Helo => host_argument(args).map(Self::Helo),
            Verb::Ehlo => host_argument(args).map(Self::Ehlo),
            Verb::Mail => parse_mail(args),
            Verb::Rcpt => parse_rcpt(args),
            Verb::Data => no_argument(args).map(|()| Self::Data),
            Verb::Rset => no_argument(args).map(|()| Self::Rset),
            Verb::Noop => Ok(Self::Noop),
            Verb::Quit => Ok(Self::Quit),
            Verb::StartTls => Ok(Self::StartTls {
                has_argument: !args.trim().is_empty(),
            }),
            Verb::Auth => parse_auth(args),
            Verb::Vrfy => Ok(Self::Vrfy(args.trim().to_string())),
            Verb::Expn => Ok(Self::Expn(args.trim().to_string())),
            Verb::Help => Ok(Self::Help),
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(host) => write!(fmt, "HELO {host}"),
            Self::Ehlo(host) => write!(fmt, "EHLO {host}"),
            Self::MailFrom { reverse_path, .. } => write!(
                fmt,
                "MAIL FROM:<{}>",
                reverse_path
                    .as_ref()
                    .map_or_else(String::new, ToString::to_string)
            ),
            Self::RcptTo { forward_path } => write!(fmt, "RCPT TO:<{forward_path}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls { .. } => fmt.write_str("STARTTLS"),
            // Never echo credentials back into the logs
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::Vrfy(arg) => write!(fmt, "VRFY {arg}"),
            Self::Expn(arg) => write!(fmt, "EXPN {arg}"),
            Self::Help => fmt.write_str("HELP"),
        }
    }
}

fn host_argument(args: &str) -> Result<String, CommandError> {
    let host = args.trim();
    if host.is_empty() {
        return Err(CommandError::Syntax("expected hostname".to_string()));
    }
    Ok(host.to_string())
}

fn no_argument(args: &str) -> Result<(), CommandError> {
    if args.trim().is_empty() {
        Ok(())
    } else {
        Err(CommandError::Syntax("no argument allowed".to_string()))
    }
}

fn parse_mail(args: &str) -> Result<Command, CommandError> {
    let rest = strip_keyword(args, "FROM:")
        .ok_or_else(|| CommandError::Syntax("expected FROM:<reverse-path>".to_string()))?;

    let (path, params) = split_path(rest.trim_start());

    let reverse_path =
        address::parse_reverse_path(path).map_err(|e| CommandError::Syntax(e.to_string()))?;

    Ok(Command::MailFrom {
        reverse_path,
        params: parse_mail_parameters(params)?,
    })
}

fn parse_rcpt(args: &str) -> Result<Command, CommandError> {
    let rest = strip_keyword(args, "TO:")
        .ok_or_else(|| CommandError::Syntax("expected TO:<forward-path>".to_string()))?;

    let (path, params) = split_path(rest.trim_start());

    let forward_path =
        address::parse_forward_path(path).map_err(|e| CommandError::Syntax(e.to_string()))?;

    // No RCPT parameters (DSN and friends) are advertised
    if let Some(param) = params.split_whitespace().next() {
        let name = param.split('=').next().unwrap_or(param);
        return Err(CommandError::UnsupportedParameter(name.to_string()));
    }

    Ok(Command::RcptTo { forward_path })
}

fn parse_auth(args: &str) -> Result<Command, CommandError> {
    let mut parts = args.split_whitespace();
    let mechanism = parts
        .next()
        .ok_or_else(|| CommandError::Syntax("expected mechanism".to_string()))?
        .to_ascii_uppercase();
    let initial = parts.next().map(ToString::to_string);

    if parts.next().is_some() {
        return Err(CommandError::Syntax("too many arguments".to_string()));
    }

    Ok(Command::Auth { mechanism, initial })
}

fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let head = args.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &args[keyword.len()..])
}

/// Split `<path> [params...]` at the closing angle bracket, honoring
/// quoted local parts which may contain '>'.
fn split_path(rest: &str) -> (&str, &str) {
    if !rest.starts_with('<') {
        return match rest.find(' ') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, ""),
        };
    }

    let mut in_quotes = false;
    let mut escaped = false;

    for (i, ch) in rest.char_indices() {
        if ch == '"' && !escaped {
            in_quotes = !in_quotes;
        } else if ch == '>' && !in_quotes {
            return (&rest[..=i], &rest[i + 1..]);
        }
        escaped = ch == '\\' && !escaped;
    }

    (rest, "")
}

fn parse_mail_parameters(params: &str) -> Result<MailParameters, CommandError> {
    let mut parsed = MailParameters::default();

    for param in params.split_whitespace() {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));

        if key.eq_ignore_ascii_case("SIZE") {
            if parsed.size.is_some() {
                return Err(CommandError::Syntax("duplicate SIZE parameter".to_string()));
            }
            parsed.size = Some(
                value
                    .parse()
                    .map_err(|_| CommandError::Syntax(format!("bad SIZE value '{value}'")))?,
            );
        } else if key.eq_ignore_ascii_case("BODY") {
            parsed.body = Some(if value.eq_ignore_ascii_case("7BIT") {
                BodyMode::SevenBit
            } else if value.eq_ignore_ascii_case("8BITMIME") {
                BodyMode::EightBitMime
            } else {
                return Err(CommandError::Syntax(format!("bad BODY value '{value}'")));
            });
        } else if key.eq_ignore_ascii_case("AUTH") {
            parsed.auth = Some(value.to_string());
        } else {
            return Err(CommandError::UnsupportedParameter(key.to_string()));
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod test {
    use super::*;

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations/blob/master/src/lib.rs#L97
    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    fn parse_line(line: &str) -> Result<Command, CommandError> {
        let (verb, args) = split_verb(line);
        let spec = lookup(verb).ok_or(CommandError::Unknown)?;
        Command::parse(spec, args)
    }

    #[test]
    fn verb_lookup_case_insensitive() {
        for verb in string_casing("mail") {
            assert!(matches!(lookup(&verb), Some(spec) if spec.verb == Verb::Mail));
        }
        for verb in string_casing("quit") {
            assert!(matches!(lookup(&verb), Some(spec) if spec.verb == Verb::Quit));
        }
        assert!(lookup("BOGUS").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn mail_from_command() {
        let command = parse_line("MAIL FROM:<test@example.com>").unwrap();
        assert!(matches!(
            command,
            Command::MailFrom { reverse_path: Some(ref mailbox), .. }
                if mailbox.to_string() == "test@example.com"
        ));

        assert_eq!(
            parse_line("MAIL FROM:<>"),
            Ok(Command::MailFrom {
                reverse_path: None,
                params: MailParameters::default(),
            })
        );

        assert!(parse_line("MAIL FROM:").is_err());
        assert!(parse_line("MAIL FROM:garbage").is_err());
        assert!(parse_line("MAIL TO:<a@b.test>").is_err());
    }

    #[test]
    fn mail_from_size_parameter() {
        let command = parse_line("MAIL FROM:<test@example.com> SIZE=12345").unwrap();
        assert!(matches!(
            command,
            Command::MailFrom { ref params, .. } if params.size == Some(12345)
        ));

        assert!(matches!(
            parse_line("MAIL FROM:<> SIZE=1000"),
            Ok(Command::MailFrom { ref params, .. }) if params.size == Some(1000)
        ));

        // Case-insensitive parameter name
        assert!(matches!(
            parse_line("MAIL FROM:<a@b.test> size=5000"),
            Ok(Command::MailFrom { ref params, .. }) if params.size == Some(5000)
        ));

        // Duplicates and malformed values are syntax errors
        assert!(matches!(
            parse_line("MAIL FROM:<a@b.test> SIZE=1 SIZE=2"),
            Err(CommandError::Syntax(_))
        ));
        assert!(matches!(
            parse_line("MAIL FROM:<a@b.test> SIZE=abc"),
            Err(CommandError::Syntax(_))
        ));
    }

    #[test]
    fn mail_from_body_and_auth_parameters() {
        assert!(matches!(
            parse_line("MAIL FROM:<a@b.test> BODY=8BITMIME"),
            Ok(Command::MailFrom { ref params, .. }) if params.body == Some(BodyMode::EightBitMime)
        ));
        assert!(matches!(
            parse_line("MAIL FROM:<a@b.test> BODY=7BIT"),
            Ok(Command::MailFrom { ref params, .. }) if params.body == Some(BodyMode::SevenBit)
        ));
        assert!(matches!(
            parse_line("MAIL FROM:<a@b.test> BODY=BINARYMIME"),
            Err(CommandError::Syntax(_))
        ));
        assert!(matches!(
            parse_line("MAIL FROM:<a@b.test> AUTH=<>"),
            Ok(Command::MailFrom { ref params, .. }) if params.auth.as_deref() == Some("<>")
        ));
    }

    #[test]
    fn mail_from_unknown_parameter() {
        assert_eq!(
            parse_line("MAIL FROM:<a@b.test> RET=FULL"),
            Err(CommandError::UnsupportedParameter("RET".to_string()))
        );
    }

    #[test]
    fn rcpt_to_command() {
        let command = parse_line("RCPT TO:<user@example.com>").unwrap();
        assert!(matches!(
            command,
            Command::RcptTo { ref forward_path } if forward_path.to_string() == "user@example.com"
        ));

        assert!(parse_line("RCPT TO:").is_err());
        assert!(parse_line("RCPT TO:<>").is_err());
        assert_eq!(
            parse_line("RCPT TO:<user@example.com> NOTIFY=SUCCESS"),
            Err(CommandError::UnsupportedParameter("NOTIFY".to_string()))
        );

        for comm in string_casing("rcpt to") {
            let line = format!("{comm}:<user@example.com>");
            assert!(
                matches!(parse_line(&line), Ok(Command::RcptTo { .. })),
                "'{line}' should parse"
            );
        }
    }

    #[test]
    fn quoted_path_with_closing_bracket() {
        let command = parse_line("MAIL FROM:<\"a>b\"@example.com> SIZE=10").unwrap();
        assert!(matches!(
            command,
            Command::MailFrom { reverse_path: Some(ref mailbox), ref params }
                if mailbox.local_part == "\"a>b\"" && params.size == Some(10)
        ));
    }

    #[test]
    fn helo_ehlo_command() {
        assert!(parse_line("EHLO").is_err());
        assert!(parse_line("HELO").is_err());

        assert_eq!(
            parse_line("EHLO client.example.com"),
            Ok(Command::Ehlo("client.example.com".to_string()))
        );
        assert_eq!(
            parse_line("HELO client.example.com"),
            Ok(Command::Helo("client.example.com".to_string()))
        );

        for comm in string_casing("ehlo") {
            assert!(
                matches!(parse_line(&format!("{comm} test")), Ok(Command::Ehlo(_))),
                "'{comm}' should map to EHLO"
            );
        }
    }

    #[test]
    fn auth_command() {
        assert_eq!(
            parse_line("AUTH PLAIN"),
            Ok(Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: None,
            })
        );
        assert_eq!(
            parse_line("AUTH plain AGFAcA=="),
            Ok(Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AGFAcA==".to_string()),
            })
        );
        assert!(parse_line("AUTH").is_err());
        assert!(parse_line("AUTH PLAIN a b").is_err());
    }

    #[test]
    fn bare_verbs() {
        assert_eq!(parse_line("DATA"), Ok(Command::Data));
        assert_eq!(parse_line("RSET"), Ok(Command::Rset));
        assert_eq!(parse_line("NOOP"), Ok(Command::Noop));
        assert_eq!(parse_line("QUIT"), Ok(Command::Quit));
        assert_eq!(
            parse_line("STARTTLS"),
            Ok(Command::StartTls {
                has_argument: false
            })
        );
        assert_eq!(
            parse_line("STARTTLS now"),
            Ok(Command::StartTls { has_argument: true })
        );

        // DATA and RSET take no argument
        assert!(parse_line("DATA now").is_err());
        assert!(parse_line("RSET please").is_err());

        for comm in string_casing("data") {
            assert_eq!(parse_line(&comm), Ok(Command::Data));
        }
    }

    #[test]
    fn gates() {
        assert!(lookup("HELO").unwrap().pre_helo);
        assert!(lookup("RSET").unwrap().pre_helo);
        assert!(!lookup("MAIL").unwrap().pre_helo);
        assert!(!lookup("STARTTLS").unwrap().pre_helo);

        assert!(lookup("STARTTLS").unwrap().tls_exempt);
        assert!(!lookup("AUTH").unwrap().tls_exempt);
        assert!(lookup("AUTH").unwrap().auth_exempt);
        assert!(!lookup("HELP").unwrap().tls_exempt);
        assert!(!lookup("MAIL").unwrap().auth_exempt);
    }

    #[test]
    fn credentials_not_logged() {
        let command = parse_line("AUTH PLAIN AGFAcA==").unwrap();
        assert_eq!(command.to_string(), "AUTH PLAIN");
    }
}
