//! SMTP command parsing for the listener.

use core::fmt::{self, Display, Formatter};

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// The subset of SMTP verbs alert clients need.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// Reverse-path; empty for the null sender `<>`.
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v @ (HeloVariant::Ehlo(id) | HeloVariant::Helo(id))) => {
                write!(f, "{v} {id}")
            }
            Self::MailFrom(path) => write!(f, "MAIL FROM:<{path}>"),
            Self::RcptTo(path) => write!(f, "RCPT TO:<{path}>"),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth { mechanism, .. } => write!(f, "AUTH {mechanism}"),
            Self::Invalid(line) => f.write_str(line),
        }
    }
}

/// Extract the address from a `MAIL FROM:` / `RCPT TO:` argument, tolerating
/// optional angle brackets, surrounding whitespace, and trailing ESMTP
/// parameters (which failmail ignores).
fn parse_path(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let (path, _params) = match rest.split_once(char::is_whitespace) {
        Some((path, params)) => (path, Some(params)),
        None => (rest, None),
    };

    let path = path
        .strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .unwrap_or(path);

    // The null sender <> is valid; a bare ">" or "<" is not.
    if path.contains('<') || path.contains('>') {
        return None;
    }
    Some(path.to_string())
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let trimmed = line.trim();

        if trimmed.len() >= 10 && trimmed[..10].eq_ignore_ascii_case("MAIL FROM:") {
            return parse_path(&trimmed[10..])
                .map(Self::MailFrom)
                .ok_or_else(|| Self::Invalid(line.to_owned()));
        }

        if trimmed.len() >= 8 && trimmed[..8].eq_ignore_ascii_case("RCPT TO:") {
            return match parse_path(&trimmed[8..]) {
                // An empty forward path is meaningless.
                Some(path) if !path.is_empty() => Ok(Self::RcptTo(path)),
                _ => Err(Self::Invalid(line.to_owned())),
            };
        }

        if trimmed.len() >= 4 {
            let verb = &trimmed[..4];
            if verb.eq_ignore_ascii_case("EHLO") || verb.eq_ignore_ascii_case("HELO") {
                return match trimmed.split_once(' ') {
                    None => Err(Self::Invalid(format!("Expected hostname in {trimmed}"))),
                    Some((verb, host)) if verb.eq_ignore_ascii_case("HELO") => {
                        Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                    }
                    Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
                };
            }

            if verb.eq_ignore_ascii_case("AUTH") {
                let mut words = trimmed.split_whitespace().skip(1);
                return match words.next() {
                    Some(mechanism) => Ok(Self::Auth {
                        mechanism: mechanism.to_ascii_uppercase(),
                        initial: words.next().map(str::to_string),
                    }),
                    None => Err(Self::Invalid(line.to_owned())),
                };
            }
        }

        if trimmed.eq_ignore_ascii_case("DATA") {
            Ok(Self::Data)
        } else if trimmed.eq_ignore_ascii_case("RSET") {
            Ok(Self::Rset)
        } else if trimmed.eq_ignore_ascii_case("NOOP") {
            Ok(Self::Noop)
        } else if trimmed.eq_ignore_ascii_case("QUIT") {
            Ok(Self::Quit)
        } else if trimmed.eq_ignore_ascii_case("STARTTLS") {
            Ok(Self::StartTls)
        } else {
            Err(Self::Invalid(line.to_owned()))
        }
    }
}
