//! SMTP command parsing and reply encoding.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::GatewayError;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Mail {
        address: String,
        /// Declared `SIZE=` parameter, if any.
        size: Option<usize>,
    },
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Vrfy,
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    Unknown(String),
}

/// A command line that was recognized but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SyntaxError(pub String);

impl Command {
    /// Parse one command line (trailing CRLF allowed).
    pub fn parse(line: &str) -> Result<Self, SyntaxError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_uppercase().as_str() {
            "HELO" => Self::Helo(require_domain(args)?),
            "EHLO" => Self::Ehlo(require_domain(args)?),
            "MAIL" => {
                let rest = strip_keyword(args, "FROM:")
                    .ok_or_else(|| SyntaxError("Syntax: MAIL FROM:<address>".into()))?;
                let (address, params) = extract_path(rest)?;
                Self::Mail {
                    address: address.to_string(),
                    size: size_param(params)?,
                }
            }
            "RCPT" => {
                let rest = strip_keyword(args, "TO:")
                    .ok_or_else(|| SyntaxError("Syntax: RCPT TO:<address>".into()))?;
                let (address, _params) = extract_path(rest)?;
                if address.is_empty() {
                    return Err(SyntaxError("Null recipient not permitted".into()));
                }
                Self::Rcpt(address.to_string())
            }
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "VRFY" => Self::Vrfy,
            "QUIT" => Self::Quit,
            "STARTTLS" => Self::StartTls,
            "AUTH" => {
                let mut parts = args.split_whitespace();
                let mechanism = parts
                    .next()
                    .ok_or_else(|| SyntaxError("Syntax: AUTH mechanism".into()))?
                    .to_ascii_uppercase();
                Self::Auth {
                    mechanism,
                    initial_response: parts.next().map(str::to_string),
                }
            }
            _ => Self::Unknown(line.to_string()),
        };
        Ok(command)
    }
}

fn require_domain(args: &str) -> Result<String, SyntaxError> {
    if args.is_empty() {
        return Err(SyntaxError("Syntax: HELO/EHLO hostname".into()));
    }
    Ok(args.to_string())
}

/// Case-insensitive `FROM:` / `TO:` prefix, tolerating a space after the colon.
fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let head = args.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| args[keyword.len()..].trim_start())
}

/// Split `<path> params` into the address and the parameter string.
fn extract_path(rest: &str) -> Result<(&str, &str), SyntaxError> {
    match rest.strip_prefix('<') {
        Some(inner) => {
            let end = inner
                .find('>')
                .ok_or_else(|| SyntaxError(format!("expected '>' in {rest:?}")))?;
            Ok((inner[..end].trim(), inner[end + 1..].trim()))
        }
        None => match rest.split_once(' ') {
            Some((address, params)) => Ok((address, params.trim())),
            None => Ok((rest, "")),
        },
    }
}

fn size_param(params: &str) -> Result<Option<usize>, SyntaxError> {
    for param in params.split_whitespace() {
        if let Some((key, value)) = param.split_once('=')
            && key.eq_ignore_ascii_case("SIZE")
        {
            let size = value
                .parse()
                .map_err(|_| SyntaxError(format!("invalid SIZE parameter: {value}")))?;
            return Ok(Some(size));
        }
    }
    Ok(None)
}

/// A server reply; multi-line when `lines` has more than one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline<I, S>(code: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code,
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Wire form: `250-first\r\n250 last\r\n`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{sep}{line}\r\n", self.code));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        out
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.encode().as_bytes()).await?;
        writer.flush().await
    }
}

impl From<&GatewayError> for Reply {
    /// Permanent addressing and parse problems are 5xx; everything that may
    /// succeed on retry is 4xx.
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Rejected { .. } => Reply::new(554, format!("5.7.1 {err}")),
            GatewayError::Dispatch(e) if e.is_permanent() => Reply::new(550, format!("5.1.1 {err}")),
            GatewayError::Dispatch(_) => Reply::new(451, format!("4.3.0 {err}")),
            GatewayError::DataRead(_) | GatewayError::Aborted(_) => {
                Reply::new(451, format!("4.3.0 {err}"))
            }
        }
    }
}
