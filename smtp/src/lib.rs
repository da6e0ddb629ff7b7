//! Minimal SMTP client used to probe remote mail exchangers.
//!
//! The client speaks just enough of RFC 5321 to open a session and ask a
//! server whether it would accept a recipient: greeting, `HELO`, `MAIL FROM`,
//! `RCPT TO` and `QUIT`. It never sends `DATA`.

use miette::{Diagnostic, SourceSpan};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

mod parser;
use parser::ReplyBuilder;

/// Longest reply line accepted from a server before the session is abandoned.
const MAX_LINE_LENGTH: u64 = 4096;

#[derive(Debug, Error, Diagnostic)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    #[diagnostic(code(smtp::io_error))]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {message}")]
    #[diagnostic(code(smtp::parse_error))]
    ParseError {
        message: String,
        #[label("This bit here")]
        span: SourceSpan,
    },

    #[error("Connection closed by remote host")]
    #[diagnostic(code(smtp::connection_closed))]
    ConnectionClosed,

    #[error("Invalid command argument: {0:?}")]
    #[diagnostic(code(smtp::invalid_argument))]
    InvalidArgument(String),
}

/// Coarse classification of a reply by its first digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Positive,
    Intermediate,
    Transient,
    Permanent,
}

/// A complete, possibly multiline, server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn class(&self) -> ReplyClass {
        match self.code / 100 {
            2 => ReplyClass::Positive,
            3 => ReplyClass::Intermediate,
            4 => ReplyClass::Transient,
            _ => ReplyClass::Permanent,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.class() == ReplyClass::Positive
    }

    /// The reply text with continuation lines joined by a space.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.as_str())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.text();
        if text.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, text)
        }
    }
}

/// One SMTP session with a remote server.
pub struct SmtpClient<S = TcpStream> {
    stream: BufStream<S>,
}

impl SmtpClient<TcpStream> {
    /// Connects to `host:port` and reads the server greeting.
    pub async fn connect(host: &str, port: u16) -> Result<(Self, Reply), SmtpError> {
        debug!(host, port, "Connecting to SMTP server");
        let stream = TcpStream::connect((host, port)).await?;
        Self::from_stream(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpClient<S> {
    /// Wraps an already connected stream and reads the server greeting.
    pub async fn from_stream(stream: S) -> Result<(Self, Reply), SmtpError> {
        let mut client = SmtpClient {
            stream: BufStream::new(stream),
        };
        let greeting = client.read_reply().await?;
        Ok((client, greeting))
    }

    pub async fn helo(&mut self, name: &str) -> Result<Reply, SmtpError> {
        check_argument(name)?;
        self.command(&format!("HELO {}", name)).await
    }

    /// Sends `MAIL FROM:<address>`. An empty address yields the null reverse path.
    pub async fn mail_from(&mut self, address: &str) -> Result<Reply, SmtpError> {
        check_argument(address)?;
        self.command(&format!("MAIL FROM:<{}>", address)).await
    }

    pub async fn rcpt_to(&mut self, address: &str) -> Result<Reply, SmtpError> {
        check_argument(address)?;
        self.command(&format!("RCPT TO:<{}>", address)).await
    }

    /// Ends the session. The server's answer is read but not inspected.
    pub async fn quit(mut self) -> Result<(), SmtpError> {
        self.command("QUIT").await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<Reply, SmtpError> {
        debug!(command = line, "SMTP >>");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply, SmtpError> {
        let mut builder = ReplyBuilder::new();
        let mut buffer = String::new();
        loop {
            buffer.clear();
            let n = (&mut self.stream)
                .take(MAX_LINE_LENGTH)
                .read_line(&mut buffer)
                .await?;
            if n == 0 {
                return Err(SmtpError::ConnectionClosed);
            }
            if !buffer.ends_with('\n') {
                return Err(SmtpError::ParseError {
                    message: "reply line too long or truncated".to_string(),
                    span: (0, buffer.len()).into(),
                });
            }

            let line = buffer.trim_end_matches(['\r', '\n']);
            debug!(reply = line, "SMTP <<");
            if let Some(reply) = builder.push(line)? {
                return Ok(reply);
            }
        }
    }
}

/// Rejects arguments that would smuggle extra commands into the session.
fn check_argument(arg: &str) -> Result<(), SmtpError> {
    if arg.contains(['\r', '\n']) {
        return Err(SmtpError::InvalidArgument(arg.to_string()));
    }
    Ok(())
}
