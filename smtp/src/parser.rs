use super::*;
use nom::{
    bytes::complete::take_while_m_n,
    character::complete::one_of,
    combinator::{map, map_res, opt, rest, verify},
    IResult, Parser,
};

/// A single line of a server reply, e.g. `250-mx.example.com` or `550 No such user`.
#[derive(Debug, PartialEq)]
pub(crate) struct ReplyLine<'a> {
    /// Three digit reply code.
    pub code: u16,
    /// `false` when the code was followed by `-`, meaning more lines follow.
    pub last: bool,
    pub text: &'a str,
}

/// Parses one raw reply line (without the trailing CRLF).
pub(crate) fn parse_reply_line(input: &str) -> Result<ReplyLine<'_>, SmtpError> {
    let parse_result: IResult<&str, ReplyLine<'_>> = reply_line(input);

    parse_result
        .map(|(_, line)| line)
        .map_err(|e| SmtpError::ParseError {
            message: e.to_string(),
            span: (0, input.len()).into(),
        })
}

fn reply_line(input: &str) -> IResult<&str, ReplyLine<'_>> {
    map(
        (reply_code, opt(one_of("- ")), rest),
        |(code, separator, text): (u16, Option<char>, &str)| ReplyLine {
            code,
            last: separator != Some('-'),
            text: text.trim(),
        },
    )
    .parse(input)
}

fn reply_code(input: &str) -> IResult<&str, u16> {
    verify(
        map_res(
            take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
            |digits: &str| digits.parse::<u16>(),
        ),
        |code: &u16| (200..600).contains(code),
    )
    .parse(input)
}

/// Most lines accepted in one reply before the server is considered broken.
pub(crate) const MAX_REPLY_LINES: usize = 100;

/// Folds consecutive reply lines into a [`Reply`]. Returns `Ok(None)` while
/// more lines are expected.
pub(crate) struct ReplyBuilder {
    code: Option<u16>,
    lines: Vec<String>,
}

impl ReplyBuilder {
    pub(crate) fn new() -> Self {
        ReplyBuilder {
            code: None,
            lines: Vec::with_capacity(1),
        }
    }

    pub(crate) fn push(&mut self, raw: &str) -> Result<Option<Reply>, SmtpError> {
        let line = parse_reply_line(raw)?;
        match self.code {
            Some(code) if code != line.code => {
                return Err(SmtpError::ParseError {
                    message: format!(
                        "reply code changed from {} to {} within a multiline reply",
                        code, line.code
                    ),
                    span: (0, 3).into(),
                });
            }
            _ => self.code = Some(line.code),
        }
        if self.lines.len() >= MAX_REPLY_LINES {
            return Err(SmtpError::ParseError {
                message: format!("reply exceeds {} lines", MAX_REPLY_LINES),
                span: (0, raw.len()).into(),
            });
        }
        self.lines.push(line.text.to_string());

        if line.last {
            Ok(Some(Reply {
                code: line.code,
                lines: std::mem::take(&mut self.lines),
            }))
        } else {
            Ok(None)
        }
    }
}
