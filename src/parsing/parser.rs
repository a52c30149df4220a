use thiserror::Error;
use tracing::trace;

use super::lexer::Lexer;
use super::message::{IrcMessage, IrcPrefix};

pub type ParseResult<T> = core::result::Result<T, ParseError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    EmptyLine,

    #[error("cannot find a command in line: {0}")]
    MissingCommand(String),
}

/// Accumulates raw socket reads and yields complete `\r\n`-terminated lines.
///
/// Incomplete tails are kept across `extend` calls, bare `\n` terminators are
/// accepted, and whitespace-only lines between messages are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
    }

    /// Pops the next complete line, stripped of its terminator and of any
    /// leading whitespace. Returns `None` once only a partial tail remains.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.find('\n')?;
            let mut line: String = self.buf.drain(..=pos).collect();

            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }

            let trimmed = line.trim_start();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Splits one wire line into prefix, command and params.
#[derive(Debug, Default)]
pub struct IrcParser;

impl IrcParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, raw: &str) -> ParseResult<IrcMessage> {
        let input = raw.trim_end_matches(['\r', '\n']);
        let mut lexer = Lexer::new(input);

        lexer.skip_whitespace();
        if lexer.is_eof() {
            return Err(ParseError::EmptyLine);
        }

        let mut prefix = None;
        if lexer.peek_char() == Some(':') {
            lexer.next();
            let source = lexer
                .next_word()
                .ok_or_else(|| ParseError::MissingCommand(input.to_string()))?;
            prefix = Some(IrcPrefix::parse(source));
            lexer.skip_whitespace();
        }

        let command = lexer
            .next_word()
            .ok_or_else(|| ParseError::MissingCommand(input.to_string()))?
            .to_uppercase();
        lexer.skip_whitespace();

        let params = self.parse_params(&mut lexer);

        trace!(
            command,
            param_count = params.len(),
            has_prefix = prefix.is_some(),
            "parsed wire line"
        );

        Ok(IrcMessage {
            prefix,
            command,
            params,
        })
    }

    fn parse_params(&self, lexer: &mut Lexer) -> Vec<String> {
        let mut params = Vec::new();

        while !lexer.is_eof() {
            if lexer.peek_char() == Some(':') {
                lexer.next();
                params.push(lexer.rest().unwrap_or("").to_string());
                break;
            } else if let Some(param) = lexer.next_word() {
                params.push(param.to_string());
                lexer.skip_whitespace();
            } else {
                break;
            }
        }

        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg() {
        let parser = IrcParser::new();
        let msg = parser
            .parse(":alice!a@example.org PRIVMSG #staff :hello world")
            .unwrap();

        assert_eq!(msg.origin(), "alice");
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#staff", "hello world"]);
    }

    #[test]
    fn parse_numeric_with_trailing() {
        let parser = IrcParser::new();
        let msg = parser
            .parse(":irc.example.org 001 bot :Welcome to the network")
            .unwrap();

        assert_eq!(msg.command, "001");
        assert!(msg.is_numeric());
        assert_eq!(msg.params, vec!["bot", "Welcome to the network"]);
    }

    #[test]
    fn parse_tolerates_leading_whitespace() {
        let parser = IrcParser::new();
        let msg = parser.parse("   PING :irc.example.org").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.org"]);
    }

    #[test]
    fn parse_lowercase_command_is_uppercased() {
        let parser = IrcParser::new();
        let msg = parser.parse("privmsg #a :x").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn parse_empty_is_error() {
        let parser = IrcParser::new();
        assert_eq!(parser.parse("  \r\n"), Err(ParseError::EmptyLine));
    }

    #[test]
    fn line_buffer_splits_partial_reads() {
        let mut buf = LineBuffer::new();
        buf.extend("PING :a\r\nPRIV");
        assert_eq!(buf.next_line().as_deref(), Some("PING :a"));
        assert_eq!(buf.next_line(), None);

        buf.extend("MSG #c :hi\r\n");
        assert_eq!(buf.next_line().as_deref(), Some("PRIVMSG #c :hi"));
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn line_buffer_drops_blank_lines() {
        let mut buf = LineBuffer::new();
        buf.extend("\r\n  \r\nNOTICE x :y\r\n");
        assert_eq!(buf.next_line().as_deref(), Some("NOTICE x :y"));
        assert_eq!(buf.next_line(), None);
    }

    #[test]
    fn round_trip_through_display() {
        let parser = IrcParser::new();
        let original = ":bob!b@h KICK #chan alice :no reason given";
        let msg = parser.parse(original).unwrap();
        assert_eq!(msg.to_string(), original);
    }
}
