use std::fmt;

/// Source part of an IRC message (`nick!user@host`). Servers use a bare
/// hostname here; those parse with `user`/`host` left empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcPrefix {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl IrcPrefix {
    pub fn parse(raw: &str) -> Self {
        let nick_end = raw.find('!').unwrap_or(raw.len());
        let nick = raw[..nick_end].to_string();

        if nick_end == raw.len() {
            return Self {
                nick,
                user: None,
                host: None,
            };
        }

        let user_host = &raw[nick_end + 1..];
        let (user, host) = match user_host.find('@') {
            Some(pos) => (
                Some(user_host[..pos].to_string()),
                Some(user_host[pos + 1..].to_string()),
            ),
            None => (Some(user_host.to_string()), None),
        };

        Self { nick, user, host }
    }
}

/// One parsed IRC wire line: optional prefix, uppercased command or numeric,
/// positional params with the trailing param unfolded into the last slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    pub prefix: Option<IrcPrefix>,
    pub command: String,
    pub params: Vec<String>,
}

pub const CTCP_DELIM: char = '\u{1}';

impl IrcMessage {
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.to_string(),
            params,
        }
    }

    /// Nickname of the message origin, or the empty string for server-less
    /// lines.
    pub fn origin(&self) -> &str {
        self.prefix.as_ref().map(|p| p.nick.as_str()).unwrap_or("")
    }

    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn is_numeric(&self) -> bool {
        !self.command.is_empty() && self.command.chars().all(|ch| ch.is_ascii_digit())
    }

    /// Extracts a CTCP payload from a param: leading 0x01, optional trailing
    /// 0x01. Returns the inner text, or `None` when the param is plain text.
    pub fn ctcp(param: &str) -> Option<&str> {
        let inner = param.strip_prefix(CTCP_DELIM)?;
        Some(inner.strip_suffix(CTCP_DELIM).unwrap_or(inner))
    }

    /// Wraps a payload in CTCP delimiters for outbound use.
    pub fn ctcp_wrap(payload: &str) -> String {
        format!("{}{}{}", CTCP_DELIM, payload, CTCP_DELIM)
    }
}

/// Serializes back to the wire form. The last param is emitted as trailing
/// whenever it is empty, contains a space, or starts with `:`, so a
/// round-trip through the parser is lossless.
impl fmt::Display for IrcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{}", prefix.nick)?;
            if let Some(user) = &prefix.user {
                write!(f, "!{}", user)?;
            }
            if let Some(host) = &prefix.host {
                write!(f, "@{}", host)?;
            }
            write!(f, " ")?;
        }

        write!(f, "{}", self.command)?;

        let last = self.params.len().checked_sub(1);
        for (idx, param) in self.params.iter().enumerate() {
            if Some(idx) == last
                && (param.is_empty() || param.contains(' ') || param.starts_with(':'))
            {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }

        Ok(())
    }
}
