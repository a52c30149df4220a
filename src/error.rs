//! Wire-facing error taxonomy.
//!
//! Every error a transport command can report maps onto one of four
//! categories; the JSON response carries the numeric code plus the category
//! name so that irccdctl can render it without a shared table.

use thiserror::Error;

pub type WireResult<T> = core::result::Result<T, WireError>;

/// Daemon-level protocol errors (category `irccd`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    #[error("handshake target is not an irccd daemon")]
    NotIrccd,

    #[error("incompatible daemon version")]
    IncompatibleVersion,

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid authentication")]
    InvalidAuth,

    #[error("invalid message")]
    InvalidMessage,

    #[error("corrupt message")]
    CorruptMessage,
}

/// Server construction and directory errors (category `server`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("invalid server identifier")]
    InvalidIdentifier,

    #[error("invalid hostname")]
    InvalidHostname,

    #[error("invalid port")]
    InvalidPort,

    #[error("invalid address family")]
    InvalidFamily,

    #[error("invalid nickname")]
    InvalidNickname,

    #[error("invalid username")]
    InvalidUsername,

    #[error("invalid realname")]
    InvalidRealname,

    #[error("invalid CTCP version")]
    InvalidCtcpVersion,

    #[error("invalid command character")]
    InvalidCommandChar,

    #[error("invalid password")]
    InvalidPassword,

    #[error("invalid ping timeout")]
    InvalidPingTimeout,

    #[error("invalid reconnect tries")]
    InvalidReconnectTries,

    #[error("invalid reconnect timeout")]
    InvalidReconnectTimeout,

    #[error("server already exists")]
    AlreadyExists,

    #[error("server not found")]
    NotFound,

    #[error("SSL support is disabled")]
    SslDisabled,
}

/// Plugin directory errors (category `plugin`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin not found")]
    NotFound,

    #[error("plugin already exists")]
    AlreadyExists,

    #[error("plugin execution error: {0}")]
    ExecError(String),

    #[error("invalid plugin options")]
    InvalidOptions,
}

/// Rule engine errors (category `rule`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule index out of range")]
    InvalidIndex,

    #[error("invalid rule action")]
    InvalidAction,

    #[error("invalid event name")]
    InvalidEvent,
}

/// Any error a command handler can surface to a transport client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

impl WireError {
    /// Numeric code carried in the `error` response field. Codes are stable
    /// per category, in declaration order, starting at 1.
    pub fn code(&self) -> u32 {
        match self {
            WireError::Daemon(e) => match e {
                DaemonError::NotIrccd => 1,
                DaemonError::IncompatibleVersion => 2,
                DaemonError::AuthRequired => 3,
                DaemonError::InvalidAuth => 4,
                DaemonError::InvalidMessage => 5,
                DaemonError::CorruptMessage => 6,
            },
            WireError::Server(e) => match e {
                ServerError::InvalidIdentifier => 1,
                ServerError::InvalidHostname => 2,
                ServerError::InvalidPort => 3,
                ServerError::InvalidFamily => 4,
                ServerError::InvalidNickname => 5,
                ServerError::InvalidUsername => 6,
                ServerError::InvalidRealname => 7,
                ServerError::InvalidCtcpVersion => 8,
                ServerError::InvalidCommandChar => 9,
                ServerError::InvalidPassword => 10,
                ServerError::InvalidPingTimeout => 11,
                ServerError::InvalidReconnectTries => 12,
                ServerError::InvalidReconnectTimeout => 13,
                ServerError::AlreadyExists => 14,
                ServerError::NotFound => 15,
                ServerError::SslDisabled => 16,
            },
            WireError::Plugin(e) => match e {
                PluginError::NotFound => 1,
                PluginError::AlreadyExists => 2,
                PluginError::ExecError(_) => 3,
                PluginError::InvalidOptions => 4,
            },
            WireError::Rule(e) => match e {
                RuleError::InvalidIndex => 1,
                RuleError::InvalidAction => 2,
                RuleError::InvalidEvent => 3,
            },
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            WireError::Daemon(_) => "irccd",
            WireError::Server(_) => "server",
            WireError::Plugin(_) => "plugin",
            WireError::Rule(_) => "rule",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_categories_project() {
        let err = WireError::from(ServerError::InvalidPort);
        assert_eq!(err.code(), 3);
        assert_eq!(err.category(), "server");

        let err = WireError::from(RuleError::InvalidEvent);
        assert_eq!(err.code(), 3);
        assert_eq!(err.category(), "rule");

        let err = WireError::from(DaemonError::AuthRequired);
        assert_eq!(err.code(), 3);
        assert_eq!(err.category(), "irccd");
    }
}
