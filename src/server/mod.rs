//! Per-server IRC session: configuration, runtime state shared with the
//! connection task, and the outbound command queue.

pub mod connection;
pub mod event;

use std::time::Duration;

use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::error::ServerError;
use crate::parsing::IrcMessage;
use crate::util::{irc_eq, is_identifier};

/// A channel the server should sit in, with its optional join key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub key: Option<String>,
}

impl ChannelSpec {
    /// Parses the `name[:key]` config form.
    pub fn parse(value: &str) -> Self {
        match value.split_once(':') {
            Some((name, key)) if !key.is_empty() => Self {
                name: name.to_string(),
                key: Some(key.to_string()),
            },
            _ => Self {
                name: value.trim_end_matches(':').to_string(),
                key: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub ssl: bool,
    pub ssl_verify: bool,
    pub ipv4: bool,
    pub ipv6: bool,
    pub auto_rejoin: bool,
    pub join_invite: bool,
    pub nickname: String,
    pub username: String,
    pub realname: String,
    pub command_char: String,
    pub password: Option<String>,
    pub ctcp_version: String,
    pub ctcp_source: String,
    pub ping_timeout: Duration,
    pub reconnect_delay: Duration,
    /// `-1` retries forever, `0` never reconnects, `n > 0` bounds attempts.
    pub reconnect_tries: i32,
    pub channels: Vec<ChannelSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            hostname: String::new(),
            port: 6667,
            ssl: false,
            ssl_verify: true,
            ipv4: true,
            ipv6: true,
            auto_rejoin: false,
            join_invite: false,
            nickname: "irccd".to_string(),
            username: "irccd".to_string(),
            realname: "IRC Client Daemon".to_string(),
            command_char: "!".to_string(),
            password: None,
            ctcp_version: "IRC Client Daemon".to_string(),
            ctcp_source: String::new(),
            ping_timeout: Duration::from_secs(180),
            reconnect_delay: Duration::from_secs(30),
            reconnect_tries: -1,
            channels: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if !is_identifier(&self.name) {
            return Err(ServerError::InvalidIdentifier);
        }
        if self.hostname.is_empty() || self.hostname.contains(char::is_whitespace) {
            return Err(ServerError::InvalidHostname);
        }
        if self.port == 0 {
            return Err(ServerError::InvalidPort);
        }
        if !self.ipv4 && !self.ipv6 {
            return Err(ServerError::InvalidFamily);
        }
        if self.ssl && !cfg!(feature = "tls") {
            return Err(ServerError::SslDisabled);
        }
        if self.nickname.is_empty() || self.nickname.contains(char::is_whitespace) {
            return Err(ServerError::InvalidNickname);
        }
        if self.username.is_empty() || self.username.contains(char::is_whitespace) {
            return Err(ServerError::InvalidUsername);
        }
        if self.realname.is_empty() {
            return Err(ServerError::InvalidRealname);
        }
        if self.command_char.is_empty() || self.command_char.contains(char::is_whitespace) {
            return Err(ServerError::InvalidCommandChar);
        }
        if self.ping_timeout.is_zero() {
            return Err(ServerError::InvalidPingTimeout);
        }

        Ok(())
    }
}

/// Session lifecycle of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelMember {
    pub nick: String,
    /// Bitmask over the server's ISUPPORT prefix-mode table, bit i set when
    /// the member holds the i-th mode (op, half-op, voice, ...).
    pub modes: u32,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub key: Option<String>,
    /// False while the join is pending, true once the server echoed it.
    pub joined: bool,
    pub members: Vec<ChannelMember>,
    pub modes: Vec<char>,
}

impl Channel {
    fn pending(name: &str, key: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            key,
            joined: false,
            members: Vec::new(),
            modes: Vec::new(),
        }
    }
}

/// Feature advertisement negotiated from the server's 005 ISUPPORT reply.
#[derive(Debug, Clone)]
pub struct Isupport {
    /// `(mode letter, prefix symbol)` pairs in descending privilege order.
    pub prefixes: Vec<(char, char)>,
    pub chantypes: Vec<char>,
}

impl Default for Isupport {
    fn default() -> Self {
        Self {
            prefixes: vec![('o', '@'), ('h', '%'), ('v', '+')],
            chantypes: vec!['#', '&', '+', '!'],
        }
    }
}

impl Isupport {
    /// Parses one `PREFIX=(modes)symbols` token.
    pub fn set_prefixes(&mut self, token: &str) {
        let Some(rest) = token.strip_prefix('(') else {
            return;
        };
        let Some((modes, symbols)) = rest.split_once(')') else {
            return;
        };
        if modes.chars().count() != symbols.chars().count() {
            return;
        }

        self.prefixes = modes.chars().zip(symbols.chars()).collect();
    }

    pub fn mode_bit(&self, mode: char) -> Option<u32> {
        self.prefixes
            .iter()
            .position(|(m, _)| *m == mode)
            .map(|idx| 1 << idx)
    }

    pub fn symbol_bit(&self, symbol: char) -> Option<u32> {
        self.prefixes
            .iter()
            .position(|(_, s)| *s == symbol)
            .map(|idx| 1 << idx)
    }

    pub fn is_channel(&self, target: &str) -> bool {
        target
            .chars()
            .next()
            .is_some_and(|ch| self.chantypes.contains(&ch))
    }
}

/// Commands accepted by the connection task.
#[derive(Debug)]
pub enum ServerCommand {
    /// One formatted IRC line, delivered FIFO through the rate limiter.
    Line(String),
    /// Graceful QUIT; the session ends and does not reconnect.
    Quit(Option<String>),
    /// Drop the socket and connect again without consuming the retry budget.
    Reconnect,
}

/// Handle to one IRC server. The bot owns it uniquely inside the server
/// directory; events and plugin calls observe it through `Arc` clones.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    state: RwLock<SessionState>,
    nickname: RwLock<String>,
    channels: RwLock<Vec<Channel>>,
    isupport: RwLock<Isupport>,
    cmd_tx: UnboundedSender<ServerCommand>,
}

impl Server {
    pub fn new(config: ServerConfig) -> (Self, UnboundedReceiver<ServerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let nickname = config.nickname.clone();

        (
            Self {
                config,
                state: RwLock::new(SessionState::Disconnected),
                nickname: RwLock::new(nickname),
                channels: RwLock::new(Vec::new()),
                isupport: RwLock::new(Isupport::default()),
                cmd_tx,
            },
            cmd_rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: SessionState) {
        debug!(server = self.config.name, state = state.as_str(), "session state");
        *self.state.write().await = state;
    }

    pub async fn nickname(&self) -> String {
        self.nickname.read().await.clone()
    }

    pub(crate) async fn set_nickname(&self, nick: &str) {
        *self.nickname.write().await = nick.to_string();
    }

    pub async fn is_self(&self, nick: &str) -> bool {
        irc_eq(&self.nickname().await, nick)
    }

    pub async fn isupport(&self) -> Isupport {
        self.isupport.read().await.clone()
    }

    pub(crate) async fn update_isupport(&self, tokens: &[String]) {
        let mut isupport = self.isupport.write().await;
        for token in tokens {
            if let Some(value) = token.strip_prefix("PREFIX=") {
                isupport.set_prefixes(value);
            } else if let Some(value) = token.strip_prefix("CHANTYPES=") {
                isupport.chantypes = value.chars().collect();
            }
        }
    }

    pub async fn is_channel(&self, target: &str) -> bool {
        self.isupport.read().await.is_channel(target)
    }

    pub async fn channels(&self) -> Vec<Channel> {
        self.channels.read().await.clone()
    }

    fn command(&self, cmd: ServerCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!(server = self.config.name, "connection task is gone, command dropped");
        }
    }

    /// Enqueues a raw IRC line. All the convenience methods below come
    /// through here, so submit order is delivery order.
    pub fn send_raw(&self, line: String) {
        self.command(ServerCommand::Line(line));
    }

    fn send_message(&self, msg: IrcMessage) {
        self.send_raw(msg.to_string());
    }

    pub fn message(&self, target: &str, text: &str) {
        self.send_message(IrcMessage::new(
            "PRIVMSG",
            vec![target.to_string(), text.to_string()],
        ));
    }

    /// CTCP ACTION, the `/me` of chat clients.
    pub fn me(&self, target: &str, text: &str) {
        self.send_message(IrcMessage::new(
            "PRIVMSG",
            vec![
                target.to_string(),
                IrcMessage::ctcp_wrap(&format!("ACTION {}", text)),
            ],
        ));
    }

    pub fn notice(&self, target: &str, text: &str) {
        self.send_message(IrcMessage::new(
            "NOTICE",
            vec![target.to_string(), text.to_string()],
        ));
    }

    /// Records the channel as pending and requests the join. The record
    /// flips to joined when the server echoes our JOIN.
    pub async fn join(&self, channel: &str, key: Option<&str>) {
        {
            let mut channels = self.channels.write().await;
            if !channels.iter().any(|ch| irc_eq(&ch.name, channel)) {
                channels.push(Channel::pending(channel, key.map(str::to_string)));
            }
        }

        let mut params = vec![channel.to_string()];
        if let Some(key) = key {
            params.push(key.to_string());
        }
        self.send_message(IrcMessage::new("JOIN", params));
    }

    pub fn part(&self, channel: &str, reason: Option<&str>) {
        let mut params = vec![channel.to_string()];
        if let Some(reason) = reason {
            params.push(reason.to_string());
        }
        self.send_message(IrcMessage::new("PART", params));
    }

    pub fn kick(&self, channel: &str, target: &str, reason: Option<&str>) {
        let mut params = vec![channel.to_string(), target.to_string()];
        if let Some(reason) = reason {
            params.push(reason.to_string());
        }
        self.send_message(IrcMessage::new("KICK", params));
    }

    pub fn invite(&self, target: &str, channel: &str) {
        self.send_message(IrcMessage::new(
            "INVITE",
            vec![target.to_string(), channel.to_string()],
        ));
    }

    pub fn topic(&self, channel: &str, topic: &str) {
        self.send_message(IrcMessage::new(
            "TOPIC",
            vec![channel.to_string(), topic.to_string()],
        ));
    }

    pub fn mode(
        &self,
        channel: &str,
        mode: &str,
        limit: Option<&str>,
        user: Option<&str>,
        mask: Option<&str>,
    ) {
        let mut params = vec![channel.to_string(), mode.to_string()];
        for extra in [limit, user, mask].into_iter().flatten() {
            params.push(extra.to_string());
        }
        self.send_message(IrcMessage::new("MODE", params));
    }

    pub fn nick(&self, nickname: &str) {
        self.send_message(IrcMessage::new("NICK", vec![nickname.to_string()]));
    }

    pub fn whois(&self, target: &str) {
        self.send_message(IrcMessage::new("WHOIS", vec![target.to_string()]));
    }

    pub fn names(&self, channel: &str) {
        self.send_message(IrcMessage::new("NAMES", vec![channel.to_string()]));
    }

    /// Requests a graceful QUIT; the session will not reconnect.
    pub fn disconnect(&self, reason: Option<&str>) {
        self.command(ServerCommand::Quit(reason.map(str::to_string)));
    }

    pub fn reconnect(&self) {
        self.command(ServerCommand::Reconnect);
    }

    // --- membership tracking, driven by the connection task ---

    /// Drops all channel state. Called when a session ends so a later
    /// reconnect starts from the configured channel list again.
    pub(crate) async fn clear_channels(&self) {
        self.channels.write().await.clear();
    }

    pub(crate) async fn member_joined(&self, channel: &str, nick: &str) {
        let me = self.is_self(nick).await;
        let mut channels = self.channels.write().await;

        match channels.iter_mut().find(|ch| irc_eq(&ch.name, channel)) {
            Some(entry) => {
                if me {
                    entry.joined = true;
                    entry.name = channel.to_string();
                } else if !entry.members.iter().any(|m| irc_eq(&m.nick, nick)) {
                    entry.members.push(ChannelMember {
                        nick: nick.to_string(),
                        modes: 0,
                    });
                }
            }
            None => {
                let mut entry = Channel::pending(channel, None);
                if me {
                    entry.joined = true;
                } else {
                    entry.members.push(ChannelMember {
                        nick: nick.to_string(),
                        modes: 0,
                    });
                }
                channels.push(entry);
            }
        }
    }

    pub(crate) async fn member_left(&self, channel: &str, nick: &str) {
        let me = self.is_self(nick).await;
        let mut channels = self.channels.write().await;

        if me {
            channels.retain(|ch| !irc_eq(&ch.name, channel));
        } else if let Some(entry) = channels.iter_mut().find(|ch| irc_eq(&ch.name, channel)) {
            entry.members.retain(|m| !irc_eq(&m.nick, nick));
        }
    }

    pub(crate) async fn member_quit(&self, nick: &str) {
        let mut channels = self.channels.write().await;
        for entry in channels.iter_mut() {
            entry.members.retain(|m| !irc_eq(&m.nick, nick));
        }
    }

    pub(crate) async fn member_renamed(&self, old: &str, new: &str) {
        if self.is_self(old).await {
            self.set_nickname(new).await;
        }

        let mut channels = self.channels.write().await;
        for entry in channels.iter_mut() {
            if let Some(member) = entry.members.iter_mut().find(|m| irc_eq(&m.nick, old)) {
                member.nick = new.to_string();
            }
        }
    }

    /// Replaces a channel's member list from a completed NAMES reply. Names
    /// arrive decorated with prefix symbols (`@nick`, `+nick`).
    pub(crate) async fn set_members(&self, channel: &str, decorated: &[String]) {
        let isupport = self.isupport.read().await.clone();
        let mut channels = self.channels.write().await;

        let entry = match channels.iter_mut().find(|ch| irc_eq(&ch.name, channel)) {
            Some(entry) => entry,
            None => {
                channels.push(Channel::pending(channel, None));
                channels.last_mut().unwrap()
            }
        };

        entry.members = decorated
            .iter()
            .filter(|name| !name.is_empty())
            .map(|name| {
                let mut modes = 0;
                let mut rest = name.as_str();

                while let Some(ch) = rest.chars().next() {
                    match isupport.symbol_bit(ch) {
                        Some(bit) => {
                            modes |= bit;
                            rest = &rest[ch.len_utf8()..];
                        }
                        None => break,
                    }
                }

                ChannelMember {
                    nick: rest.to_string(),
                    modes,
                }
            })
            .collect();
    }

    /// Applies a channel MODE change to member prefix bits.
    pub(crate) async fn apply_mode(&self, channel: &str, mode: &str, args: &[String]) {
        let isupport = self.isupport.read().await.clone();
        let mut channels = self.channels.write().await;
        let Some(entry) = channels.iter_mut().find(|ch| irc_eq(&ch.name, channel)) else {
            return;
        };

        let mut adding = true;
        let mut args = args.iter();

        for ch in mode.chars() {
            match ch {
                '+' => adding = true,
                '-' => adding = false,
                _ => match isupport.mode_bit(ch) {
                    Some(bit) => {
                        if let Some(nick) = args.next() {
                            if let Some(member) =
                                entry.members.iter_mut().find(|m| irc_eq(&m.nick, nick))
                            {
                                if adding {
                                    member.modes |= bit;
                                } else {
                                    member.modes &= !bit;
                                }
                            }
                        }
                    }
                    None => {
                        if adding {
                            if !entry.modes.contains(&ch) {
                                entry.modes.push(ch);
                            }
                        } else {
                            entry.modes.retain(|m| *m != ch);
                        }
                    }
                },
            }
        }
    }
}
