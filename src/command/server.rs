//! `server-*` command handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::bot::Bot;
use crate::command::{Command, Request};
use crate::error::{DaemonError, ServerError, WireResult};
use crate::server::{ChannelSpec, ServerConfig};

/// Builds a `ServerConfig` from the camelCase request fields, validating
/// the numeric ranges JSON cannot express.
fn config_from_request(request: &Request<'_>) -> WireResult<ServerConfig> {
    let mut config = ServerConfig {
        name: request
            .require_str("name", ServerError::InvalidIdentifier)?
            .to_string(),
        hostname: request
            .require_str("hostname", ServerError::InvalidHostname)?
            .to_string(),
        ..ServerConfig::default()
    };

    if request.has("port") {
        let port = request
            .get_i64("port")
            .ok_or(ServerError::InvalidPort)?;
        config.port = u16::try_from(port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or(ServerError::InvalidPort)?;
    }

    if let Some(ssl) = request.get_bool("ssl") {
        config.ssl = ssl;
    }
    if let Some(verify) = request.get_bool("sslVerify") {
        config.ssl_verify = verify;
    }
    if let Some(ipv4) = request.get_bool("ipv4") {
        config.ipv4 = ipv4;
    }
    if let Some(ipv6) = request.get_bool("ipv6") {
        config.ipv6 = ipv6;
    }
    if let Some(auto_rejoin) = request.get_bool("autoRejoin") {
        config.auto_rejoin = auto_rejoin;
    }
    if let Some(join_invite) = request.get_bool("joinInvite") {
        config.join_invite = join_invite;
    }
    if let Some(nickname) = request.get_str("nickname") {
        config.nickname = nickname.to_string();
    }
    if let Some(username) = request.get_str("username") {
        config.username = username.to_string();
    }
    if let Some(realname) = request.get_str("realname") {
        config.realname = realname.to_string();
    }
    if let Some(password) = request.get_str("password") {
        config.password = Some(password.to_string());
    }
    if let Some(command_char) = request.get_str("commandChar") {
        config.command_char = command_char.to_string();
    }
    if let Some(version) = request.get_str("ctcpVersion") {
        config.ctcp_version = version.to_string();
    }

    if request.has("pingTimeout") {
        let timeout = request
            .get_i64("pingTimeout")
            .filter(|secs| *secs > 0)
            .ok_or(ServerError::InvalidPingTimeout)?;
        config.ping_timeout = Duration::from_secs(timeout as u64);
    }
    if request.has("reconnectTries") {
        let tries = request
            .get_i64("reconnectTries")
            .and_then(|tries| i32::try_from(tries).ok())
            .ok_or(ServerError::InvalidReconnectTries)?;
        config.reconnect_tries = tries;
    }
    if request.has("reconnectDelay") {
        let delay = request
            .get_i64("reconnectDelay")
            .filter(|secs| *secs >= 0)
            .ok_or(ServerError::InvalidReconnectTimeout)?;
        config.reconnect_delay = Duration::from_secs(delay as u64);
    }

    config.channels = request
        .get_str_list("channels")
        .iter()
        .map(|entry| ChannelSpec::parse(entry))
        .collect();

    config.validate()?;
    Ok(config)
}

pub struct ServerConnect;

#[async_trait]
impl Command for ServerConnect {
    fn name(&self) -> &'static str {
        "server-connect"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let config = config_from_request(request)?;
        bot.add_server(config).await?;
        Ok(json!({}))
    }
}

pub struct ServerDisconnect;

#[async_trait]
impl Command for ServerDisconnect {
    fn name(&self) -> &'static str {
        "server-disconnect"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        if request.has("server") {
            let name = request.require_str("server", ServerError::InvalidIdentifier)?;
            bot.disconnect_server(name).await?;
        } else {
            bot.disconnect_all().await;
        }
        Ok(json!({}))
    }
}

pub struct ServerReconnect;

#[async_trait]
impl Command for ServerReconnect {
    fn name(&self) -> &'static str {
        "server-reconnect"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        if request.has("server") {
            let name = request.require_str("server", ServerError::InvalidIdentifier)?;
            bot.find_server(name).await?.reconnect();
        } else {
            for server in bot.servers().await {
                server.reconnect();
            }
        }
        Ok(json!({}))
    }
}

pub struct ServerInfo;

#[async_trait]
impl Command for ServerInfo {
    fn name(&self) -> &'static str {
        "server-info"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let server = bot.find_server(name).await?;
        let config = server.config();

        let channels: Vec<String> = server
            .channels()
            .await
            .into_iter()
            .map(|channel| channel.name)
            .collect();

        Ok(json!({
            "name": config.name,
            "hostname": config.hostname,
            "port": config.port,
            "ipv4": config.ipv4,
            "ipv6": config.ipv6,
            "ssl": config.ssl,
            "channels": channels,
            "nickname": server.nickname().await,
            "username": config.username,
            "realname": config.realname,
            "state": server.state().await.as_str(),
        }))
    }
}

pub struct ServerList;

#[async_trait]
impl Command for ServerList {
    fn name(&self) -> &'static str {
        "server-list"
    }

    async fn execute(&self, bot: &Arc<Bot>, _request: &Request<'_>) -> WireResult<Value> {
        let names: Vec<String> = bot
            .servers()
            .await
            .iter()
            .map(|server| server.name().to_string())
            .collect();

        Ok(json!({ "list": names }))
    }
}

pub struct ServerMessage;

#[async_trait]
impl Command for ServerMessage {
    fn name(&self) -> &'static str {
        "server-message"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let target = request.require_str("target", DaemonError::InvalidMessage)?;
        let message = request.get_str("message").unwrap_or("");

        bot.find_server(name).await?.message(target, message);
        Ok(json!({}))
    }
}

pub struct ServerMe;

#[async_trait]
impl Command for ServerMe {
    fn name(&self) -> &'static str {
        "server-me"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let target = request.require_str("target", DaemonError::InvalidMessage)?;
        let message = request.get_str("message").unwrap_or("");

        bot.find_server(name).await?.me(target, message);
        Ok(json!({}))
    }
}

pub struct ServerNotice;

#[async_trait]
impl Command for ServerNotice {
    fn name(&self) -> &'static str {
        "server-notice"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let target = request.require_str("target", DaemonError::InvalidMessage)?;
        let message = request.get_str("message").unwrap_or("");

        bot.find_server(name).await?.notice(target, message);
        Ok(json!({}))
    }
}

pub struct ServerJoin;

#[async_trait]
impl Command for ServerJoin {
    fn name(&self) -> &'static str {
        "server-join"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let channel = request.require_str("channel", DaemonError::InvalidMessage)?;

        bot.find_server(name)
            .await?
            .join(channel, request.get_str("password"))
            .await;
        Ok(json!({}))
    }
}

pub struct ServerPart;

#[async_trait]
impl Command for ServerPart {
    fn name(&self) -> &'static str {
        "server-part"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let channel = request.require_str("channel", DaemonError::InvalidMessage)?;

        bot.find_server(name)
            .await?
            .part(channel, request.get_str("reason"));
        Ok(json!({}))
    }
}

pub struct ServerKick;

#[async_trait]
impl Command for ServerKick {
    fn name(&self) -> &'static str {
        "server-kick"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let channel = request.require_str("channel", DaemonError::InvalidMessage)?;
        let target = request.require_str("target", DaemonError::InvalidMessage)?;

        bot.find_server(name)
            .await?
            .kick(channel, target, request.get_str("reason"));
        Ok(json!({}))
    }
}

pub struct ServerInvite;

#[async_trait]
impl Command for ServerInvite {
    fn name(&self) -> &'static str {
        "server-invite"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let channel = request.require_str("channel", DaemonError::InvalidMessage)?;
        let target = request.require_str("target", DaemonError::InvalidMessage)?;

        bot.find_server(name).await?.invite(target, channel);
        Ok(json!({}))
    }
}

pub struct ServerMode;

#[async_trait]
impl Command for ServerMode {
    fn name(&self) -> &'static str {
        "server-mode"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let channel = request.require_str("channel", DaemonError::InvalidMessage)?;
        let mode = request.require_str("mode", DaemonError::InvalidMessage)?;

        bot.find_server(name).await?.mode(
            channel,
            mode,
            request.get_str("limit"),
            request.get_str("user"),
            request.get_str("mask"),
        );
        Ok(json!({}))
    }
}

pub struct ServerNick;

#[async_trait]
impl Command for ServerNick {
    fn name(&self) -> &'static str {
        "server-nick"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let nickname = request.require_str("nickname", ServerError::InvalidNickname)?;

        bot.find_server(name).await?.nick(nickname);
        Ok(json!({}))
    }
}

pub struct ServerTopic;

#[async_trait]
impl Command for ServerTopic {
    fn name(&self) -> &'static str {
        "server-topic"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let name = request.require_str("server", ServerError::InvalidIdentifier)?;
        let channel = request.require_str("channel", DaemonError::InvalidMessage)?;
        let topic = request.get_str("topic").unwrap_or("");

        bot.find_server(name).await?.topic(channel, topic);
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTable;
    use serde_json::json;

    async fn dispatch(bot: &Arc<Bot>, request: Value) -> Value {
        CommandTable::with_defaults()
            .dispatch(bot, request.as_object().unwrap())
            .await
    }

    #[tokio::test]
    async fn minimal_connect_registers_with_defaults() {
        let bot = Bot::new();

        let response = dispatch(
            &bot,
            json!({"command": "server-connect", "name": "local", "hostname": "irc.example.org"}),
        )
        .await;

        assert_eq!(response, json!({"command": "server-connect"}));

        let server = bot.find_server("local").await.unwrap();
        assert_eq!(server.config().port, 6667);
        assert_eq!(server.config().command_char, "!");
    }

    #[tokio::test]
    async fn out_of_range_port_is_rejected() {
        let bot = Bot::new();

        let response = dispatch(
            &bot,
            json!({
                "command": "server-connect",
                "name": "local",
                "hostname": "irc.example.org",
                "port": 1000000,
            }),
        )
        .await;

        assert_eq!(response["error"], 3);
        assert_eq!(response["errorCategory"], "server");
        assert!(bot.find_server("local").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let bot = Bot::new();

        let request = json!({
            "command": "server-connect",
            "name": "dup",
            "hostname": "irc.example.org",
        });
        let first = dispatch(&bot, request.clone()).await;
        assert!(first.get("error").is_none());

        let second = dispatch(&bot, request).await;
        assert_eq!(second["error"], 14);
        assert_eq!(second["errorCategory"], "server");
    }

    #[tokio::test]
    async fn info_reflects_configuration() {
        let bot = Bot::new();
        dispatch(
            &bot,
            json!({
                "command": "server-connect",
                "name": "local",
                "hostname": "irc.example.org",
                "port": 7000,
                "nickname": "mybot",
            }),
        )
        .await;

        let response = dispatch(
            &bot,
            json!({"command": "server-info", "server": "local"}),
        )
        .await;

        assert_eq!(response["name"], "local");
        assert_eq!(response["hostname"], "irc.example.org");
        assert_eq!(response["port"], 7000);
        assert_eq!(response["nickname"], "mybot");
    }

    #[tokio::test]
    async fn actions_require_a_known_server() {
        let bot = Bot::new();

        let response = dispatch(
            &bot,
            json!({
                "command": "server-message",
                "server": "missing",
                "target": "#chan",
                "message": "hi",
            }),
        )
        .await;

        assert_eq!(response["error"], 15);
        assert_eq!(response["errorCategory"], "server");
    }
}
