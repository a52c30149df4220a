//! Startup configuration.
//!
//! The config document is a sectioned TOML file; repeatable sections map to
//! arrays of tables (`[[server]]`, `[[rule]]`, ...). Loading parses the
//! document, `apply` constructs the initial services on the bot. Startup
//! configuration errors are fatal; the same constructors running at runtime
//! (`server-connect`) report to the requesting client instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::bot::Bot;
use crate::error::WireError;
use crate::hook::Hook;
use crate::rule::{Rule, RuleAction};
use crate::server::{ChannelSpec, ServerConfig};
use crate::transport::{TlsPaths, TransportSpec};

pub type ConfigResult<T> = core::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("in section [{section}]: {error}")]
    Invalid { section: String, error: WireError },

    #[error("in section [{section}]: missing key '{key}'")]
    MissingKey { section: String, key: String },

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralSection {
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub foreground: bool,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogsSection {
    /// `console` or `file`.
    #[serde(rename = "type")]
    pub sink: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSection {
    pub name: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub ipv4: Option<bool>,
    pub ipv6: Option<bool>,
    pub ssl: Option<bool>,
    pub ssl_verify: Option<bool>,
    pub password: Option<String>,
    pub nickname: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub ctcp_version: Option<String>,
    pub command_char: Option<String>,
    /// Space-separated `name[:key]` entries.
    pub channels: Option<String>,
    pub auto_rejoin: Option<bool>,
    pub join_invite: Option<bool>,
    pub ping_timeout: Option<u64>,
    pub reconnect_tries: Option<i32>,
    pub reconnect_delay: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuleSection {
    pub servers: Option<String>,
    pub channels: Option<String>,
    pub origins: Option<String>,
    pub plugins: Option<String>,
    pub events: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginSection {
    pub name: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransportSection {
    /// `unix` or `ip`.
    #[serde(rename = "type")]
    pub kind: String,
    pub path: Option<PathBuf>,
    pub address: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub ssl: bool,
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookSection {
    pub name: String,
    pub exec: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub general: GeneralSection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub server: Vec<ServerSection>,
    #[serde(default)]
    pub rule: Vec<RuleSection>,
    #[serde(default)]
    pub plugin: Vec<PluginSection>,
    #[serde(default)]
    pub transport: Vec<TransportSection>,
    #[serde(default)]
    pub hook: Vec<HookSection>,
    #[serde(default)]
    pub templates: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub options: HashMap<String, HashMap<String, String>>,
}

pub fn load(path: &Path) -> ConfigResult<Document> {
    let text = std::fs::read_to_string(path)?;
    let document = parse(&text)?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(document)
}

pub fn parse(text: &str) -> ConfigResult<Document> {
    Ok(toml::from_str(text)?)
}

fn split_list(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

impl ServerSection {
    pub fn to_config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();

        ServerConfig {
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            port: self.port.unwrap_or(defaults.port),
            ipv4: self.ipv4.unwrap_or(defaults.ipv4),
            ipv6: self.ipv6.unwrap_or(defaults.ipv6),
            ssl: self.ssl.unwrap_or(defaults.ssl),
            ssl_verify: self.ssl_verify.unwrap_or(defaults.ssl_verify),
            auto_rejoin: self.auto_rejoin.unwrap_or(defaults.auto_rejoin),
            join_invite: self.join_invite.unwrap_or(defaults.join_invite),
            nickname: self.nickname.clone().unwrap_or(defaults.nickname),
            username: self.username.clone().unwrap_or(defaults.username),
            realname: self.realname.clone().unwrap_or(defaults.realname),
            command_char: self.command_char.clone().unwrap_or(defaults.command_char),
            password: self.password.clone(),
            ctcp_version: self.ctcp_version.clone().unwrap_or(defaults.ctcp_version),
            ctcp_source: defaults.ctcp_source,
            ping_timeout: self
                .ping_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.ping_timeout),
            reconnect_delay: self
                .reconnect_delay
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_delay),
            reconnect_tries: self.reconnect_tries.unwrap_or(defaults.reconnect_tries),
            channels: split_list(&self.channels)
                .iter()
                .map(|entry| ChannelSpec::parse(entry))
                .collect(),
        }
    }
}

impl TransportSection {
    pub fn to_spec(&self) -> ConfigResult<TransportSpec> {
        match self.kind.as_str() {
            "unix" => {
                let path = self.path.clone().ok_or_else(|| ConfigError::MissingKey {
                    section: "transport".to_string(),
                    key: "path".to_string(),
                })?;

                Ok(TransportSpec::Unix {
                    path,
                    password: self.password.clone(),
                })
            }

            "ip" => {
                let port = self.port.ok_or_else(|| ConfigError::MissingKey {
                    section: "transport".to_string(),
                    key: "port".to_string(),
                })?;
                let address = match self.address.as_deref() {
                    None | Some("*") => "0.0.0.0".to_string(),
                    Some(address) => address.to_string(),
                };

                let tls = if self.ssl {
                    let certificate =
                        self.certificate
                            .clone()
                            .ok_or_else(|| ConfigError::MissingKey {
                                section: "transport".to_string(),
                                key: "certificate".to_string(),
                            })?;
                    let key = self.key.clone().ok_or_else(|| ConfigError::MissingKey {
                        section: "transport".to_string(),
                        key: "key".to_string(),
                    })?;
                    Some(TlsPaths { certificate, key })
                } else {
                    None
                };

                Ok(TransportSpec::Tcp {
                    address,
                    port,
                    password: self.password.clone(),
                    tls,
                })
            }

            other => Err(ConfigError::MissingKey {
                section: "transport".to_string(),
                key: format!("unknown type '{}'", other),
            }),
        }
    }
}

impl RuleSection {
    pub fn to_rule(&self) -> Result<Rule, WireError> {
        let action = match self.action.as_deref() {
            Some(action) => RuleAction::from_str(action)?,
            None => RuleAction::Accept,
        };

        Ok(Rule::new(
            split_list(&self.servers),
            split_list(&self.channels),
            split_list(&self.origins),
            split_list(&self.plugins),
            split_list(&self.events),
            action,
        )?)
    }
}

/// Constructs the initial services from a parsed document. Any failure here
/// aborts startup.
pub async fn apply(bot: &Arc<Bot>, document: &Document) -> ConfigResult<()> {
    for section in &document.rule {
        let rule = section.to_rule().map_err(|error| ConfigError::Invalid {
            section: "rule".to_string(),
            error,
        })?;
        bot.rules().write().await.add(rule);
    }

    for section in &document.plugin {
        bot.load_plugin(&section.name, section.path.as_deref())
            .await
            .map_err(|error| ConfigError::Invalid {
                section: format!("plugin] name={}", section.name),
                error,
            })?;

        if let Some(options) = document.options.get(&section.name) {
            let _ = bot.set_plugin_options(&section.name, options.clone()).await;
        }
        if let Some(templates) = document.templates.get(&section.name) {
            let _ = bot
                .set_plugin_templates(&section.name, templates.clone())
                .await;
        }
    }

    for section in &document.hook {
        bot.add_hook(Hook::new(&section.name, &section.exec)).await;
    }

    for section in &document.transport {
        let spec = section.to_spec()?;
        bot.add_transport(&spec).await?;
    }

    for section in &document.server {
        bot.add_server(section.to_config())
            .await
            .map_err(|error| ConfigError::Invalid {
                section: format!("server] name={}", section.name),
                error,
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
        [general]
        pid-file = "/run/irccd.pid"
        foreground = true

        [logs]
        type = "console"
        verbose = true

        [[server]]
        name = "local"
        hostname = "irc.example.org"
        port = 6697
        ssl = true
        channels = "#staff:key #games"
        command-char = "!"
        reconnect-tries = 5

        [[rule]]
        servers = "local"
        channels = "#staff"
        events = "onCommand"
        action = "drop"

        [[plugin]]
        name = "logger"

        [options.logger]
        path = "/var/log/irc.log"

        [templates.logger]
        message = "<#{origin}> #{message}"

        [[transport]]
        type = "unix"
        path = "/tmp/irccd-test.sock"

        [[hook]]
        name = "notify"
        exec = "/usr/local/bin/irc-notify"
    "##;

    #[test]
    fn parses_the_full_document() {
        let document = parse(SAMPLE).unwrap();

        assert_eq!(document.general.pid_file.as_deref().unwrap().to_str(), Some("/run/irccd.pid"));
        assert!(document.general.foreground);
        assert_eq!(document.logs.sink.as_deref(), Some("console"));
        assert!(document.logs.verbose);

        assert_eq!(document.server.len(), 1);
        let server = document.server[0].to_config();
        assert_eq!(server.name, "local");
        assert_eq!(server.port, 6697);
        assert!(server.ssl);
        assert_eq!(server.reconnect_tries, 5);
        assert_eq!(
            server.channels,
            vec![
                ChannelSpec {
                    name: "#staff".to_string(),
                    key: Some("key".to_string())
                },
                ChannelSpec {
                    name: "#games".to_string(),
                    key: None
                },
            ]
        );

        assert_eq!(document.rule.len(), 1);
        let rule = document.rule[0].to_rule().unwrap();
        assert!(rule.servers.contains("local"));
        assert_eq!(rule.action, crate::rule::RuleAction::Drop);

        assert_eq!(document.plugin[0].name, "logger");
        assert_eq!(
            document.options["logger"]["path"],
            "/var/log/irc.log"
        );
        assert_eq!(document.hook[0].name, "notify");
    }

    #[test]
    fn unknown_keys_do_not_abort() {
        let document = parse(
            r#"
            [general]
            some-future-key = 42

            [[server]]
            name = "local"
            hostname = "irc.example.org"
            brand-new-flag = true
        "#,
        )
        .unwrap();

        assert_eq!(document.server.len(), 1);
    }

    #[test]
    fn invalid_rule_event_is_an_error() {
        let document = parse(
            r#"
            [[rule]]
            events = "onBogus"
        "#,
        )
        .unwrap();

        assert!(document.rule[0].to_rule().is_err());
    }

    #[test]
    fn transport_spec_requirements() {
        let section = TransportSection {
            kind: "ip".to_string(),
            path: None,
            address: Some("*".to_string()),
            port: Some(6668),
            ssl: false,
            certificate: None,
            key: None,
            password: None,
        };
        assert_eq!(
            section.to_spec().unwrap(),
            TransportSpec::Tcp {
                address: "0.0.0.0".to_string(),
                port: 6668,
                password: None,
                tls: None,
            }
        );

        let missing_port = TransportSection {
            port: None,
            ..section.clone()
        };
        assert!(missing_port.to_spec().is_err());

        let ssl_without_cert = TransportSection {
            ssl: true,
            ..section
        };
        assert!(ssl_without_cert.to_spec().is_err());
    }

    #[tokio::test]
    async fn apply_builds_rules_and_plugins() {
        let bot = crate::bot::Bot::new();
        let document = parse(
            r##"
            [[rule]]
            channels = "#staff"
            action = "drop"

            [[plugin]]
            name = "logger"

            [options.logger]
            level = "info"
        "##,
        )
        .unwrap();

        apply(&bot, &document).await.unwrap();

        assert_eq!(bot.rules().read().await.len(), 1);
        let plugins = bot.plugins().read().await;
        assert_eq!(
            plugins.get("logger").unwrap().plugin.options()["level"],
            "info"
        );
    }

    #[tokio::test]
    async fn apply_rejects_unknown_plugin() {
        let bot = crate::bot::Bot::new();
        let document = parse(
            r#"
            [[plugin]]
            name = "no-such-plugin"
        "#,
        )
        .unwrap();

        assert!(apply(&bot, &document).await.is_err());
    }
}
