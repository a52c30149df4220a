//! Canonical event set and the table synthesizing events from parsed wire
//! messages.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::parsing::IrcMessage;
use crate::server::Server;

/// Aggregated WHOIS reply, collected across numerics 311/319 and flushed on
/// 318.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whois {
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub channels: Vec<String>,
}

/// One dispatched event. Every variant carries a shared handle to its
/// originating server; `onCommand` is not a variant because it is derived
/// per-plugin at dispatch time from `Message`.
#[derive(Debug, Clone)]
pub enum Event {
    Connect {
        server: Arc<Server>,
    },
    Disconnect {
        server: Arc<Server>,
    },
    Invite {
        server: Arc<Server>,
        origin: String,
        channel: String,
        target: String,
    },
    Join {
        server: Arc<Server>,
        origin: String,
        channel: String,
    },
    Kick {
        server: Arc<Server>,
        origin: String,
        channel: String,
        target: String,
        reason: String,
    },
    Me {
        server: Arc<Server>,
        origin: String,
        channel: String,
        message: String,
    },
    Message {
        server: Arc<Server>,
        origin: String,
        channel: String,
        message: String,
    },
    Mode {
        server: Arc<Server>,
        origin: String,
        channel: String,
        mode: String,
        limit: String,
        user: String,
        mask: String,
    },
    Names {
        server: Arc<Server>,
        channel: String,
        names: Vec<String>,
    },
    Nick {
        server: Arc<Server>,
        origin: String,
        nickname: String,
    },
    Notice {
        server: Arc<Server>,
        origin: String,
        channel: String,
        message: String,
    },
    Part {
        server: Arc<Server>,
        origin: String,
        channel: String,
        reason: String,
    },
    Topic {
        server: Arc<Server>,
        origin: String,
        channel: String,
        topic: String,
    },
    Whois {
        server: Arc<Server>,
        whois: Whois,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "onConnect",
            Event::Disconnect { .. } => "onDisconnect",
            Event::Invite { .. } => "onInvite",
            Event::Join { .. } => "onJoin",
            Event::Kick { .. } => "onKick",
            Event::Me { .. } => "onMe",
            Event::Message { .. } => "onMessage",
            Event::Mode { .. } => "onMode",
            Event::Names { .. } => "onNames",
            Event::Nick { .. } => "onNick",
            Event::Notice { .. } => "onNotice",
            Event::Part { .. } => "onPart",
            Event::Topic { .. } => "onTopic",
            Event::Whois { .. } => "onWhois",
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        match self {
            Event::Connect { server }
            | Event::Disconnect { server }
            | Event::Invite { server, .. }
            | Event::Join { server, .. }
            | Event::Kick { server, .. }
            | Event::Me { server, .. }
            | Event::Message { server, .. }
            | Event::Mode { server, .. }
            | Event::Names { server, .. }
            | Event::Nick { server, .. }
            | Event::Notice { server, .. }
            | Event::Part { server, .. }
            | Event::Topic { server, .. }
            | Event::Whois { server, .. } => server,
        }
    }

    /// Channel component for rule matching; empty for events without one.
    pub fn channel(&self) -> &str {
        match self {
            Event::Invite { channel, .. }
            | Event::Join { channel, .. }
            | Event::Kick { channel, .. }
            | Event::Me { channel, .. }
            | Event::Message { channel, .. }
            | Event::Mode { channel, .. }
            | Event::Names { channel, .. }
            | Event::Notice { channel, .. }
            | Event::Part { channel, .. }
            | Event::Topic { channel, .. } => channel,
            _ => "",
        }
    }

    /// Origin component for rule matching; empty for events without one.
    pub fn origin(&self) -> &str {
        match self {
            Event::Invite { origin, .. }
            | Event::Join { origin, .. }
            | Event::Kick { origin, .. }
            | Event::Me { origin, .. }
            | Event::Message { origin, .. }
            | Event::Mode { origin, .. }
            | Event::Nick { origin, .. }
            | Event::Notice { origin, .. }
            | Event::Part { origin, .. }
            | Event::Topic { origin, .. } => origin,
            _ => "",
        }
    }

    /// Canonical JSON broadcast form, shared by transport subscribers.
    pub fn to_json(&self) -> Value {
        let server = self.server().name();

        match self {
            Event::Connect { .. } | Event::Disconnect { .. } => json!({
                "event": self.name(),
                "server": server,
            }),
            Event::Invite {
                origin,
                channel,
                target,
                ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "channel": channel,
                "target": target,
            }),
            Event::Join {
                origin, channel, ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "channel": channel,
            }),
            Event::Kick {
                origin,
                channel,
                target,
                reason,
                ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "channel": channel,
                "target": target,
                "reason": reason,
            }),
            Event::Me {
                origin,
                channel,
                message,
                ..
            }
            | Event::Message {
                origin,
                channel,
                message,
                ..
            }
            | Event::Notice {
                origin,
                channel,
                message,
                ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "channel": channel,
                "message": message,
            }),
            Event::Mode {
                origin,
                channel,
                mode,
                limit,
                user,
                mask,
                ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "channel": channel,
                "mode": mode,
                "limit": limit,
                "user": user,
                "mask": mask,
            }),
            Event::Names { channel, names, .. } => json!({
                "event": self.name(),
                "server": server,
                "channel": channel,
                "names": names,
            }),
            Event::Nick {
                origin, nickname, ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "nickname": nickname,
            }),
            Event::Part {
                origin,
                channel,
                reason,
                ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "channel": channel,
                "reason": reason,
            }),
            Event::Topic {
                origin,
                channel,
                topic,
                ..
            } => json!({
                "event": self.name(),
                "server": server,
                "origin": origin,
                "channel": channel,
                "topic": topic,
            }),
            Event::Whois { whois, .. } => json!({
                "event": self.name(),
                "server": server,
                "nick": whois.nick,
                "user": whois.user,
                "host": whois.host,
                "realname": whois.realname,
                "channels": whois.channels,
            }),
        }
    }

    /// Positional argv for hook invocation: the event's fields in canonical
    /// order, lists joined by commas, the server by its id.
    pub fn hook_args(&self) -> Vec<String> {
        let mut args = vec![self.server().name().to_string()];

        match self {
            Event::Connect { .. } | Event::Disconnect { .. } => {}
            Event::Invite {
                origin,
                channel,
                target,
                ..
            } => args.extend([origin.clone(), channel.clone(), target.clone()]),
            Event::Join {
                origin, channel, ..
            } => args.extend([origin.clone(), channel.clone()]),
            Event::Kick {
                origin,
                channel,
                target,
                reason,
                ..
            } => args.extend([
                origin.clone(),
                channel.clone(),
                target.clone(),
                reason.clone(),
            ]),
            Event::Me {
                origin,
                channel,
                message,
                ..
            }
            | Event::Message {
                origin,
                channel,
                message,
                ..
            }
            | Event::Notice {
                origin,
                channel,
                message,
                ..
            } => args.extend([origin.clone(), channel.clone(), message.clone()]),
            Event::Mode {
                origin,
                channel,
                mode,
                limit,
                user,
                mask,
                ..
            } => args.extend([
                origin.clone(),
                channel.clone(),
                mode.clone(),
                limit.clone(),
                user.clone(),
                mask.clone(),
            ]),
            Event::Names { channel, names, .. } => {
                args.extend([channel.clone(), names.join(",")])
            }
            Event::Nick {
                origin, nickname, ..
            } => args.extend([origin.clone(), nickname.clone()]),
            Event::Part {
                origin,
                channel,
                reason,
                ..
            } => args.extend([origin.clone(), channel.clone(), reason.clone()]),
            Event::Topic {
                origin,
                channel,
                topic,
                ..
            } => args.extend([origin.clone(), channel.clone(), topic.clone()]),
            Event::Whois { whois, .. } => args.extend([
                whois.nick.clone(),
                whois.user.clone(),
                whois.host.clone(),
                whois.realname.clone(),
                whois.channels.join(","),
            ]),
        }

        args
    }
}

/// Maps wire messages to events and keeps the per-session aggregation
/// buffers (NAMES and WHOIS replies span several numerics). Membership
/// mutation happens here as a side effect of the commands that carry it.
#[derive(Debug, Default)]
pub struct EventFactory {
    names: HashMap<String, Vec<String>>,
    whois: HashMap<String, Whois>,
}

impl EventFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a message target: channels stay as-is, private targets
    /// collapse to the origin nick so queries look like a channel
    /// conversation with the sender.
    async fn resolve_target<'a>(
        server: &Arc<Server>,
        target: &'a str,
        origin: &'a str,
    ) -> &'a str {
        if server.is_channel(target).await {
            target
        } else {
            origin
        }
    }

    pub async fn synthesize(
        &mut self,
        server: &Arc<Server>,
        msg: &IrcMessage,
    ) -> Option<Event> {
        let origin = msg.origin().to_string();

        match msg.command.as_str() {
            "PRIVMSG" => {
                let target = msg.param(0);
                let text = msg.param(1);
                let channel =
                    Self::resolve_target(server, target, &origin).await.to_string();

                match IrcMessage::ctcp(text) {
                    Some(ctcp) => match ctcp.split_once(' ') {
                        Some(("ACTION", action)) => Some(Event::Me {
                            server: server.clone(),
                            origin,
                            channel,
                            message: action.to_string(),
                        }),
                        // other CTCP requests are answered by the session
                        // loop, not dispatched
                        _ => None,
                    },
                    None => Some(Event::Message {
                        server: server.clone(),
                        origin,
                        channel,
                        message: text.to_string(),
                    }),
                }
            }

            "NOTICE" => {
                let target = msg.param(0);
                let channel =
                    Self::resolve_target(server, target, &origin).await.to_string();

                Some(Event::Notice {
                    server: server.clone(),
                    origin,
                    channel,
                    message: msg.param(1).to_string(),
                })
            }

            "JOIN" => {
                let channel = msg.param(0).to_string();
                server.member_joined(&channel, &origin).await;

                Some(Event::Join {
                    server: server.clone(),
                    origin,
                    channel,
                })
            }

            "PART" => {
                let channel = msg.param(0).to_string();
                server.member_left(&channel, &origin).await;

                Some(Event::Part {
                    server: server.clone(),
                    origin,
                    channel,
                    reason: msg.param(1).to_string(),
                })
            }

            "KICK" => {
                let channel = msg.param(0).to_string();
                let target = msg.param(1).to_string();
                server.member_left(&channel, &target).await;

                Some(Event::Kick {
                    server: server.clone(),
                    origin,
                    channel,
                    target,
                    reason: msg.param(2).to_string(),
                })
            }

            "TOPIC" => Some(Event::Topic {
                server: server.clone(),
                origin,
                channel: msg.param(0).to_string(),
                topic: msg.param(1).to_string(),
            }),

            "MODE" => {
                let channel = msg.param(0).to_string();
                let mode = msg.param(1).to_string();

                if server.is_channel(&channel).await {
                    server
                        .apply_mode(&channel, &mode, &msg.params[2.min(msg.params.len())..])
                        .await;
                }

                Some(Event::Mode {
                    server: server.clone(),
                    origin,
                    channel,
                    mode,
                    limit: msg.param(2).to_string(),
                    user: msg.param(3).to_string(),
                    mask: msg.param(4).to_string(),
                })
            }

            "INVITE" => Some(Event::Invite {
                server: server.clone(),
                origin,
                channel: msg.param(1).to_string(),
                target: msg.param(0).to_string(),
            }),

            "NICK" => {
                let nickname = msg.param(0).to_string();
                server.member_renamed(&origin, &nickname).await;

                Some(Event::Nick {
                    server: server.clone(),
                    origin,
                    nickname,
                })
            }

            "QUIT" => {
                // not part of the canonical event set; membership only
                server.member_quit(&origin).await;
                None
            }

            "005" => {
                server.update_isupport(&msg.params).await;
                None
            }

            // NAMES reply: 353 carries the member chunk, 366 flushes
            "353" => {
                let channel = msg.param(msg.params.len().saturating_sub(2)).to_string();
                let chunk = msg
                    .params
                    .last()
                    .map(String::as_str)
                    .unwrap_or("")
                    .split_whitespace()
                    .map(str::to_string);

                self.names
                    .entry(crate::util::irc_lower(&channel))
                    .or_default()
                    .extend(chunk);
                None
            }

            "366" => {
                let channel = msg.param(1).to_string();
                let decorated = self
                    .names
                    .remove(&crate::util::irc_lower(&channel))
                    .unwrap_or_default();

                server.set_members(&channel, &decorated).await;

                let isupport = server.isupport().await;
                let names = decorated
                    .iter()
                    .map(|name| {
                        name.trim_start_matches(|ch| isupport.symbol_bit(ch).is_some())
                            .to_string()
                    })
                    .collect();

                Some(Event::Names {
                    server: server.clone(),
                    channel,
                    names,
                })
            }

            // WHOIS reply: 311 identity, 319 channels, 318 flushes
            "311" => {
                let nick = msg.param(1).to_string();
                let entry = self.whois.entry(crate::util::irc_lower(&nick)).or_default();
                entry.nick = nick;
                entry.user = msg.param(2).to_string();
                entry.host = msg.param(3).to_string();
                entry.realname = msg.param(5).to_string();
                None
            }

            "319" => {
                let nick = crate::util::irc_lower(msg.param(1));
                let channels = msg
                    .param(2)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                self.whois.entry(nick).or_default().channels = channels;
                None
            }

            "318" => {
                let key = crate::util::irc_lower(msg.param(1));
                self.whois.remove(&key).map(|whois| Event::Whois {
                    server: server.clone(),
                    whois,
                })
            }

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::IrcParser;
    use crate::server::ServerConfig;

    fn server() -> Arc<Server> {
        let config = ServerConfig {
            name: "local".to_string(),
            hostname: "irc.example.org".to_string(),
            ..ServerConfig::default()
        };
        let (server, _cmd_rx) = Server::new(config);
        Arc::new(server)
    }

    async fn synth(factory: &mut EventFactory, server: &Arc<Server>, line: &str) -> Option<Event> {
        let msg = IrcParser::new().parse(line).unwrap();
        factory.synthesize(server, &msg).await
    }

    #[tokio::test]
    async fn privmsg_to_channel() {
        let server = server();
        let mut factory = EventFactory::new();

        let ev = synth(&mut factory, &server, ":alice!a@h PRIVMSG #staff :hi all")
            .await
            .unwrap();

        match ev {
            Event::Message {
                origin,
                channel,
                message,
                ..
            } => {
                assert_eq!(origin, "alice");
                assert_eq!(channel, "#staff");
                assert_eq!(message, "hi all");
            }
            other => panic!("expected Message, got {:?}", other.name()),
        }
    }

    #[tokio::test]
    async fn private_message_collapses_to_origin() {
        let server = server();
        let mut factory = EventFactory::new();

        let ev = synth(&mut factory, &server, ":alice!a@h PRIVMSG irccd :psst")
            .await
            .unwrap();

        assert_eq!(ev.channel(), "alice");
        assert_eq!(ev.name(), "onMessage");
    }

    #[tokio::test]
    async fn ctcp_action_becomes_me() {
        let server = server();
        let mut factory = EventFactory::new();

        let ev = synth(
            &mut factory,
            &server,
            ":alice!a@h PRIVMSG #staff :\u{1}ACTION waves\u{1}",
        )
        .await
        .unwrap();

        match ev {
            Event::Me { message, .. } => assert_eq!(message, "waves"),
            other => panic!("expected Me, got {:?}", other.name()),
        }
    }

    #[tokio::test]
    async fn ctcp_version_request_is_not_dispatched() {
        let server = server();
        let mut factory = EventFactory::new();

        let ev = synth(
            &mut factory,
            &server,
            ":alice!a@h PRIVMSG irccd :\u{1}VERSION\u{1}",
        )
        .await;
        assert!(ev.is_none());
    }

    #[tokio::test]
    async fn names_aggregation() {
        let server = server();
        let mut factory = EventFactory::new();

        assert!(
            synth(
                &mut factory,
                &server,
                ":srv 353 irccd = #room :@op +voiced",
            )
            .await
            .is_none()
        );
        assert!(
            synth(&mut factory, &server, ":srv 353 irccd = #room :plain")
                .await
                .is_none()
        );

        let ev = synth(&mut factory, &server, ":srv 366 irccd #room :End of names")
            .await
            .unwrap();

        match ev {
            Event::Names { channel, names, .. } => {
                assert_eq!(channel, "#room");
                assert_eq!(names, vec!["op", "voiced", "plain"]);
            }
            other => panic!("expected Names, got {:?}", other.name()),
        }

        let members = server.channels().await[0].members.clone();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].nick, "op");
        assert_eq!(members[0].modes, 1);
    }

    #[tokio::test]
    async fn whois_aggregation() {
        let server = server();
        let mut factory = EventFactory::new();

        synth(
            &mut factory,
            &server,
            ":srv 311 irccd alice ~alice host.tld * :Alice Liddell",
        )
        .await;
        synth(&mut factory, &server, ":srv 319 irccd alice :#staff #games")
            .await;

        let ev = synth(&mut factory, &server, ":srv 318 irccd alice :End of WHOIS")
            .await
            .unwrap();

        match ev {
            Event::Whois { whois, .. } => {
                assert_eq!(whois.nick, "alice");
                assert_eq!(whois.user, "~alice");
                assert_eq!(whois.host, "host.tld");
                assert_eq!(whois.realname, "Alice Liddell");
                assert_eq!(whois.channels, vec!["#staff", "#games"]);
            }
            other => panic!("expected Whois, got {:?}", other.name()),
        }
    }

    #[tokio::test]
    async fn quit_mutates_membership_without_event() {
        let server = server();
        let mut factory = EventFactory::new();

        synth(&mut factory, &server, ":alice!a@h JOIN #room").await;
        assert_eq!(server.channels().await[0].members.len(), 1);

        let ev = synth(&mut factory, &server, ":alice!a@h QUIT :bye").await;
        assert!(ev.is_none());
        assert!(server.channels().await[0].members.is_empty());
    }

    #[tokio::test]
    async fn broadcast_json_shape() {
        let server = server();
        let mut factory = EventFactory::new();

        let ev = synth(&mut factory, &server, ":alice!a@h PRIVMSG #staff :hello")
            .await
            .unwrap();
        let json = ev.to_json();

        assert_eq!(json["event"], "onMessage");
        assert_eq!(json["server"], "local");
        assert_eq!(json["origin"], "alice");
        assert_eq!(json["channel"], "#staff");
        assert_eq!(json["message"], "hello");
    }

    #[tokio::test]
    async fn hook_args_order() {
        let server = server();
        let mut factory = EventFactory::new();

        let ev = synth(
            &mut factory,
            &server,
            ":bob!b@h KICK #room alice :flooding",
        )
        .await
        .unwrap();

        assert_eq!(
            ev.hook_args(),
            vec!["local", "bob", "#room", "alice", "flooding"]
        );
    }
}
