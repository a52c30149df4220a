//! Control-protocol command table.
//!
//! Commands are named handlers mapping one JSON request to one JSON
//! response. Success responses echo the command name; failures are
//! projected through the error taxonomy into `error`/`errorCategory`
//! fields. Request and response fields use camelCase.

mod plugin;
mod rule;
mod server;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::bot::Bot;
use crate::error::{DaemonError, RuleError, WireError, WireResult};

/// Typed accessors over one request object.
pub struct Request<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Request<'a> {
    pub fn new(fields: &'a Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get_str(&self, key: &str) -> Option<&'a str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// String array field; a missing key is an empty list.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn require_str(&self, key: &str, err: impl Into<WireError>) -> WireResult<&'a str> {
        self.get_str(key).ok_or_else(|| err.into())
    }

    /// Rule index: a non-negative integer.
    pub fn require_index(&self, key: &str) -> WireResult<usize> {
        match self.fields.get(key) {
            Some(Value::Number(number)) => number
                .as_u64()
                .map(|index| index as usize)
                .ok_or_else(|| RuleError::InvalidIndex.into()),
            _ => Err(RuleError::InvalidIndex.into()),
        }
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the payload merged into the response envelope on success.
    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value>;
}

pub struct CommandTable {
    commands: Vec<Box<dyn Command>>,
}

impl CommandTable {
    /// The full catalog consumed by irccdctl.
    pub fn with_defaults() -> Self {
        let mut table = Self {
            commands: Vec::new(),
        };

        table.register(Box::new(server::ServerConnect));
        table.register(Box::new(server::ServerDisconnect));
        table.register(Box::new(server::ServerReconnect));
        table.register(Box::new(server::ServerInfo));
        table.register(Box::new(server::ServerList));
        table.register(Box::new(server::ServerMessage));
        table.register(Box::new(server::ServerMe));
        table.register(Box::new(server::ServerNotice));
        table.register(Box::new(server::ServerJoin));
        table.register(Box::new(server::ServerPart));
        table.register(Box::new(server::ServerKick));
        table.register(Box::new(server::ServerInvite));
        table.register(Box::new(server::ServerMode));
        table.register(Box::new(server::ServerNick));
        table.register(Box::new(server::ServerTopic));
        table.register(Box::new(rule::RuleAdd));
        table.register(Box::new(rule::RuleEditCommand));
        table.register(Box::new(rule::RuleInfo));
        table.register(Box::new(rule::RuleList));
        table.register(Box::new(rule::RuleMove));
        table.register(Box::new(rule::RuleRemove));
        table.register(Box::new(plugin::PluginConfig));
        table.register(Box::new(plugin::PluginInfo));
        table.register(Box::new(plugin::PluginList));
        table.register(Box::new(plugin::PluginLoad));
        table.register(Box::new(plugin::PluginReload));
        table.register(Box::new(plugin::PluginUnload));

        table
    }

    pub fn register(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Command> {
        self.commands
            .iter()
            .find(|command| command.name() == name)
            .map(Box::as_ref)
    }

    /// Full request cycle: resolve the handler, run it, build the response
    /// envelope. Every response carries the request's command name back.
    pub async fn dispatch(&self, bot: &Arc<Bot>, request: &Map<String, Value>) -> Value {
        let name = request
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let Some(command) = self.find(&name) else {
            return error_envelope(&name, &DaemonError::InvalidMessage.into());
        };

        match command.execute(bot, &Request::new(request)).await {
            Ok(payload) => {
                let mut envelope = payload.as_object().cloned().unwrap_or_default();
                envelope.insert("command".to_string(), Value::String(name));
                Value::Object(envelope)
            }
            Err(err) => error_envelope(&name, &err),
        }
    }
}

pub fn error_envelope(command: &str, err: &WireError) -> Value {
    json!({
        "command": command,
        "error": err.code(),
        "errorCategory": err.category(),
    })
}
