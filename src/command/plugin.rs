//! `plugin-*` command handlers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::bot::Bot;
use crate::command::{Command, Request};
use crate::error::{PluginError, WireResult};

pub struct PluginConfig;

#[async_trait]
impl Command for PluginConfig {
    fn name(&self) -> &'static str {
        "plugin-config"
    }

    /// With `value`: set one variable. With only `variable`: get one. With
    /// neither: get the whole options map.
    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let id = request.require_str("plugin", PluginError::NotFound)?;
        let plugin = {
            let plugins = bot.plugins().read().await;
            plugins
                .get(id)
                .ok_or(PluginError::NotFound)?
                .plugin
                .clone()
        };

        match (request.get_str("variable"), request.get_str("value")) {
            (Some(variable), Some(value)) => {
                let mut options = plugin.options();
                options.insert(variable.to_string(), value.to_string());
                plugin.set_options(options);
                Ok(json!({}))
            }
            (Some(variable), None) => {
                let options = plugin.options();
                let value = options.get(variable).cloned().unwrap_or_default();
                Ok(json!({ "variables": { variable: value } }))
            }
            (None, _) => {
                let options: HashMap<String, String> = plugin.options();
                Ok(json!({ "variables": options }))
            }
        }
    }
}

pub struct PluginInfo;

#[async_trait]
impl Command for PluginInfo {
    fn name(&self) -> &'static str {
        "plugin-info"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let id = request.require_str("plugin", PluginError::NotFound)?;
        let plugins = bot.plugins().read().await;
        let plugin = &plugins.get(id).ok_or(PluginError::NotFound)?.plugin;

        Ok(json!({
            "name": plugin.name(),
            "author": plugin.author(),
            "license": plugin.license(),
            "summary": plugin.summary(),
            "version": plugin.version(),
        }))
    }
}

pub struct PluginList;

#[async_trait]
impl Command for PluginList {
    fn name(&self) -> &'static str {
        "plugin-list"
    }

    async fn execute(&self, bot: &Arc<Bot>, _request: &Request<'_>) -> WireResult<Value> {
        let plugins = bot.plugins().read().await;
        let list: Vec<String> = plugins
            .list()
            .iter()
            .map(|entry| entry.id.clone())
            .collect();

        Ok(json!({ "list": list }))
    }
}

pub struct PluginLoad;

#[async_trait]
impl Command for PluginLoad {
    fn name(&self) -> &'static str {
        "plugin-load"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let id = request.require_str("plugin", PluginError::NotFound)?;
        let path = request.get_str("path").map(PathBuf::from);

        bot.load_plugin(id, path.as_deref()).await?;
        Ok(json!({}))
    }
}

pub struct PluginReload;

#[async_trait]
impl Command for PluginReload {
    fn name(&self) -> &'static str {
        "plugin-reload"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let id = request.require_str("plugin", PluginError::NotFound)?;

        bot.reload_plugin(id).await?;
        Ok(json!({}))
    }
}

pub struct PluginUnload;

#[async_trait]
impl Command for PluginUnload {
    fn name(&self) -> &'static str {
        "plugin-unload"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let id = request.require_str("plugin", PluginError::NotFound)?;

        bot.unload_plugin(id).await?;
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTable;

    async fn dispatch(bot: &Arc<Bot>, request: Value) -> Value {
        CommandTable::with_defaults()
            .dispatch(bot, request.as_object().unwrap())
            .await
    }

    #[tokio::test]
    async fn load_info_unload_cycle() {
        let bot = Bot::new();

        let response =
            dispatch(&bot, json!({"command": "plugin-load", "plugin": "logger"})).await;
        assert!(response.get("error").is_none());

        let info =
            dispatch(&bot, json!({"command": "plugin-info", "plugin": "logger"})).await;
        assert_eq!(info["name"], "logger");
        assert!(info["version"].as_str().is_some());

        let list = dispatch(&bot, json!({"command": "plugin-list"})).await;
        assert_eq!(list["list"], json!(["logger"]));

        let response = dispatch(
            &bot,
            json!({"command": "plugin-unload", "plugin": "logger"}),
        )
        .await;
        assert!(response.get("error").is_none());

        let list = dispatch(&bot, json!({"command": "plugin-list"})).await;
        assert_eq!(list["list"], json!([]));
    }

    #[tokio::test]
    async fn duplicate_load_is_rejected() {
        let bot = Bot::new();

        dispatch(&bot, json!({"command": "plugin-load", "plugin": "logger"})).await;
        let response =
            dispatch(&bot, json!({"command": "plugin-load", "plugin": "logger"})).await;

        assert_eq!(response["error"], 2);
        assert_eq!(response["errorCategory"], "plugin");
    }

    #[tokio::test]
    async fn unknown_plugin_is_not_found() {
        let bot = Bot::new();

        for command in ["plugin-info", "plugin-reload", "plugin-unload", "plugin-load"] {
            let response =
                dispatch(&bot, json!({"command": command, "plugin": "ghost"})).await;
            assert_eq!(response["error"], 1, "{}", command);
            assert_eq!(response["errorCategory"], "plugin");
        }
    }

    #[tokio::test]
    async fn config_get_and_set() {
        let bot = Bot::new();
        dispatch(&bot, json!({"command": "plugin-load", "plugin": "logger"})).await;

        let response = dispatch(
            &bot,
            json!({
                "command": "plugin-config",
                "plugin": "logger",
                "variable": "path",
                "value": "/var/log/irc.log",
            }),
        )
        .await;
        assert!(response.get("error").is_none());

        let response = dispatch(
            &bot,
            json!({"command": "plugin-config", "plugin": "logger", "variable": "path"}),
        )
        .await;
        assert_eq!(response["variables"]["path"], "/var/log/irc.log");

        let response = dispatch(
            &bot,
            json!({"command": "plugin-config", "plugin": "logger"}),
        )
        .await;
        assert_eq!(response["variables"]["path"], "/var/log/irc.log");
    }
}
