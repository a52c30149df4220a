//! `rule-*` command handlers.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::bot::Bot;
use crate::command::{Command, Request};
use crate::error::{RuleError, WireResult};
use crate::rule::{Rule, RuleAction, RuleEdit};

fn rule_to_json(rule: &Rule) -> Value {
    json!({
        "servers": rule.servers.iter().collect::<Vec<_>>(),
        "channels": rule.channels.iter().collect::<Vec<_>>(),
        "origins": rule.origins.iter().collect::<Vec<_>>(),
        "plugins": rule.plugins.iter().collect::<Vec<_>>(),
        "events": rule.events.iter().collect::<Vec<_>>(),
        "action": rule.action.as_str(),
    })
}

fn rule_from_request(request: &Request<'_>) -> WireResult<Rule> {
    let action = match request.get_str("action") {
        Some(action) => RuleAction::from_str(action)?,
        None => RuleAction::Accept,
    };

    Ok(Rule::new(
        request.get_str_list("servers"),
        request.get_str_list("channels"),
        request.get_str_list("origins"),
        request.get_str_list("plugins"),
        request.get_str_list("events"),
        action,
    )?)
}

pub struct RuleAdd;

#[async_trait]
impl Command for RuleAdd {
    fn name(&self) -> &'static str {
        "rule-add"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let rule = rule_from_request(request)?;
        let mut rules = bot.rules().write().await;

        match request.has("index") {
            true => rules.insert(rule, request.require_index("index")?),
            false => rules.add(rule),
        }

        Ok(json!({}))
    }
}

pub struct RuleEditCommand;

#[async_trait]
impl Command for RuleEditCommand {
    fn name(&self) -> &'static str {
        "rule-edit"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let index = request.require_index("index")?;

        let edit = RuleEdit {
            add_servers: request.get_str_list("add-servers"),
            remove_servers: request.get_str_list("remove-servers"),
            add_channels: request.get_str_list("add-channels"),
            remove_channels: request.get_str_list("remove-channels"),
            add_origins: request.get_str_list("add-origins"),
            remove_origins: request.get_str_list("remove-origins"),
            add_plugins: request.get_str_list("add-plugins"),
            remove_plugins: request.get_str_list("remove-plugins"),
            add_events: request.get_str_list("add-events"),
            remove_events: request.get_str_list("remove-events"),
            action: match request.get_str("action") {
                Some(action) => Some(RuleAction::from_str(action)?),
                None => None,
            },
        };

        bot.rules().write().await.edit(index, &edit)?;
        Ok(json!({}))
    }
}

pub struct RuleInfo;

#[async_trait]
impl Command for RuleInfo {
    fn name(&self) -> &'static str {
        "rule-info"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let index = request.require_index("index")?;
        let rules = bot.rules().read().await;

        Ok(rule_to_json(rules.get(index)?))
    }
}

pub struct RuleList;

#[async_trait]
impl Command for RuleList {
    fn name(&self) -> &'static str {
        "rule-list"
    }

    async fn execute(&self, bot: &Arc<Bot>, _request: &Request<'_>) -> WireResult<Value> {
        let rules = bot.rules().read().await;
        let list: Vec<Value> = rules.list().iter().map(rule_to_json).collect();

        Ok(json!({ "list": list }))
    }
}

pub struct RuleMove;

#[async_trait]
impl Command for RuleMove {
    fn name(&self) -> &'static str {
        "rule-move"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let from = request.require_index("from")?;
        let to = request.require_index("to")?;

        bot.rules().write().await.relocate(from, to)?;
        Ok(json!({}))
    }
}

pub struct RuleRemove;

#[async_trait]
impl Command for RuleRemove {
    fn name(&self) -> &'static str {
        "rule-remove"
    }

    async fn execute(&self, bot: &Arc<Bot>, request: &Request<'_>) -> WireResult<Value> {
        let index = request.require_index("index")?;

        bot.rules().write().await.remove(index)?;
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
    async fn add_edit_info_cycle() {
        let bot = Bot::new();

        let response = dispatch(
            &bot,
            json!({
                "command": "rule-add",
                "servers": ["local"],
                "events": ["onCommand"],
                "action": "drop",
            }),
        )
        .await;
        assert!(response.get("error").is_none());

        let response = dispatch(
            &bot,
            json!({
                "command": "rule-edit",
                "index": 0,
                "add-servers": ["new-s"],
                "remove-events": ["onCommand"],
                "action": "accept",
            }),
        )
        .await;
        assert!(response.get("error").is_none());

        let info = dispatch(&bot, json!({"command": "rule-info", "index": 0})).await;
        assert_eq!(info["servers"], json!(["local", "new-s"]));
        assert_eq!(info["events"], json!([]));
        assert_eq!(info["action"], "accept");
    }

    #[tokio::test]
    async fn invalid_event_and_action_codes() {
        let bot = Bot::new();

        let response = dispatch(
            &bot,
            json!({"command": "rule-add", "events": ["onBogus"]}),
        )
        .await;
        assert_eq!(response["error"], 3);
        assert_eq!(response["errorCategory"], "rule");

        let response = dispatch(
            &bot,
            json!({"command": "rule-add", "action": "maybe"}),
        )
        .await;
        assert_eq!(response["error"], 2);
        assert_eq!(response["errorCategory"], "rule");
    }

    #[tokio::test]
    async fn move_and_remove_bounds() {
        let bot = Bot::new();

        for server in ["s0", "s1", "s2"] {
            dispatch(
                &bot,
                json!({"command": "rule-add", "servers": [server]}),
            )
            .await;
        }

        let response =
            dispatch(&bot, json!({"command": "rule-move", "from": 2, "to": 0})).await;
        assert!(response.get("error").is_none());

        let list = dispatch(&bot, json!({"command": "rule-list"})).await;
        let order: Vec<_> = list["list"]
            .as_array()
            .unwrap()
            .iter()
            .map(|rule| rule["servers"][0].as_str().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["s2", "s0", "s1"]);

        let response =
            dispatch(&bot, json!({"command": "rule-remove", "index": 9})).await;
        assert_eq!(response["error"], 1);
        assert_eq!(response["errorCategory"], "rule");
    }
}
