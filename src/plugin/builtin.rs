//! Builtin plugin registry.
//!
//! The daemon registers constructors for the plugins compiled into the
//! binary; the loader claims an id when a constructor with that exact name
//! exists. External loader types (shared objects, scripting runtimes) plug
//! into the same [`PluginLoader`](crate::plugin::PluginLoader) seam.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use crate::bot::Bot;
use crate::error::PluginError;
use crate::plugin::templates;
use crate::plugin::{HandlerResult, HttpRequest, Plugin, PluginLoader};
use crate::server::event::Event;

type Constructor = fn() -> Arc<dyn Plugin>;

#[derive(Default)]
pub struct BuiltinLoader {
    constructors: Vec<(String, Constructor)>,
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard set shipped with the daemon.
    pub fn with_defaults() -> Self {
        let mut loader = Self::new();
        loader.register("links", || Arc::new(LinksPlugin::new()));
        loader.register("logger", || Arc::new(LoggerPlugin::new()));
        loader
    }

    pub fn register(&mut self, id: &str, constructor: Constructor) {
        self.constructors.push((id.to_string(), constructor));
    }
}

#[async_trait]
impl PluginLoader for BuiltinLoader {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn open(
        &self,
        id: &str,
        _path: Option<&Path>,
    ) -> Result<Option<Arc<dyn Plugin>>, PluginError> {
        Ok(self
            .constructors
            .iter()
            .find(|(name, _)| name == id)
            .map(|(_, constructor)| constructor()))
    }
}

/// Writes a formatted line to the log for chat activity it sees. The
/// formats come from the user template map, so `set_templates` changes the
/// output live.
pub struct LoggerPlugin {
    options: RwLock<HashMap<String, String>>,
    templates: RwLock<HashMap<String, String>>,
}

impl LoggerPlugin {
    pub fn new() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(
            "message".to_string(),
            "#{origin} on #{channel}: #{message}".to_string(),
        );
        defaults.insert(
            "me".to_string(),
            "* #{origin} #{message} (#{channel})".to_string(),
        );
        defaults.insert(
            "join".to_string(),
            "#{origin} joined #{channel}".to_string(),
        );
        defaults.insert(
            "part".to_string(),
            "#{origin} left #{channel}".to_string(),
        );
        defaults.insert(
            "topic".to_string(),
            "#{origin} set #{channel} topic to: #{topic}".to_string(),
        );

        Self {
            options: RwLock::new(HashMap::new()),
            templates: RwLock::new(defaults),
        }
    }

    fn log(&self, key: &str, keywords: &[(&str, &str)]) {
        let template = match self.templates.read().unwrap().get(key) {
            Some(template) => template.clone(),
            None => return,
        };

        let keywords: HashMap<String, String> = keywords
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        match templates::expand(&template, &keywords) {
            Ok(line) => info!(plugin = "logger", "{}", line),
            Err(err) => info!(plugin = "logger", error = %err, "bad template"),
        }
    }
}

#[async_trait]
impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        "logger"
    }

    fn author(&self) -> &str {
        "irccd developers"
    }

    fn license(&self) -> &str {
        "ISC"
    }

    fn summary(&self) -> &str {
        "log channel activity"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn options(&self) -> HashMap<String, String> {
        self.options.read().unwrap().clone()
    }

    fn set_options(&self, options: HashMap<String, String>) {
        *self.options.write().unwrap() = options;
    }

    fn templates(&self) -> HashMap<String, String> {
        self.templates.read().unwrap().clone()
    }

    fn set_templates(&self, templates: HashMap<String, String>) {
        self.templates.write().unwrap().extend(templates);
    }

    async fn handle_message(&self, _bot: &Arc<Bot>, event: &Event) -> HandlerResult {
        if let Event::Message {
            origin,
            channel,
            message,
            ..
        } = event
        {
            self.log(
                "message",
                &[
                    ("origin", origin),
                    ("channel", channel),
                    ("message", message),
                ],
            );
        }

        Ok(())
    }

    async fn handle_me(&self, _bot: &Arc<Bot>, event: &Event) -> HandlerResult {
        if let Event::Me {
            origin,
            channel,
            message,
            ..
        } = event
        {
            self.log(
                "me",
                &[
                    ("origin", origin),
                    ("channel", channel),
                    ("message", message),
                ],
            );
        }

        Ok(())
    }

    async fn handle_join(&self, _bot: &Arc<Bot>, event: &Event) -> HandlerResult {
        if let Event::Join {
            origin, channel, ..
        } = event
        {
            self.log("join", &[("origin", origin), ("channel", channel)]);
        }

        Ok(())
    }

    async fn handle_part(&self, _bot: &Arc<Bot>, event: &Event) -> HandlerResult {
        if let Event::Part {
            origin, channel, ..
        } = event
        {
            self.log("part", &[("origin", origin), ("channel", channel)]);
        }

        Ok(())
    }

    async fn handle_topic(&self, _bot: &Arc<Bot>, event: &Event) -> HandlerResult {
        if let Event::Topic {
            origin,
            channel,
            topic,
            ..
        } = event
        {
            self.log(
                "topic",
                &[("origin", origin), ("channel", channel), ("topic", topic)],
            );
        }

        Ok(())
    }
}

/// Announces the title of web pages linked in channel messages. The fetch
/// runs through the bot's guarded HTTP capability, so an unload while a
/// page is still downloading drops the reply instead of reviving the
/// plugin.
pub struct LinksPlugin {
    options: RwLock<HashMap<String, String>>,
    templates: RwLock<HashMap<String, String>>,
}

impl LinksPlugin {
    pub fn new() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert("info".to_string(), "link: #{title}".to_string());

        Self {
            options: RwLock::new(HashMap::new()),
            templates: RwLock::new(defaults),
        }
    }
}

/// First http(s) token of a message, if any.
fn find_url(message: &str) -> Option<&str> {
    message
        .split_whitespace()
        .find(|word| word.starts_with("http://") || word.starts_with("https://"))
}

/// ASCII-case-insensitive substring search. Safe to slice at the returned
/// offset: the needles used here are pure ASCII, so a match can only start
/// on a character boundary.
fn find_ascii_ci(haystack: &str, from: usize, needle: &str) -> Option<usize> {
    let hay = &haystack.as_bytes()[from..];
    let needle = needle.as_bytes();

    hay.windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|pos| pos + from)
}

/// Extracts the `<title>` text of an HTML document, whitespace collapsed.
fn parse_title(body: &str) -> Option<String> {
    let start = find_ascii_ci(body, 0, "<title")?;
    let open = body[start..].find('>').map(|idx| start + idx + 1)?;
    let close = find_ascii_ci(body, open, "</title")?;

    let title = body[open..close]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    (!title.is_empty()).then_some(title)
}

#[async_trait]
impl Plugin for LinksPlugin {
    fn name(&self) -> &str {
        "links"
    }

    fn author(&self) -> &str {
        "irccd developers"
    }

    fn license(&self) -> &str {
        "ISC"
    }

    fn summary(&self) -> &str {
        "announce titles of links posted in channels"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn options(&self) -> HashMap<String, String> {
        self.options.read().unwrap().clone()
    }

    fn set_options(&self, options: HashMap<String, String>) {
        *self.options.write().unwrap() = options;
    }

    fn templates(&self) -> HashMap<String, String> {
        self.templates.read().unwrap().clone()
    }

    fn set_templates(&self, templates: HashMap<String, String>) {
        self.templates.write().unwrap().extend(templates);
    }

    async fn handle_message(&self, bot: &Arc<Bot>, event: &Event) -> HandlerResult {
        let Event::Message {
            server,
            origin,
            channel,
            message,
        } = event
        else {
            return Ok(());
        };
        let Some(url) = find_url(message) else {
            return Ok(());
        };

        let template = match self.templates.read().unwrap().get("info") {
            Some(template) => template.clone(),
            None => return Ok(()),
        };

        let server = server.clone();
        let origin = origin.clone();
        let channel = channel.clone();

        bot.http_fetch(self.name(), HttpRequest::get(url), move |response| {
            if !response.ok {
                return;
            }
            let Some(title) = parse_title(&response.body) else {
                return;
            };

            let mut keywords = HashMap::new();
            keywords.insert("title".to_string(), title);
            keywords.insert("origin".to_string(), origin);
            keywords.insert("channel".to_string(), channel.clone());
            keywords.insert("server".to_string(), server.name().to_string());

            match templates::expand(&template, &keywords) {
                Ok(line) => server.message(&channel, &line),
                Err(err) => info!(plugin = "links", error = %err, "bad template"),
            }
        })
        .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loader_claims_registered_ids_only() {
        let loader = BuiltinLoader::with_defaults();

        assert!(loader.open("logger", None).await.unwrap().is_some());
        assert!(loader.open("links", None).await.unwrap().is_some());
        assert!(loader.open("missing", None).await.unwrap().is_none());
        // ids are case-sensitive in the directory
        assert!(loader.open("Logger", None).await.unwrap().is_none());
    }

    #[test]
    fn url_detection() {
        assert_eq!(
            find_url("see https://example.org/page and more"),
            Some("https://example.org/page")
        );
        assert_eq!(find_url("plain http here"), None);
        assert_eq!(
            find_url("http://first.example http://second.example"),
            Some("http://first.example")
        );
    }

    #[test]
    fn title_extraction() {
        assert_eq!(
            parse_title("<html><head><title>Example Domain</title></head></html>"),
            Some("Example Domain".to_string())
        );
        // attribute-laden and oddly cased tags still match
        assert_eq!(
            parse_title("<TITLE lang=\"en\">\n  Spread \n over lines \n</TITLE>"),
            Some("Spread over lines".to_string())
        );
        assert_eq!(parse_title("<html><body>no title</body></html>"), None);
        assert_eq!(parse_title("<title></title>"), None);
        assert_eq!(parse_title("<title>broken"), None);
    }

    #[test]
    fn logger_templates_are_replaceable() {
        let plugin = LoggerPlugin::new();
        assert!(plugin.templates().contains_key("message"));

        let mut custom = HashMap::new();
        custom.insert("message".to_string(), "<#{origin}> #{message}".to_string());
        plugin.set_templates(custom);

        assert_eq!(
            plugin.templates().get("message").unwrap(),
            "<#{origin}> #{message}"
        );
        // untouched keys keep their defaults
        assert!(plugin.templates().contains_key("join"));
    }
}
