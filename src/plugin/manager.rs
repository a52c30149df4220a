//! Loaded-plugin directory and event dispatch.
//!
//! The manager stores plugins in insertion order so dispatch is
//! reproducible, and isolates every handler failure to a log line against
//! the plugin id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bot::Bot;
use crate::error::PluginError;
use crate::plugin::{Plugin, PluginLoader};
use crate::server::event::Event;

pub type PluginResult<T> = core::result::Result<T, PluginError>;

/// One loaded plugin. The token guards async work the plugin started:
/// unloading cancels it, so late completions cannot touch a dead plugin.
#[derive(Clone)]
pub struct PluginEntry {
    pub id: String,
    pub plugin: Arc<dyn Plugin>,
    pub token: CancellationToken,
}

impl std::fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEntry")
            .field("id", &self.id)
            .field("token", &self.token)
            .finish()
    }
}

#[derive(Default)]
pub struct PluginManager {
    loaders: Vec<Box<dyn PluginLoader>>,
    plugins: Vec<PluginEntry>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_loader(&mut self, loader: Box<dyn PluginLoader>) {
        self.loaders.push(loader);
    }

    /// Walks the loaders in order; the first one recognizing `(id, path)`
    /// produces the instance.
    pub async fn open(
        &self,
        id: &str,
        path: Option<&Path>,
    ) -> PluginResult<Arc<dyn Plugin>> {
        for loader in &self.loaders {
            if let Some(plugin) = loader.open(id, path).await? {
                return Ok(plugin);
            }
        }

        Err(PluginError::NotFound)
    }

    /// Plugin ids compare case-sensitively in the directory.
    pub fn get(&self, id: &str) -> Option<&PluginEntry> {
        self.plugins.iter().find(|entry| entry.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn list(&self) -> &[PluginEntry] {
        &self.plugins
    }

    /// Snapshot for dispatch, so no directory lock is held while handlers
    /// run (a handler may re-enter the directory).
    pub fn snapshot(&self) -> Vec<PluginEntry> {
        self.plugins.clone()
    }

    pub fn insert(&mut self, id: &str, plugin: Arc<dyn Plugin>) -> PluginResult<()> {
        if self.contains(id) {
            return Err(PluginError::AlreadyExists);
        }

        self.plugins.push(PluginEntry {
            id: id.to_string(),
            plugin,
            token: CancellationToken::new(),
        });
        Ok(())
    }

    /// Removes and returns the entry with its token already cancelled.
    pub fn remove(&mut self, id: &str) -> PluginResult<PluginEntry> {
        let index = self
            .plugins
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(PluginError::NotFound)?;

        let entry = self.plugins.remove(index);
        entry.token.cancel();
        Ok(entry)
    }
}

/// Checks whether `message` addresses the plugin `id` on a server using
/// `prefix` as its command character: `<prefix><id>` followed by
/// end-of-string or whitespace. The id comparison is case-insensitive, like
/// every other IRC-side match. Returns the remaining text, trimmed.
pub fn detect_command<'a>(message: &'a str, prefix: &str, id: &str) -> Option<&'a str> {
    let rest = message.strip_prefix(prefix)?;
    if rest.len() < id.len() || !rest.is_char_boundary(id.len()) {
        return None;
    }

    let (token, rest) = rest.split_at(id.len());
    if !token.eq_ignore_ascii_case(id) {
        return None;
    }
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    Some(rest.trim_start())
}

/// Dispatches one event to one plugin, routing to the matching handler.
/// Failures are logged, never propagated.
pub async fn dispatch_one(bot: &Arc<Bot>, entry: &PluginEntry, event: &Event) {
    let result = match event {
        Event::Connect { .. } => entry.plugin.handle_connect(bot, event).await,
        Event::Disconnect { .. } => entry.plugin.handle_disconnect(bot, event).await,
        Event::Invite { .. } => entry.plugin.handle_invite(bot, event).await,
        Event::Join { .. } => entry.plugin.handle_join(bot, event).await,
        Event::Kick { .. } => entry.plugin.handle_kick(bot, event).await,
        Event::Me { .. } => entry.plugin.handle_me(bot, event).await,
        Event::Message { .. } => entry.plugin.handle_message(bot, event).await,
        Event::Mode { .. } => entry.plugin.handle_mode(bot, event).await,
        Event::Names { .. } => entry.plugin.handle_names(bot, event).await,
        Event::Nick { .. } => entry.plugin.handle_nick(bot, event).await,
        Event::Notice { .. } => entry.plugin.handle_notice(bot, event).await,
        Event::Part { .. } => entry.plugin.handle_part(bot, event).await,
        Event::Topic { .. } => entry.plugin.handle_topic(bot, event).await,
        Event::Whois { .. } => entry.plugin.handle_whois(bot, event).await,
    };

    if let Err(err) = result {
        warn!(plugin = entry.id, event = event.name(), error = %err, "plugin handler failed");
    }
}

/// Same isolation for the derived command event.
pub async fn dispatch_command(bot: &Arc<Bot>, entry: &PluginEntry, event: &Event) {
    if let Err(err) = entry.plugin.handle_command(bot, event).await {
        warn!(plugin = entry.id, event = "onCommand", error = %err, "plugin handler failed");
    }
}
