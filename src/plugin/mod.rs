//! Plugin capability surface.
//!
//! A plugin is a trait object consuming the bot's services: the server and
//! rule directories, the plugin directory itself, guarded task spawning and
//! HTTP fetch. Loaders turn an id (and optional path) into an instance; the
//! manager owns the loaded set and dispatches events.

pub mod builtin;
pub mod manager;
pub mod templates;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bot::Bot;
use crate::error::PluginError;
use crate::server::event::Event;

/// Outcome of one plugin handler. Errors are values; the dispatcher logs
/// them against the plugin id and carries on.
pub type HandlerResult = core::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A loadable handler bundle. Metadata is static per plugin; `options` and
/// `templates` are user-writable maps re-applied through the setters.
///
/// Every handler has a no-op default so plugins implement only the events
/// they care about.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn author(&self) -> &str {
        ""
    }

    fn license(&self) -> &str {
        ""
    }

    fn summary(&self) -> &str {
        ""
    }

    fn version(&self) -> &str {
        ""
    }

    fn options(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn set_options(&self, _options: HashMap<String, String>) {}

    fn templates(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn set_templates(&self, _templates: HashMap<String, String>) {}

    async fn handle_load(&self, _bot: &Arc<Bot>) -> HandlerResult {
        Ok(())
    }

    async fn handle_reload(&self, _bot: &Arc<Bot>) -> HandlerResult {
        Ok(())
    }

    async fn handle_unload(&self, _bot: &Arc<Bot>) -> HandlerResult {
        Ok(())
    }

    /// The derived command event: `event` is the `Message` with the
    /// `<prefix><id>` token already stripped.
    async fn handle_command(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_connect(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_disconnect(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_invite(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_join(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_kick(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_me(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_message(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_mode(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_names(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_nick(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_notice(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_part(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_topic(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }

    async fn handle_whois(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
        Ok(())
    }
}

/// Strategy producing plugins from ids. Loaders are asked in registration
/// order; `Ok(None)` means "not mine", an error means the loader claimed
/// the id but could not produce an instance.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(
        &self,
        id: &str,
        path: Option<&Path>,
    ) -> Result<Option<Arc<dyn Plugin>>, PluginError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A plugin-initiated HTTP request. Completion is delivered back on the
/// executor; the task is dropped if the owning plugin is unloaded first.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn post(url: &str, body: String) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: Vec::new(),
            body: Some(body),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub ok: bool,
    pub status: u16,
    pub body: String,
}
