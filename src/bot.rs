//! Composition root.
//!
//! The bot owns every service: the server directory, the rule list, the
//! plugin directory, hooks and transports. Server tasks feed it signals;
//! `handle_event` fans each event out to transport subscribers, plugins
//! (through the rule engine) and hooks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::command::CommandTable;
use crate::error::{PluginError, ServerError, WireResult};
use crate::hook::Hook;
use crate::plugin::builtin::BuiltinLoader;
use crate::plugin::manager::{self, PluginManager};
use crate::plugin::{HttpMethod, HttpRequest, HttpResponse, PluginLoader};
use crate::rule::RuleSet;
use crate::server::connection;
use crate::server::event::Event;
use crate::server::{Server, ServerConfig};
use crate::transport::server::TransportServer;
use crate::transport::{TransportResult, TransportSpec};

/// What server tasks report back to the bot loop.
#[derive(Debug)]
pub enum BotSignal {
    Event(Event),
    /// The named server exhausted its reconnect budget and must leave the
    /// directory.
    Retired(String),
}

/// How long hooks may keep running after shutdown before being reaped.
const HOOK_GRACE: Duration = Duration::from_secs(3);

pub struct Bot {
    /// Self-handle so `&self` methods can hand plugins an owning clone.
    me: Weak<Bot>,
    servers: RwLock<BTreeMap<String, Arc<Server>>>,
    rules: RwLock<RuleSet>,
    plugins: RwLock<PluginManager>,
    hooks: RwLock<Vec<Hook>>,
    commands: CommandTable,
    signals_tx: UnboundedSender<BotSignal>,
    signals_rx: Mutex<Option<UnboundedReceiver<BotSignal>>>,
    events_tx: broadcast::Sender<Value>,
    http: reqwest::Client,
    hook_tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Bot {
    pub fn new() -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(256);

        let mut plugins = PluginManager::new();
        plugins.add_loader(Box::new(BuiltinLoader::with_defaults()));

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            servers: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(RuleSet::new()),
            plugins: RwLock::new(plugins),
            hooks: RwLock::new(Vec::new()),
            commands: CommandTable::with_defaults(),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
            events_tx,
            http: reqwest::Client::new(),
            hook_tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Owning handle to self. The bot only runs behind an `Arc`, so the
    /// upgrade cannot fail while a method is executing.
    fn arc(&self) -> Arc<Bot> {
        self.me.upgrade().expect("bot is always owned by an Arc")
    }

    pub fn rules(&self) -> &RwLock<RuleSet> {
        &self.rules
    }

    pub fn plugins(&self) -> &RwLock<PluginManager> {
        &self.plugins
    }

    // --- server directory ---

    /// Registers and starts a server. The name must be unique for the
    /// lifetime of the daemon process.
    pub async fn add_server(&self, config: ServerConfig) -> WireResult<()> {
        config.validate()?;

        let mut servers = self.servers.write().await;
        if servers.contains_key(&config.name) {
            return Err(ServerError::AlreadyExists.into());
        }

        let name = config.name.clone();
        let (server, cmd_rx) = Server::new(config);
        let server = Arc::new(server);
        servers.insert(name.clone(), server.clone());
        drop(servers);

        info!(server = name, "server registered");
        tokio::spawn(connection::run(
            server,
            cmd_rx,
            self.signals_tx.clone(),
            self.shutdown.child_token(),
        ));

        Ok(())
    }

    /// Server names are case-sensitive identifiers.
    pub async fn find_server(&self, name: &str) -> WireResult<Arc<Server>> {
        self.servers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::NotFound.into())
    }

    pub async fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.read().await.values().cloned().collect()
    }

    /// Disconnects and destroys one server.
    pub async fn disconnect_server(&self, name: &str) -> WireResult<()> {
        let server = self
            .servers
            .write()
            .await
            .remove(name)
            .ok_or(ServerError::NotFound)?;

        server.disconnect(None);
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let mut servers = self.servers.write().await;
        for (_, server) in std::mem::take(&mut *servers) {
            server.disconnect(None);
        }
    }

    async fn retire_server(&self, name: &str) {
        if self.servers.write().await.remove(name).is_some() {
            info!(server = name, "server removed after exhausting reconnects");
        }
    }

    // --- plugin directory ---

    pub async fn add_plugin_loader(&self, loader: Box<dyn PluginLoader>) {
        self.plugins.write().await.add_loader(loader);
    }

    /// Loads a plugin through the loader chain and runs its load handler.
    /// Nothing is stored when the handler fails, so a later load starts
    /// fresh.
    pub async fn load_plugin(&self, id: &str, path: Option<&Path>) -> WireResult<()> {
        {
            let plugins = self.plugins.read().await;
            if plugins.contains(id) {
                return Err(PluginError::AlreadyExists.into());
            }
        }

        let plugin = { self.plugins.read().await.open(id, path).await? };

        plugin
            .handle_load(&self.arc())
            .await
            .map_err(|err| PluginError::ExecError(err.to_string()))?;

        self.plugins.write().await.insert(id, plugin)?;
        info!(plugin = id, "plugin loaded");
        Ok(())
    }

    pub async fn reload_plugin(&self, id: &str) -> WireResult<()> {
        let plugin = {
            let plugins = self.plugins.read().await;
            plugins.get(id).ok_or(PluginError::NotFound)?.plugin.clone()
        };

        plugin
            .handle_reload(&self.arc())
            .await
            .map_err(|err| PluginError::ExecError(err.to_string()))?;
        Ok(())
    }

    /// Unloads a plugin. Its cancellation token fires first so in-flight
    /// async work cannot call back into a plugin that no longer exists.
    pub async fn unload_plugin(&self, id: &str) -> WireResult<()> {
        let entry = self.plugins.write().await.remove(id)?;

        info!(plugin = id, "plugin unloaded");
        entry
            .plugin
            .handle_unload(&self.arc())
            .await
            .map_err(|err| PluginError::ExecError(err.to_string()))?;
        Ok(())
    }

    pub async fn set_plugin_options(
        &self,
        id: &str,
        options: std::collections::HashMap<String, String>,
    ) -> WireResult<()> {
        let plugins = self.plugins.read().await;
        let entry = plugins.get(id).ok_or(PluginError::NotFound)?;
        entry.plugin.set_options(options);
        Ok(())
    }

    pub async fn set_plugin_templates(
        &self,
        id: &str,
        templates: std::collections::HashMap<String, String>,
    ) -> WireResult<()> {
        let plugins = self.plugins.read().await;
        let entry = plugins.get(id).ok_or(PluginError::NotFound)?;
        entry.plugin.set_templates(templates);
        Ok(())
    }

    // --- hooks ---

    pub async fn add_hook(&self, hook: Hook) {
        self.hooks.write().await.push(hook);
    }

    // --- transports ---

    pub async fn add_transport(&self, spec: &TransportSpec) -> TransportResult<()> {
        let server = TransportServer::bind(spec).await?;
        tokio::spawn(server.accept_loop(self.arc(), self.shutdown.child_token()));
        Ok(())
    }

    // --- event stream ---

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events_tx.subscribe()
    }

    pub fn broadcast(&self, event: Value) {
        // no receivers is fine, nobody is watching
        let _ = self.events_tx.send(event);
    }

    pub async fn dispatch_request(&self, request: &Map<String, Value>) -> Value {
        self.commands.dispatch(&self.arc(), request).await
    }

    // --- routing ---

    /// Routes one event: transport broadcast, then plugins filtered by the
    /// rule engine, then hooks.
    pub async fn handle_event(&self, event: Event) {
        debug!(event = event.name(), server = event.server().name(), "dispatching");

        self.broadcast(event.to_json());

        let bot = self.arc();
        let server_name = event.server().name().to_string();
        let entries = { self.plugins.read().await.snapshot() };

        for entry in &entries {
            // channel messages addressed as "<prefix><id>" become
            // onCommand for that plugin only
            if let Event::Message {
                server,
                origin,
                channel,
                message,
            } = &event
            {
                let prefix = &server.config().command_char;
                if let Some(rest) = manager::detect_command(message, prefix, &entry.id) {
                    let accepted = {
                        self.rules.read().await.solve(
                            &server_name,
                            channel,
                            origin,
                            &entry.id,
                            "onCommand",
                        )
                    };

                    if accepted {
                        let command_event = Event::Message {
                            server: server.clone(),
                            origin: origin.clone(),
                            channel: channel.clone(),
                            message: rest.to_string(),
                        };
                        manager::dispatch_command(&bot, entry, &command_event).await;
                    }
                    continue;
                }
            }

            let accepted = {
                self.rules.read().await.solve(
                    &server_name,
                    event.channel(),
                    event.origin(),
                    &entry.id,
                    event.name(),
                )
            };

            if accepted {
                manager::dispatch_one(&bot, entry, &event).await;
            }
        }

        let hooks = { self.hooks.read().await.clone() };
        for hook in hooks {
            let event = event.clone();
            self.hook_tasks.spawn(async move {
                hook.run(&event).await;
            });
        }
    }

    /// The main loop: consumes server signals until shutdown.
    pub async fn run(&self) {
        let mut signals = self
            .signals_rx
            .lock()
            .await
            .take()
            .expect("bot can only run once");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                signal = signals.recv() => match signal {
                    Some(BotSignal::Event(event)) => self.handle_event(event).await,
                    Some(BotSignal::Retired(name)) => self.retire_server(&name).await,
                    None => break,
                },
            }
        }

        self.finish().await;
    }

    /// Cancels everything: servers QUIT, transports close, hooks get a
    /// short grace period and are reaped.
    pub async fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn finish(&self) {
        info!("shutting down");
        self.shutdown.cancel();

        self.hook_tasks.close();
        if tokio::time::timeout(HOOK_GRACE, self.hook_tasks.wait())
            .await
            .is_err()
        {
            warn!("hooks still running after grace period");
        }
    }

    // --- plugin capability helpers ---

    /// Spawns plugin-initiated async work bound to the plugin's lifetime:
    /// unloading the plugin cancels the task.
    pub async fn spawn_guarded<F>(&self, plugin_id: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = {
            let plugins = self.plugins.read().await;
            match plugins.get(plugin_id) {
                Some(entry) => entry.token.clone(),
                None => return,
            }
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });
    }

    /// Plugin HTTP fetch: the completion callback runs on the executor and
    /// is dropped if the owning plugin is unloaded first.
    pub async fn http_fetch<F>(&self, plugin_id: &str, request: HttpRequest, callback: F)
    where
        F: FnOnce(HttpResponse) + Send + 'static,
    {
        let client = self.http.clone();

        self.spawn_guarded(plugin_id, async move {
            let mut builder = match request.method {
                HttpMethod::Get => client.get(&request.url),
                HttpMethod::Post => client.post(&request.url),
            };

            builder = builder.timeout(request.timeout);
            for (key, value) in &request.headers {
                builder = builder.header(key, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let ok = response.status().is_success();
                    let body = response.text().await.unwrap_or_default();
                    HttpResponse { ok, status, body }
                }
                Err(err) => HttpResponse {
                    ok: false,
                    status: 0,
                    body: err.to_string(),
                },
            };

            callback(response);
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{HandlerResult, Plugin};
    use crate::rule::{Rule, RuleAction};
    use crate::server::ServerCommand;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    /// One-shot HTTP server answering any request with `body`.
    async fn mock_http_server(body: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        port
    }

    /// Records which handlers ran, for dispatch assertions.
    struct Recorder {
        calls: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle_message(&self, _bot: &Arc<Bot>, event: &Event) -> HandlerResult {
            if let Event::Message { message, .. } = event {
                self.calls.lock().unwrap().push(format!("message:{}", message));
            }
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }

        async fn handle_command(&self, _bot: &Arc<Bot>, event: &Event) -> HandlerResult {
            if let Event::Message { message, .. } = event {
                self.calls.lock().unwrap().push(format!("command:{}", message));
            }
            Ok(())
        }

        async fn handle_join(&self, _bot: &Arc<Bot>, _event: &Event) -> HandlerResult {
            self.calls.lock().unwrap().push("join".to_string());
            Ok(())
        }
    }

    async fn install_recorder(bot: &Arc<Bot>, id: &str, fail: bool) -> Arc<StdMutex<Vec<String>>> {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let plugin = Arc::new(Recorder {
            calls: calls.clone(),
            fail,
        });
        bot.plugins().write().await.insert(id, plugin).unwrap();
        calls
    }

    async fn test_server(bot: &Arc<Bot>, name: &str) -> Arc<Server> {
        // registered directly so no connection task spins up
        let config = ServerConfig {
            name: name.to_string(),
            hostname: "irc.example.org".to_string(),
            ..ServerConfig::default()
        };
        let (server, _cmd_rx) = Server::new(config);
        let server = Arc::new(server);
        bot.servers
            .write()
            .await
            .insert(name.to_string(), server.clone());
        server
    }

    fn message(server: &Arc<Server>, channel: &str, text: &str) -> Event {
        Event::Message {
            server: server.clone(),
            origin: "alice".to_string(),
            channel: channel.to_string(),
            message: text.to_string(),
        }
    }

    #[tokio::test]
    async fn command_detection_is_per_plugin() {
        let bot = Bot::new();
        let server = test_server(&bot, "local").await;

        let hangman = install_recorder(&bot, "hangman", false).await;
        let other = install_recorder(&bot, "other", false).await;

        bot.handle_event(message(&server, "#HANGMAN", "!hangman start"))
            .await;

        assert_eq!(
            hangman.lock().unwrap().as_slice(),
            ["command:start"],
            "addressed plugin sees onCommand with the token stripped"
        );
        assert_eq!(
            other.lock().unwrap().as_slice(),
            ["message:!hangman start"],
            "other plugins see the original onMessage"
        );
    }

    #[tokio::test]
    async fn rules_filter_dispatch() {
        let bot = Bot::new();
        let server = test_server(&bot, "local").await;
        let calls = install_recorder(&bot, "recorder", false).await;

        bot.rules().write().await.add(
            Rule::new(
                &[] as &[&str],
                &["#blocked"],
                &[],
                &[],
                &["onMessage"],
                RuleAction::Drop,
            )
            .unwrap(),
        );

        bot.handle_event(message(&server, "#blocked", "dropped")).await;
        bot.handle_event(message(&server, "#open", "delivered")).await;

        assert_eq!(calls.lock().unwrap().as_slice(), ["message:delivered"]);
    }

    #[tokio::test]
    async fn plugin_failure_does_not_stop_dispatch() {
        let bot = Bot::new();
        let server = test_server(&bot, "local").await;

        let _failing = install_recorder(&bot, "failing", true).await;
        let healthy = install_recorder(&bot, "healthy", false).await;

        bot.handle_event(message(&server, "#chan", "hello")).await;

        assert_eq!(healthy.lock().unwrap().as_slice(), ["message:hello"]);
    }

    #[tokio::test]
    async fn events_are_broadcast_to_subscribers() {
        let bot = Bot::new();
        let server = test_server(&bot, "local").await;
        let mut events = bot.subscribe();

        bot.handle_event(message(&server, "#chan", "hello")).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event["event"], "onMessage");
        assert_eq!(event["server"], "local");
        assert_eq!(event["message"], "hello");
    }

    #[tokio::test]
    async fn unload_then_load_is_a_fresh_start() {
        let bot = Bot::new();

        bot.load_plugin("logger", None).await.unwrap();
        bot.set_plugin_options(
            "logger",
            [("residue".to_string(), "yes".to_string())].into(),
        )
        .await
        .unwrap();

        bot.unload_plugin("logger").await.unwrap();
        bot.load_plugin("logger", None).await.unwrap();

        let plugins = bot.plugins().read().await;
        let options = plugins.get("logger").unwrap().plugin.options();
        assert!(options.is_empty(), "no residual state after unload+load");
    }

    #[tokio::test]
    async fn guarded_spawn_dies_with_its_plugin() {
        let bot = Bot::new();
        bot.load_plugin("logger", None).await.unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        bot.spawn_guarded("logger", async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        bot.unload_plugin("logger").await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(ran.load(Ordering::SeqCst), 0, "callback after unload is dropped");
    }

    #[tokio::test]
    async fn http_fetch_delivers_the_response() {
        let port = mock_http_server("hello").await;

        let bot = Bot::new();
        bot.load_plugin("logger", None).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        bot.http_fetch(
            "logger",
            HttpRequest::get(&format!("http://127.0.0.1:{}/", port)),
            move |response| {
                let _ = tx.send(response);
            },
        )
        .await;

        let response = timeout(Duration::from_secs(5), rx)
            .await
            .expect("callback never fired")
            .unwrap();

        assert!(response.ok);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "hello");
    }

    #[tokio::test]
    async fn links_plugin_announces_page_titles() {
        let port =
            mock_http_server("<html><head><title>Example Domain</title></head></html>")
                .await;

        let bot = Bot::new();
        bot.load_plugin("links", None).await.unwrap();

        // register the server by hand so its outbound queue stays readable
        let config = ServerConfig {
            name: "local".to_string(),
            hostname: "irc.example.org".to_string(),
            ..ServerConfig::default()
        };
        let (server, mut cmd_rx) = Server::new(config);
        let server = Arc::new(server);
        bot.servers
            .write()
            .await
            .insert("local".to_string(), server.clone());

        bot.handle_event(Event::Message {
            server: server.clone(),
            origin: "alice".to_string(),
            channel: "#chat".to_string(),
            message: format!("worth a read http://127.0.0.1:{}/", port),
        })
        .await;

        let line = timeout(Duration::from_secs(5), async {
            loop {
                match cmd_rx.recv().await {
                    Some(ServerCommand::Line(line)) => break line,
                    Some(_) => continue,
                    None => panic!("command channel closed"),
                }
            }
        })
        .await
        .expect("no reply reached the outbound queue");

        assert_eq!(line, "PRIVMSG #chat :link: Example Domain");
    }

    #[tokio::test]
    async fn retired_signal_removes_the_server() {
        let bot = Bot::new();
        test_server(&bot, "dying").await;
        assert!(bot.find_server("dying").await.is_ok());

        bot.retire_server("dying").await;
        assert!(bot.find_server("dying").await.is_err());
    }
}
