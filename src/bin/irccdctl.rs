//! Thin control client for a running irccd.
//!
//! Speaks the framed JSON protocol over the daemon's unix or TCP transport,
//! maps positional CLI arguments onto requests, and prints the response.
//! Exit codes: 0 success, 1 connection/usage failure, 2 unknown command,
//! 3 daemon-reported error.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use irccd::transport::frame::{FrameBuffer, encode};

#[derive(Debug, Parser)]
#[command(name = "irccdctl", version, about = "irccd control client")]
struct Args {
    /// Transport type: unix or ip.
    #[arg(short = 't', long = "type", default_value = "unix")]
    kind: String,

    /// Unix socket path (for -t unix).
    #[arg(short = 'P', long = "path", default_value = "/tmp/irccd.sock")]
    path: PathBuf,

    /// Daemon host (for -t ip).
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Daemon port (for -t ip).
    #[arg(short = 'p', long = "port", default_value_t = 6669)]
    port: u16,

    /// Transport password.
    #[arg(short = 'S', long = "password")]
    password: Option<String>,

    /// Command name followed by its arguments.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

trait CtlStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> CtlStream for T {}

struct Controller {
    stream: Box<dyn CtlStream>,
    frames: FrameBuffer,
}

impl Controller {
    async fn connect(args: &Args) -> std::io::Result<Self> {
        let stream: Box<dyn CtlStream> = match args.kind.as_str() {
            "ip" => Box::new(TcpStream::connect((args.host.as_str(), args.port)).await?),
            _ => Box::new(UnixStream::connect(&args.path).await?),
        };

        Ok(Self {
            stream,
            frames: FrameBuffer::new(),
        })
    }

    async fn send(&mut self, request: &Value) -> std::io::Result<()> {
        self.stream.write_all(&encode(request)).await
    }

    async fn next(&mut self) -> std::io::Result<Map<String, Value>> {
        let mut buf = [0u8; 4096];
        loop {
            match self.frames.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(err) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err));
                }
            }

            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            self.frames.extend(&buf[..n]);
        }
    }

    /// Skips interleaved broadcast events until the response to `command`
    /// arrives.
    async fn response_to(&mut self, command: &str) -> std::io::Result<Map<String, Value>> {
        loop {
            let frame = self.next().await?;
            if frame.get("command").and_then(Value::as_str) == Some(command) {
                return Ok(frame);
            }
        }
    }
}

/// Splits `key=a,b,c` arguments used by the rule commands.
fn kv_lists(args: &[String]) -> Map<String, Value> {
    let mut fields = Map::new();

    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            if key == "action" || key == "index" || key == "from" || key == "to" {
                match value.parse::<u64>() {
                    Ok(number) => fields.insert(key.to_string(), json!(number)),
                    Err(_) => fields.insert(key.to_string(), json!(value)),
                };
            } else {
                let list: Vec<&str> = value.split(',').filter(|v| !v.is_empty()).collect();
                fields.insert(key.to_string(), json!(list));
            }
        }
    }

    fields
}

/// Maps one CLI invocation to its JSON request. `None` means the command
/// name is unknown.
fn build_request(name: &str, args: &[String]) -> Option<Value> {
    let arg = |idx: usize| args.get(idx).cloned().unwrap_or_default();
    let rest = |idx: usize| args[idx.min(args.len())..].join(" ");

    let request = match name {
        "watch" | "server-list" | "rule-list" | "plugin-list" => json!({}),

        "server-connect" => {
            let mut request = json!({
                "name": arg(0),
                "hostname": arg(1),
            });
            if let Some(port) = args.get(2).and_then(|port| port.parse::<i64>().ok()) {
                request["port"] = json!(port);
            }
            request
        }
        "server-disconnect" | "server-reconnect" => match args.first() {
            Some(server) => json!({ "server": server }),
            None => json!({}),
        },
        "server-info" => json!({ "server": arg(0) }),
        "server-message" | "server-me" | "server-notice" => json!({
            "server": arg(0),
            "target": arg(1),
            "message": rest(2),
        }),
        "server-join" => {
            let mut request = json!({ "server": arg(0), "channel": arg(1) });
            if let Some(password) = args.get(2) {
                request["password"] = json!(password);
            }
            request
        }
        "server-part" => json!({
            "server": arg(0),
            "channel": arg(1),
            "reason": rest(2),
        }),
        "server-kick" => json!({
            "server": arg(0),
            "channel": arg(1),
            "target": arg(2),
            "reason": rest(3),
        }),
        "server-invite" => json!({
            "server": arg(0),
            "target": arg(1),
            "channel": arg(2),
        }),
        "server-mode" => {
            let mut request = json!({
                "server": arg(0),
                "channel": arg(1),
                "mode": arg(2),
            });
            for (idx, key) in [(3, "limit"), (4, "user"), (5, "mask")] {
                if let Some(value) = args.get(idx) {
                    request[key] = json!(value);
                }
            }
            request
        }
        "server-nick" => json!({ "server": arg(0), "nickname": arg(1) }),
        "server-topic" => json!({
            "server": arg(0),
            "channel": arg(1),
            "topic": rest(2),
        }),

        "rule-add" | "rule-edit" => Value::Object(kv_lists(args)),
        "rule-info" | "rule-remove" => json!({
            "index": args.first().and_then(|index| index.parse::<u64>().ok()),
        }),
        "rule-move" => json!({
            "from": args.first().and_then(|index| index.parse::<u64>().ok()),
            "to": args.get(1).and_then(|index| index.parse::<u64>().ok()),
        }),

        "plugin-load" => {
            let mut request = json!({ "plugin": arg(0) });
            if let Some(path) = args.get(1) {
                request["path"] = json!(path);
            }
            request
        }
        "plugin-reload" | "plugin-unload" | "plugin-info" => {
            json!({ "plugin": arg(0) })
        }
        "plugin-config" => {
            let mut request = json!({ "plugin": arg(0) });
            if let Some(variable) = args.get(1) {
                request["variable"] = json!(variable);
            }
            if let Some(value) = args.get(2) {
                request["value"] = json!(value);
            }
            request
        }

        _ => return None,
    };

    let mut fields = request.as_object().cloned().unwrap_or_default();
    let wire_name = if name == "watch" { "watch" } else { name };
    fields.insert("command".to_string(), json!(wire_name));
    Some(Value::Object(fields))
}

async fn run(args: Args) -> i32 {
    let name = args.command[0].clone();
    let command_args = &args.command[1..];

    let Some(request) = build_request(&name, command_args) else {
        eprintln!("irccdctl: unknown command '{}'", name);
        return 2;
    };

    let mut controller = match Controller::connect(&args).await {
        Ok(controller) => controller,
        Err(err) => {
            eprintln!("irccdctl: cannot connect: {}", err);
            return 1;
        }
    };

    // greeting comes first on every connection
    let greeting = match controller.next().await {
        Ok(greeting) => greeting,
        Err(err) => {
            eprintln!("irccdctl: {}", err);
            return 1;
        }
    };
    if greeting.get("program").and_then(Value::as_str) != Some("irccd") {
        eprintln!("irccdctl: endpoint is not an irccd daemon");
        return 1;
    }

    if let Some(password) = &args.password {
        let auth = json!({ "command": "auth", "password": password });
        if controller.send(&auth).await.is_err() {
            eprintln!("irccdctl: connection lost during auth");
            return 1;
        }
        match controller.response_to("auth").await {
            Ok(response) if response.get("error").is_none() => {}
            Ok(response) => {
                eprintln!(
                    "irccdctl: authentication failed: {}",
                    Value::Object(response)
                );
                return 3;
            }
            Err(err) => {
                eprintln!("irccdctl: {}", err);
                return 1;
            }
        }
    }

    // watch mode: print the event stream until the daemon goes away
    if name == "watch" {
        loop {
            match controller.next().await {
                Ok(frame) => {
                    if frame.contains_key("event") {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&Value::Object(frame)).unwrap()
                        );
                    }
                }
                Err(_) => return 0,
            }
        }
    }

    if controller.send(&request).await.is_err() {
        eprintln!("irccdctl: connection lost");
        return 1;
    }

    match controller.response_to(&name).await {
        Ok(response) => {
            let failed = response.contains_key("error");
            println!(
                "{}",
                serde_json::to_string_pretty(&Value::Object(response)).unwrap()
            );
            if failed { 3 } else { 0 }
        }
        Err(err) => {
            eprintln!("irccdctl: {}", err);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    exit(run(args).await);
}
