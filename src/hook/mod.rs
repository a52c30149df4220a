//! Out-of-process event observers.
//!
//! A hook is an external program spawned once per dispatched event with the
//! event encoded as positional arguments. Hooks observe only: their output
//! is routed to the log and their exit status never affects dispatch.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::server::event::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub name: String,
    pub path: PathBuf,
}

impl Hook {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
        }
    }

    /// Spawns the hook for one event and waits for it to finish, forwarding
    /// stdout as info and stderr as warnings. Stdin is closed.
    pub async fn run(&self, event: &Event) {
        let mut args = vec![event.name().to_string()];
        args.extend(event.hook_args());

        let child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!(hook = self.name, path = %self.path.display(), error = %err, "failed to spawn hook");
                return;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let name = self.name.clone();
        let out_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(hook = name, "{}", line);
                }
            }
        });

        let name = self.name.clone();
        let err_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(hook = name, "{}", line);
                }
            }
        });

        let status = child.wait().await;
        let _ = out_task.await;
        let _ = err_task.await;

        match status {
            Ok(status) => {
                debug!(hook = self.name, code = status.code(), "hook finished")
            }
            Err(err) => warn!(hook = self.name, error = %err, "failed to reap hook"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::event::Event;
    use crate::server::{Server, ServerConfig};
    use std::io::Write;
    use std::sync::Arc;

    fn event() -> Event {
        let config = ServerConfig {
            name: "local".to_string(),
            hostname: "irc.example.org".to_string(),
            ..ServerConfig::default()
        };
        let (server, _cmd_rx) = Server::new(config);

        Event::Message {
            server: Arc::new(server),
            origin: "alice".to_string(),
            channel: "#staff".to_string(),
            message: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn hook_receives_event_argv() {
        // the hook writes its argv to a file we can inspect
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("argv.txt");
        let script_path = dir.path().join("hook.sh");

        {
            let mut script = std::fs::File::create(&script_path).unwrap();
            writeln!(script, "#!/bin/sh").unwrap();
            writeln!(script, "echo \"$@\" > {}", out_path.display()).unwrap();
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &script_path,
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }

        let hook = Hook::new("argv", &script_path);
        hook.run(&event()).await;

        let written = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(written.trim(), "onMessage local alice #staff hello");
    }

    #[tokio::test]
    async fn missing_executable_is_not_fatal() {
        let hook = Hook::new("ghost", "/nonexistent/irccd-hook");
        // must return normally, only logging the failure
        hook.run(&event()).await;
    }
}
