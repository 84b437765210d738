//! Remote command bridge.
//!
//! Commands run inside a VM or container through the remote-shell program:
//!
//! ```text
//! vsh --vm_name=<vm> [--target_container=<container>] --owner_id=<owner> -- <args>...
//! ```
//!
//! The remote shell treats a missing stdin as an error rather than EOF, so
//! every invocation gets a piped stdin that is closed right after spawn.

use crate::context::Context;
use crate::error::{Error, Result};
use async_stream::try_stream;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::Stream;

/// Bytes of stderr kept for the error of a streamed command.
const STDERR_TAIL: usize = 4096;

/// Where a remote command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// VM name.
    pub vm_name: String,
    /// Container name; `None` runs in the VM itself.
    pub container_name: Option<String>,
    /// Owner id of the session.
    pub owner_id: String,
}

impl RemoteTarget {
    /// Target the VM itself.
    pub fn vm(vm_name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            container_name: None,
            owner_id: owner_id.into(),
        }
    }

    /// Target a container inside a VM.
    pub fn container(
        vm_name: impl Into<String>,
        container_name: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            container_name: Some(container_name.into()),
            owner_id: owner_id.into(),
        }
    }

    fn flags(&self) -> Vec<String> {
        let mut flags = vec![format!("--vm_name={}", self.vm_name)];
        if let Some(container) = &self.container_name {
            flags.push(format!("--target_container={}", container));
        }
        flags.push(format!("--owner_id={}", self.owner_id));
        flags
    }
}

/// A command to run through the remote shell.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    program: PathBuf,
    target: RemoteTarget,
    args: Vec<String>,
}

impl RemoteCommand {
    /// Build a remote command. Nothing runs until it is spawned.
    pub fn new<I, S>(program: impl Into<PathBuf>, target: RemoteTarget, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            target,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Target of the command.
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Full remote-shell argument vector.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.target.flags();
        argv.push("--".to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Spawn the command with stdin already closed.
    pub fn spawn(&self) -> Result<Child> {
        let mut child = self
            .to_command()
            .spawn()
            .map_err(|e| Error::command_failed(self.to_string(), format!("spawn: {}", e)))?;
        drop(child.stdin.take());

        tracing::debug!(command = %self, "spawned remote command");
        Ok(child)
    }

    /// Run to completion and collect the raw output, whatever the exit status.
    pub async fn output(&self, ctx: &Context) -> Result<Output> {
        let child = self.spawn()?;
        let what = self.to_string();
        ctx.run(&what, async {
            child
                .wait_with_output()
                .await
                .map_err(|e| Error::command_failed(what.clone(), e.to_string()))
        })
        .await
    }

    /// Run to completion and return stdout. A non-zero exit is an error carrying stderr.
    pub async fn run(&self, ctx: &Context) -> Result<String> {
        let output = self.output(ctx).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                self.to_string(),
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Stream stdout line by line.
    ///
    /// The stream ends with an error if the command exits non-zero.
    pub fn stream_lines(&self, ctx: &Context) -> impl Stream<Item = Result<String>> + Send + 'static {
        let command = self.clone();
        let ctx = ctx.clone();

        try_stream! {
            let what = command.to_string();
            let mut child = command.spawn()?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::command_failed(what.clone(), "stdout not captured"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| Error::command_failed(what.clone(), "stderr not captured"))?;
            let stderr_tail = tokio::spawn(read_tail(stderr, STDERR_TAIL));
            let mut lines = BufReader::new(stdout).lines();

            loop {
                let line = ctx
                    .run(&what, async {
                        lines
                            .next_line()
                            .await
                            .map_err(|e| Error::command_failed(what.clone(), e.to_string()))
                    })
                    .await?;
                match line {
                    Some(line) => yield line,
                    None => break,
                }
            }

            let status = ctx
                .run(&what, async {
                    child
                        .wait()
                        .await
                        .map_err(|e| Error::command_failed(what.clone(), e.to_string()))
                })
                .await?;
            if !status.success() {
                let tail = stderr_tail.await.unwrap_or_default();
                let tail = String::from_utf8_lossy(&tail);
                Err::<(), Error>(Error::command_failed(
                    what.clone(),
                    format!("{}: {}", status, tail.trim()),
                ))?;
            }
        }
    }
}

/// Drain `reader` to EOF, keeping the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut tail = Vec::with_capacity(limit);
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "stopped reading command stderr");
                break;
            }
        }
    }
    tail
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.argv() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::PathBuf;
    use std::sync::OnceLock;

    /// Stand-in remote shell: drops the target flags and runs the command locally.
    pub fn fake_remote_shell() -> PathBuf {
        static SHELL: OnceLock<(tempfile::TempDir, PathBuf)> = OnceLock::new();
        let (_, path) = SHELL.get_or_init(|| {
            use std::os::unix::fs::PermissionsExt;

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("vsh");
            std::fs::write(
                &path,
                "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"--\" ]; then shift; break; fi\n  shift\ndone\nexec \"$@\"\n",
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            (dir, path)
        });
        path.clone()
    }
}
