//! File transfer through the remote shell.
//!
//! There is no binary channel into the container. Files are pushed as
//! base64 chunks, each decoded by a shell command appending to the target.

use super::Container;
use crate::command::shell_quote;
use crate::context::Context;
use crate::error::{Error, Result, ResultExt};
use base64::Engine;
use std::path::Path;

impl Container {
    /// Copy a local file into the container, replacing `remote`.
    pub async fn push_file(&self, ctx: &Context, local: &Path, remote: &str) -> Result<()> {
        let chunk_size = self.session.config().chunk_size;
        if chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()))
                .with_context(|| format!("push {} to {}", local.display(), remote));
        }
        let data = tokio::fs::read(local).await?;
        let target = shell_quote(remote);

        if data.is_empty() {
            let script = format!(": > {}", target);
            return self
                .command(["sh", "-c", script.as_str()])
                .run(ctx)
                .await
                .map(|_| ())
                .with_context(|| format!("push {} to {}", local.display(), remote));
        }

        let chunks = data.chunks(chunk_size).count();
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
            let redirect = if i == 0 { ">" } else { ">>" };
            let script = format!("echo '{}' | base64 --decode {} {}", encoded, redirect, target);

            self.command(["sh", "-c", script.as_str()])
                .run(ctx)
                .await
                .with_context(|| {
                    format!("push {} to {}: chunk {}/{}", local.display(), remote, i + 1, chunks)
                })?;
        }

        tracing::debug!(
            local = %local.display(),
            remote,
            bytes = data.len(),
            chunks,
            "pushed file"
        );
        Ok(())
    }

    /// Read a file from the container.
    pub async fn read_file(&self, ctx: &Context, remote: &str) -> Result<Vec<u8>> {
        let cmd = self.command(["cat", remote]);
        let output = cmd.output(ctx).await?;
        if !output.status.success() {
            return Err(Error::command_failed(
                cmd.to_string(),
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
            .with_context(|| format!("read {}", remote));
        }
        Ok(output.stdout)
    }

    /// Whether a regular file exists at `path`.
    pub async fn check_file_exists(&self, ctx: &Context, path: &str) -> Result<bool> {
        let script = format!("[ -f {} ]", shell_quote(path));
        let cmd = self.command(["sh", "-c", script.as_str()]);
        let output = cmd.output(ctx).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::command_failed(
                cmd.to_string(),
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
        }
    }

    /// Remove a file from the container.
    pub async fn remove_file(&self, ctx: &Context, path: &str) -> Result<()> {
        self.command(["rm", "-f", "--", path])
            .run(ctx)
            .await
            .map(|_| ())
            .with_context(|| format!("remove {}", path))
    }
}
