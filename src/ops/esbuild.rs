use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::assets::Transformer;

/// Transpiles and bundles through the esbuild CLI.
pub struct EsbuildTransformer {
    command: String,
}

impl EsbuildTransformer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, args: &[String], stdin: Option<&str>) -> Result<String> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.command))?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .context("Failed to open esbuild stdin")?;
            pipe.write_all(input.as_bytes())
                .await
                .context("Failed to write source to esbuild")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for esbuild")?;
        if !output.status.success() {
            bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
        }
        String::from_utf8(output.stdout).context("esbuild produced invalid UTF-8")
    }
}

/// esbuild loader for a source file's extension.
fn loader_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("ts") => "ts",
        Some("tsx") => "tsx",
        Some("jsx") => "jsx",
        _ => "js",
    }
}

#[async_trait]
impl Transformer for EsbuildTransformer {
    async fn transform(&self, path: &Path, source: &str) -> Result<String> {
        let args = vec![
            format!("--loader={}", loader_for(path)),
            "--format=esm".to_string(),
            format!("--sourcefile={}", path.display()),
        ];
        self.run(&args, Some(source)).await
    }

    async fn bundle(&self, entry: &Path) -> Result<String> {
        let args = vec![
            entry.display().to_string(),
            "--bundle".to_string(),
            "--format=esm".to_string(),
        ];
        self.run(&args, None).await
    }
}
