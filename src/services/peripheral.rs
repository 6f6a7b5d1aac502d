//! Print output
//!
//! The dispatcher talks to the printer through [`Peripheral`]. Layout and
//! printer protocol belong to the external renderer; the file peripheral only
//! records what would have been printed.

use anyhow::{Context, Result, bail, ensure};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Local;
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::Serialize;
use serde_json::Value;
use std::{io::ErrorKind, path::PathBuf, process::Stdio, time::Duration};
use tokio::{fs, io::AsyncWriteExt, process::Command, time::timeout};
use trait_variant::make;

const TEXT_LOG_FILE: &str = "last_print.txt";
const CUT_MARKER: &str = "\n[--- CUT ---]\n";
const RULE: &str = "----------------";

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait Peripheral {
    /// Print plain text followed by a cut
    async fn print_text(&self, text: &str) -> Result<()>;
    /// Print a user message with its sender line
    async fn print_message(&self, body: &Value, sender: &str) -> Result<()>;
    /// Print a base64 encoded image, optionally prefixed with a data url header
    async fn print_image(&self, image: &str) -> Result<()>;
    async fn is_ready(&self) -> bool;
}

/// Extract the printable body of a text job
pub fn message_body(body: &Value) -> Option<&str> {
    match body {
        Value::String(text) => Some(text),
        Value::Object(map) => map.get("body").and_then(Value::as_str),
        _ => None,
    }
}

/// Strip an optional `data:<mime>;base64,` header
pub fn strip_data_url(image: &str) -> &str {
    image
        .split_once("base64,")
        .map_or(image, |(_, data)| data)
        .trim()
}

/// Decode a base64 image, with or without a data url header
pub fn decode_image(image: &str) -> Result<Vec<u8>> {
    let encoded = strip_data_url(image);

    ensure!(!encoded.is_empty(), "image payload is empty");

    STANDARD
        .decode(encoded)
        .context("failed to decode image payload")
}

/// Peripheral writing print output to files for inspection
#[derive(Clone, Debug)]
pub struct FilePeripheral {
    output_dir: PathBuf,
}

impl FilePeripheral {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    async fn append(&self, text: &str) -> Result<()> {
        fs::create_dir_all(&self.output_dir)
            .await
            .context("failed to create debug print directory")?;

        let path = self.output_dir.join(TEXT_LOG_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(format!("failed to open {}", path.display()))?;

        file.write_all(text.as_bytes())
            .await
            .context(format!("failed to write {}", path.display()))?;
        file.write_all(CUT_MARKER.as_bytes())
            .await
            .context(format!("failed to write {}", path.display()))?;

        file.flush().await.context("failed to flush debug print")
    }
}

impl Peripheral for FilePeripheral {
    async fn print_text(&self, text: &str) -> Result<()> {
        debug!("print_text() called");
        self.append(&format!("{text}\n")).await
    }

    async fn print_message(&self, body: &Value, sender: &str) -> Result<()> {
        debug!("print_message() called");

        let mut text = format!("PaperDrop\n{RULE}\n");
        if let Some(body) = message_body(body) {
            text.push_str(body);
            text.push('\n');
        }
        text.push_str(&format!("\n{RULE}\nSent by {sender}\n"));

        self.append(&text).await
    }

    async fn print_image(&self, image: &str) -> Result<()> {
        debug!("print_image() called");

        let data = decode_image(image)?;

        fs::create_dir_all(&self.output_dir)
            .await
            .context("failed to create debug print directory")?;

        let path = self.output_dir.join(format!(
            "print_{}.png",
            Local::now().format("%Y%m%d-%H%M%S%.3f")
        ));

        fs::write(&path, data)
            .await
            .context(format!("failed to write {}", path.display()))?;

        info!("image written to {}", path.display());
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RenderRequest<'a> {
    Text { text: &'a str },
    Message { body: &'a Value, sender: &'a str },
    Image { data: &'a str },
}

/// Peripheral handing every job to an external renderer process
///
/// The render request is written as one JSON document to the renderer's
/// stdin. A non-zero exit status fails the job.
#[derive(Clone, Debug)]
pub struct CommandPeripheral {
    renderer: PathBuf,
    render_timeout: Duration,
}

impl CommandPeripheral {
    pub fn new(renderer: impl Into<PathBuf>, render_timeout: Duration) -> Self {
        Self {
            renderer: renderer.into(),
            render_timeout,
        }
    }

    async fn render(&self, request: &RenderRequest<'_>) -> Result<()> {
        let input = serde_json::to_vec(request).context("failed to serialize render request")?;

        let mut child = Command::new(&self.renderer)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(format!("failed to spawn {}", self.renderer.display()))?;

        let mut stdin = child.stdin.take().context("failed to open renderer stdin")?;
        match stdin.write_all(&input).await {
            Ok(()) => {}
            // exit status decides the outcome
            Err(e) if e.kind() == ErrorKind::BrokenPipe => debug!("renderer closed stdin early"),
            Err(e) => return Err(e).context("failed to write render request"),
        }
        drop(stdin);

        let output = match timeout(self.render_timeout, child.wait_with_output()).await {
            Ok(output) => output.context("failed to wait for renderer")?,
            Err(_) => bail!(
                "renderer timed out after {}s",
                self.render_timeout.as_secs()
            ),
        };

        ensure!(
            output.status.success(),
            "renderer failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );

        Ok(())
    }
}

impl Peripheral for CommandPeripheral {
    async fn print_text(&self, text: &str) -> Result<()> {
        self.render(&RenderRequest::Text { text }).await
    }

    async fn print_message(&self, body: &Value, sender: &str) -> Result<()> {
        self.render(&RenderRequest::Message { body, sender }).await
    }

    async fn print_image(&self, image: &str) -> Result<()> {
        decode_image(image)?;
        self.render(&RenderRequest::Image {
            data: strip_data_url(image),
        })
        .await
    }

    async fn is_ready(&self) -> bool {
        fs::try_exists(&self.renderer).await.unwrap_or(false)
    }
}

/// Peripheral selected at startup
#[derive(Clone, Debug)]
pub enum OutputDevice {
    File(FilePeripheral),
    Command(CommandPeripheral),
}

impl Peripheral for OutputDevice {
    async fn print_text(&self, text: &str) -> Result<()> {
        match self {
            Self::File(p) => p.print_text(text).await,
            Self::Command(p) => p.print_text(text).await,
        }
    }

    async fn print_message(&self, body: &Value, sender: &str) -> Result<()> {
        match self {
            Self::File(p) => p.print_message(body, sender).await,
            Self::Command(p) => p.print_message(body, sender).await,
        }
    }

    async fn print_image(&self, image: &str) -> Result<()> {
        match self {
            Self::File(p) => p.print_image(image).await,
            Self::Command(p) => p.print_image(image).await,
        }
    }

    async fn is_ready(&self) -> bool {
        match self {
            Self::File(p) => p.is_ready().await,
            Self::Command(p) => p.is_ready().await,
        }
    }
}
