use crate::{
    job::{InboundJob, JobKind, JobOutcome},
    link::{LinkConnection, LinkError},
    protocol::OutboundMessage,
    services::peripheral::Peripheral,
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::{panic::AssertUnwindSafe, sync::Arc};

const DEFAULT_SENDER: &str = "Unknown";

/// Routes inbound messages to the peripheral and reports outcomes upstream
pub struct JobDispatcher<P> {
    peripheral: Arc<P>,
}

impl<P> JobDispatcher<P>
where
    P: Peripheral + Sync,
{
    pub fn new(peripheral: Arc<P>) -> Self {
        Self { peripheral }
    }

    /// Handle one inbound message to completion
    ///
    /// Peripheral failures become `Failed` outcomes. Only failures to talk to
    /// the link itself are returned.
    ///
    /// # Arguments
    /// * `connection` - Connection the message arrived on, used for replies
    /// * `message` - Decoded message as received
    pub async fn handle<C>(&self, connection: &mut C, message: &Value) -> Result<(), LinkError>
    where
        C: LinkConnection + Send,
    {
        let job = InboundJob::normalize(message);

        match &job.kind {
            JobKind::Ping => connection.send(&OutboundMessage::Pong).await,
            JobKind::Claimed => {
                let owner = job.sender_label.as_deref().unwrap_or_default();
                info!("device claimed by {owner}");
                self.notify(&format!("Obtained by {owner}!\n\nREADY.")).await;
                Ok(())
            }
            JobKind::TestPrint => {
                info!("test print requested");
                self.notify(&format!("Test Print\n{}", Local::now().format("%Y-%m-%d %H:%M:%S")))
                    .await;
                Ok(())
            }
            JobKind::Unknown(kind) if job.job_id.is_none() => {
                warn!("ignoring message of unknown kind {kind:?}");
                Ok(())
            }
            JobKind::Text | JobKind::Image | JobKind::Unknown(_) => {
                self.dispatch(connection, &job).await
            }
        }
    }

    async fn dispatch<C>(&self, connection: &mut C, job: &InboundJob) -> Result<(), LinkError>
    where
        C: LinkConnection + Send,
    {
        info!(
            "processing print job {} ({:?})",
            job.job_id.as_deref().unwrap_or("-"),
            job.kind
        );

        if let Some(job_id) = &job.job_id {
            connection
                .send(&JobOutcome::accepted(job_id).to_message())
                .await?;
        }

        let result = match AssertUnwindSafe(self.render(job)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("peripheral panicked")),
        };

        let Some(job_id) = &job.job_id else {
            if let Err(e) = result {
                error!("print job without id failed: {e:#}");
            }
            return Ok(());
        };

        let outcome = match result {
            Ok(()) => {
                info!("print job {job_id} completed");
                JobOutcome::succeeded(job_id)
            }
            Err(e) => {
                error!("print job {job_id} failed: {e:#}");
                JobOutcome::failed(job_id, format!("{e:#}"))
            }
        };

        connection.send(&outcome.to_message()).await
    }

    async fn render(&self, job: &InboundJob) -> Result<()> {
        match &job.kind {
            JobKind::Text => {
                let sender = job.sender_label.as_deref().unwrap_or(DEFAULT_SENDER);
                self.peripheral.print_message(&job.payload, sender).await
            }
            JobKind::Image => {
                let image = image_data(&job.payload).context("image job carries no image data")?;
                self.peripheral.print_image(image).await
            }
            JobKind::Unknown(kind) => bail!("unsupported content type: {kind}"),
            JobKind::Ping | JobKind::Claimed | JobKind::TestPrint => Ok(()),
        }
    }

    pub async fn peripheral_ready(&self) -> bool {
        self.peripheral.is_ready().await
    }

    /// Print a notice without reporting an outcome
    pub async fn notify(&self, text: &str) {
        match AssertUnwindSafe(self.peripheral.print_text(text))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => debug!("notice printed"),
            Ok(Err(e)) => warn!("failed to print notice: {e:#}"),
            Err(_) => warn!("peripheral panicked while printing notice"),
        }
    }
}

/// Image payload as delivered: a bare string or a record with `image_url`
fn image_data(payload: &Value) -> Option<&str> {
    match payload {
        Value::String(image) => Some(image),
        Value::Object(map) => map.get("image_url").and_then(Value::as_str),
        _ => None,
    }
}
