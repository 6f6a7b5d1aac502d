//! Device connectivity state machine
//!
//! One long-lived task owns the operating state. Every iteration of the
//! control loop first looks for a pending credential submission, then runs
//! one step of the current state. All waiting happens in short sleeps that
//! re-check the shutdown token, so shutdown latency is bounded by the poll
//! interval.
//!
//! ```text
//! ProvisioningNetwork --submit--> ConnectingNetwork --join--> Online
//!                                   |  budget spent              |  ^
//!                                   v                 link lost  v  | reconnected
//!        FallbackHotspot <--retry failed--+        OfflineRetrying--+
//!          |  retry joined --> Online     |
//!          +------------------------------+
//! ```

use crate::{
    config::{AgentConfig, AgentMode, TimerConfig},
    dispatcher::JobDispatcher,
    link::{LinkConnection, LinkError, UpstreamLink, backoff::Backoff},
    protocol::{DeviceHello, OutboundMessage, PrinterStatus},
    services::{
        credential_store::{CredentialStore, DeviceIdentity},
        network::{NetworkProvisioner, discover_local_ip},
        peripheral::Peripheral,
        provisioning::CredentialSubmitted,
        status::{ConnectionPhase, StatusBoard},
    },
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;

const SETUP_NOTICE: &str = "SETUP MODE ACTIVE\nConnect to 'PaperDrop' WiFi";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingState {
    ProvisioningNetwork,
    ConnectingNetwork,
    Online,
    OfflineRetrying,
    FallbackHotspot,
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProvisioningNetwork => write!(f, "provisioning network"),
            Self::ConnectingNetwork => write!(f, "connecting network"),
            Self::Online => write!(f, "online"),
            Self::OfflineRetrying => write!(f, "offline retrying"),
            Self::FallbackHotspot => write!(f, "fallback hotspot"),
        }
    }
}

/// Running attempt to join the saved network
///
/// Starts at the first failed join of a connecting episode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub started_at: Instant,
    pub deadline: Instant,
}

impl ConnectionAttempt {
    fn begin(now: Instant, budget: Duration) -> Self {
        Self {
            started_at: now,
            deadline: now + budget,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// The subset of the agent configuration the state machine needs
#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub timers: TimerConfig,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub firmware_version: String,
    /// Skip provisioning and go straight to [`OperatingState::Online`]
    pub start_online: bool,
}

impl From<&AgentConfig> for MachineConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            timers: config.timers.clone(),
            reconnect_initial: config.cloud.reconnect_initial,
            reconnect_max: config.cloud.reconnect_max,
            firmware_version: config.cloud.firmware_version.clone(),
            start_online: config.mode == AgentMode::Development,
        }
    }
}

pub struct DeviceStateMachine<S, N, L, P>
where
    L: UpstreamLink,
{
    config: MachineConfig,
    store: Arc<S>,
    provisioner: Arc<N>,
    link: L,
    dispatcher: JobDispatcher<P>,
    status: StatusBoard,
    submissions: mpsc::Receiver<CredentialSubmitted>,
    identity: Option<DeviceIdentity>,
    state: OperatingState,
    entry_pending: bool,
    attempt: Option<ConnectionAttempt>,
    fallback_retry_at: Option<Instant>,
    access_point_up: bool,
    connection: Option<L::Connection>,
    backoff: Backoff,
}

impl<S, N, L, P> DeviceStateMachine<S, N, L, P>
where
    S: CredentialStore + Send + Sync,
    N: NetworkProvisioner + Send + Sync,
    L: UpstreamLink + Send + Sync,
    P: Peripheral + Send + Sync,
{
    /// Create the state machine
    ///
    /// The initial state is `ProvisioningNetwork` without a saved network
    /// credential and `ConnectingNetwork` with one.
    ///
    /// # Arguments
    /// * `config` - Timers and identity labels
    /// * `store` - Credential store shared with the portal
    /// * `provisioner` - Network provisioner shared with the portal
    /// * `link` - Upstream link factory
    /// * `peripheral` - Print output
    /// * `status` - Status record shared with the portal
    /// * `submissions` - Credential submitted events from the portal
    pub fn new(
        config: MachineConfig,
        store: Arc<S>,
        provisioner: Arc<N>,
        link: L,
        peripheral: Arc<P>,
        status: StatusBoard,
        submissions: mpsc::Receiver<CredentialSubmitted>,
    ) -> Self {
        let state = if config.start_online {
            OperatingState::Online
        } else {
            match store.has_network_credential() {
                Ok(true) => OperatingState::ConnectingNetwork,
                Ok(false) => OperatingState::ProvisioningNetwork,
                Err(e) => {
                    error!("failed to check for saved network credential: {e:#}");
                    OperatingState::ProvisioningNetwork
                }
            }
        };

        let backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);

        Self {
            config,
            store,
            provisioner,
            link,
            dispatcher: JobDispatcher::new(peripheral),
            status,
            submissions,
            identity: None,
            state,
            entry_pending: true,
            attempt: None,
            fallback_retry_at: None,
            access_point_up: false,
            connection: None,
            backoff,
        }
    }

    pub fn state(&self) -> OperatingState {
        self.state
    }

    pub fn attempt(&self) -> Option<ConnectionAttempt> {
        self.attempt
    }

    pub fn fallback_retry_at(&self) -> Option<Instant> {
        self.fallback_retry_at
    }

    pub fn access_point_up(&self) -> bool {
        self.access_point_up
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Errors abandon the current iteration, which is retried after a short
    /// delay. Only cancellation ends the loop.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("state machine starting in {}", self.state);

        while !shutdown.is_cancelled() {
            if let Err(e) = self.step(&shutdown).await {
                error!("{} iteration failed: {e:#}", self.state);
                self.pause(self.config.timers.error_retry, &shutdown).await;
            }
        }

        self.shutdown().await;
    }

    /// Run one iteration of the control loop
    pub async fn step(&mut self, shutdown: &CancellationToken) -> Result<()> {
        if self.identity.is_none() {
            let identity = self
                .store
                .load_identity()
                .context("failed to load device identity")?;
            self.status.set_device_code(&identity.code);
            self.identity = Some(identity);
        }

        if let Some(submission) = self.take_submission() {
            self.on_credential_submitted(submission, shutdown).await;
            return Ok(());
        }

        match self.state {
            OperatingState::ProvisioningNetwork => self.provisioning_network(shutdown).await,
            OperatingState::ConnectingNetwork => self.connecting_network(shutdown).await,
            OperatingState::Online => self.online(shutdown).await,
            OperatingState::OfflineRetrying => self.offline_retrying(shutdown).await,
            OperatingState::FallbackHotspot => self.fallback_hotspot(shutdown).await,
        }
    }

    fn transition(&mut self, next: OperatingState) {
        info!("{} -> {next}", self.state);

        match next {
            OperatingState::ConnectingNetwork => self.attempt = None,
            OperatingState::FallbackHotspot => {
                self.fallback_retry_at = Some(Instant::now() + self.config.timers.fallback_retry)
            }
            _ => {}
        }

        if next != OperatingState::FallbackHotspot {
            self.fallback_retry_at = None;
        }

        self.state = next;
        self.entry_pending = true;
    }

    /// Latest pending submission; older ones are superseded
    fn take_submission(&mut self) -> Option<CredentialSubmitted> {
        let mut latest = None;
        while let Ok(submission) = self.submissions.try_recv() {
            latest = Some(submission);
        }
        latest
    }

    async fn on_credential_submitted(
        &mut self,
        submission: CredentialSubmitted,
        shutdown: &CancellationToken,
    ) {
        info!(
            "credential submitted for {}, switching networks in {}s",
            submission.ssid,
            self.config.timers.submit_grace.as_secs()
        );

        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }

        self.pause(self.config.timers.submit_grace, shutdown).await;
        self.transition(OperatingState::ConnectingNetwork);
    }

    async fn provisioning_network(&mut self, shutdown: &CancellationToken) -> Result<()> {
        if self.entry_pending {
            self.open_access_point().await?;
            self.entry_pending = false;

            self.status
                .set(ConnectionPhase::Idle, "Waiting for network credentials");
            self.dispatcher.notify(SETUP_NOTICE).await;
        }

        self.pause(self.config.timers.poll_interval, shutdown).await;
        Ok(())
    }

    async fn connecting_network(&mut self, shutdown: &CancellationToken) -> Result<()> {
        if self.entry_pending {
            self.entry_pending = false;

            if self.provisioner.has_network_address().await {
                info!("network address already present, skipping join");
                self.on_network_joined(shutdown).await;
                return Ok(());
            }
        }

        let Some(credential) = self
            .store
            .load_network_credential()
            .context("failed to load network credential")?
        else {
            warn!("no saved network credential");
            self.transition(OperatingState::ProvisioningNetwork);
            return Ok(());
        };

        self.status.set(
            ConnectionPhase::Connecting,
            format!("Connecting to {}...", credential.ssid),
        );

        let error = match self.provisioner.join_network(&credential).await {
            Ok(()) => {
                self.on_network_joined(shutdown).await;
                return Ok(());
            }
            Err(e) => e,
        };

        let now = Instant::now();
        let attempt = *self
            .attempt
            .get_or_insert_with(|| ConnectionAttempt::begin(now, self.config.timers.connect_budget));

        warn!(
            "failed to join {} ({}s into attempt): {error:#}",
            credential.ssid,
            attempt.elapsed(now).as_secs()
        );

        if attempt.expired(now) {
            self.status.set(
                ConnectionPhase::Failed,
                format!("Could not connect to {}", credential.ssid),
            );
            self.transition(OperatingState::FallbackHotspot);
        } else {
            self.pause(self.config.timers.join_retry_delay, shutdown)
                .await;
        }

        Ok(())
    }

    async fn on_network_joined(&mut self, shutdown: &CancellationToken) {
        self.attempt = None;
        self.status.set(ConnectionPhase::Connected, "Connected!");

        if self.access_point_up {
            info!(
                "keeping access point up for {}s",
                self.config.timers.ap_grace.as_secs()
            );
            self.pause(self.config.timers.ap_grace, shutdown).await;
            self.close_access_point().await;
        }

        self.transition(OperatingState::Online);
    }

    async fn online(&mut self, shutdown: &CancellationToken) -> Result<()> {
        if self.connection.is_none() {
            match self.open_link().await {
                Ok(connection) => self.connection = Some(connection),
                Err(e) => {
                    warn!("failed to reach cloud: {e}");
                    self.transition(OperatingState::OfflineRetrying);
                    return Ok(());
                }
            }
        }

        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };

        let received = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            received = connection.receive() => received,
        };

        let failure = match received {
            Ok(Some(_)) if shutdown.is_cancelled() => {
                debug!("shutdown pending, message not dispatched");
                return Ok(());
            }
            Ok(Some(message)) => self.dispatcher.handle(connection, &message).await.err(),
            Ok(None) => Some(LinkError::Closed),
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            warn!("cloud link lost: {e}");
            if let Some(mut connection) = self.connection.take() {
                connection.close().await;
            }
            self.transition(OperatingState::OfflineRetrying);
        }

        Ok(())
    }

    async fn offline_retrying(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let delay = self.backoff.next_delay();
        info!("reconnecting in {:.1}s", delay.as_secs_f64());

        if !self.pause(delay, shutdown).await {
            return Ok(());
        }

        match self.open_link().await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.transition(OperatingState::Online);
            }
            Err(e) => warn!("reconnect failed: {e}"),
        }

        Ok(())
    }

    async fn fallback_hotspot(&mut self, shutdown: &CancellationToken) -> Result<()> {
        if self.entry_pending {
            self.open_access_point().await?;
            self.entry_pending = false;
        }

        let now = Instant::now();
        let retry_at = *self
            .fallback_retry_at
            .get_or_insert(now + self.config.timers.fallback_retry);

        if now < retry_at {
            self.pause(self.config.timers.poll_interval, shutdown).await;
            return Ok(());
        }

        let Some(credential) = self
            .store
            .load_network_credential()
            .context("failed to load network credential")?
        else {
            warn!("saved network credential disappeared");
            self.transition(OperatingState::ProvisioningNetwork);
            return Ok(());
        };

        info!("fallback timer expired, retrying {}", credential.ssid);

        // the radio cannot scan for the saved network while serving the access point
        self.close_access_point().await;

        match self.provisioner.join_network(&credential).await {
            Ok(()) => {
                self.status.set(ConnectionPhase::Connected, "Connected!");
                self.transition(OperatingState::Online);
            }
            Err(e) => {
                warn!("fallback retry of {} failed: {e:#}", credential.ssid);
                self.fallback_retry_at = Some(Instant::now() + self.config.timers.fallback_retry);
                self.entry_pending = true;
            }
        }

        Ok(())
    }

    async fn open_access_point(&mut self) -> Result<()> {
        self.provisioner
            .start_access_point()
            .await
            .context("failed to start access point")?;

        self.access_point_up = true;
        self.status.set_portal_open(true);
        Ok(())
    }

    async fn close_access_point(&mut self) {
        self.status.set_portal_open(false);

        if let Err(e) = self.provisioner.stop_access_point().await {
            warn!("failed to stop access point: {e:#}");
        }

        self.access_point_up = false;
    }

    /// Connect upstream and introduce the device
    async fn open_link(&mut self) -> Result<L::Connection, LinkError> {
        let Some(identity) = self.identity.as_ref() else {
            return Err(LinkError::Connect("device identity not loaded".to_string()));
        };

        let mut connection = self.link.connect(identity).await?;

        let hello = OutboundMessage::DeviceHello(DeviceHello {
            device_code: identity.code.clone(),
            firmware_version: self.config.firmware_version.clone(),
            local_ip: discover_local_ip().await.to_string(),
            printer_status: PrinterStatus {
                connected: self.dispatcher.peripheral_ready().await,
            },
        });

        if let Err(e) = connection.send(&hello).await {
            connection.close().await;
            return Err(e);
        }

        info!("online as {}", identity.code);
        self.backoff.reset();

        Ok(connection)
    }

    /// Sleep for `duration` in poll interval steps
    ///
    /// # Returns
    /// `false` if interrupted by shutdown or a pending credential submission
    async fn pause(&mut self, duration: Duration, shutdown: &CancellationToken) -> bool {
        let deadline = Instant::now() + duration;

        loop {
            if shutdown.is_cancelled() || !self.submissions.is_empty() {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            sleep((deadline - now).min(self.config.timers.poll_interval)).await;
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }

        if self.access_point_up {
            self.close_access_point().await;
        }

        info!("state machine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_expires_at_deadline() {
        let start = Instant::now();
        let attempt = ConnectionAttempt::begin(start, Duration::from_secs(300));

        assert!(!attempt.expired(start + Duration::from_secs(299)));
        assert!(attempt.expired(start + Duration::from_secs(300)));
        assert_eq!(
            attempt.elapsed(start + Duration::from_secs(42)),
            Duration::from_secs(42)
        );
        assert_eq!(attempt.elapsed(start), Duration::ZERO);
    }

    #[test]
    fn development_mode_starts_online() {
        let config = AgentConfig::from_lookup(|key| {
            (key == "PAPERDROP_ENV").then(|| "development".to_string())
        })
        .expect("should load config");

        let machine_config = MachineConfig::from(&config);
        assert!(machine_config.start_online);
        assert_eq!(machine_config.reconnect_initial, Duration::from_secs(5));
    }
}
