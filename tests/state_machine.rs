use anyhow::{Result, bail};
use paperdrop_agent::{
    config::TimerConfig,
    link::{LinkConnection, LinkError, UpstreamLink},
    protocol::{OutboundMessage, PrintState},
    services::{
        credential_store::{
            CredentialStore, DeviceIdentity, FileCredentialStore, NetworkCredential,
        },
        network::{NetworkProvisioner, ScannedNetwork},
        peripheral::Peripheral,
        provisioning::{ConnectForm, CredentialSubmitted, ProvisioningService, SubmitError},
        status::{ConnectionPhase, StatusBoard},
    },
    state_machine::{DeviceStateMachine, MachineConfig, OperatingState},
};
use serde_json::{Value, json};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    sync::mpsc,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;

/// Longer than any single pause, shorter than anything a test waits for
const STEP_LIMIT: Duration = Duration::from_secs(3600);

type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct FakeProvisioner {
    events: EventLog,
    join_succeeds: AtomicBool,
}

impl FakeProvisioner {
    fn joins(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("join:"))
            .count()
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl NetworkProvisioner for FakeProvisioner {
    async fn start_access_point(&self) -> Result<()> {
        self.events.lock().unwrap().push("ap:start".to_string());
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        self.events.lock().unwrap().push("ap:stop".to_string());
        Ok(())
    }

    async fn join_network(&self, credential: &NetworkCredential) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("join:{}", credential.ssid));

        if !self.join_succeeds.load(Ordering::SeqCst) {
            bail!("association timed out");
        }
        Ok(())
    }

    async fn has_network_address(&self) -> bool {
        false
    }

    async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Default)]
struct LinkLog {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    inbound: Arc<Mutex<VecDeque<Result<Option<Value>, LinkError>>>>,
    connects: Arc<AtomicUsize>,
    refusals: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl LinkLog {
    fn push_inbound(&self, message: Result<Option<Value>, LinkError>) {
        self.inbound.lock().unwrap().push_back(message);
    }

    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn hellos(&self) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::DeviceHello(_)))
            .count()
    }
}

struct FakeLink {
    log: LinkLog,
}

struct FakeConnection {
    log: LinkLog,
}

impl UpstreamLink for FakeLink {
    type Connection = FakeConnection;

    async fn connect(&self, _identity: &DeviceIdentity) -> Result<FakeConnection, LinkError> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .log
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(LinkError::Connect("connection refused".to_string()));
        }

        Ok(FakeConnection {
            log: self.log.clone(),
        })
    }
}

impl LinkConnection for FakeConnection {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), LinkError> {
        self.log.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Value>, LinkError> {
        let next = self.log.inbound.lock().unwrap().pop_front();
        match next {
            Some(message) => message,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakePeripheral {
    printed: EventLog,
}

impl Peripheral for FakePeripheral {
    async fn print_text(&self, text: &str) -> Result<()> {
        self.printed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn print_message(&self, body: &Value, sender: &str) -> Result<()> {
        self.printed
            .lock()
            .unwrap()
            .push(format!("{}|{sender}", body["body"].as_str().unwrap_or_default()));
        Ok(())
    }

    async fn print_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

type TestMachine = DeviceStateMachine<FileCredentialStore, FakeProvisioner, FakeLink, FakePeripheral>;

struct Harness {
    _dir: TempDir,
    store: Arc<FileCredentialStore>,
    provisioner: Arc<FakeProvisioner>,
    link: LinkLog,
    peripheral: Arc<FakePeripheral>,
    status: StatusBoard,
    submissions: mpsc::Sender<CredentialSubmitted>,
    shutdown: CancellationToken,
    machine: TestMachine,
}

fn timers() -> TimerConfig {
    TimerConfig {
        connect_budget: Duration::from_secs(25),
        fallback_retry: Duration::from_secs(600),
        ap_grace: Duration::from_secs(60),
        submit_grace: Duration::from_secs(15),
        join_retry_delay: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
        error_retry: Duration::from_secs(5),
    }
}

impl Harness {
    fn new(saved: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let store = Arc::new(FileCredentialStore::new(dir.path()));

        if let Some(ssid) = saved {
            store
                .save_network_credential(&NetworkCredential {
                    ssid: ssid.to_string(),
                    passphrase: "password123".to_string(),
                })
                .expect("should save credential");
        }

        let provisioner = Arc::new(FakeProvisioner::default());
        let link = LinkLog::default();
        let peripheral = Arc::new(FakePeripheral::default());
        let status = StatusBoard::new();
        let (submissions, submissions_rx) = mpsc::channel(1);

        let machine = DeviceStateMachine::new(
            MachineConfig {
                timers: timers(),
                reconnect_initial: Duration::from_secs(5),
                reconnect_max: Duration::from_secs(60),
                firmware_version: "1.0.0".to_string(),
                start_online: false,
            },
            store.clone(),
            provisioner.clone(),
            FakeLink { log: link.clone() },
            peripheral.clone(),
            status.clone(),
            submissions_rx,
        );

        Self {
            _dir: dir,
            store,
            provisioner,
            link,
            peripheral,
            status,
            submissions,
            shutdown: CancellationToken::new(),
            machine,
        }
    }

    /// Run one control loop iteration; an iteration parked on an idle link
    /// is abandoned after [`STEP_LIMIT`]
    async fn step(&mut self) {
        if let Ok(result) = timeout(STEP_LIMIT, self.machine.step(&self.shutdown)).await {
            result.expect("step should succeed");
        }
    }

    async fn step_until(&mut self, state: OperatingState) {
        for _ in 0..1000 {
            if self.machine.state() == state {
                return;
            }
            self.step().await;
        }
        panic!("never reached {state}, stuck in {}", self.machine.state());
    }

    fn submit(&self, ssid: &str, password: &str) -> Result<(), SubmitError> {
        ProvisioningService::submit(
            self.store.as_ref(),
            &self.status,
            &self.submissions,
            ConnectForm {
                ssid: ssid.to_string(),
                password: password.to_string(),
            },
        )
    }
}

#[tokio::test(start_paused = true)]
async fn first_boot_opens_portal_and_prints_setup_notice() {
    let mut harness = Harness::new(None);
    assert_eq!(harness.machine.state(), OperatingState::ProvisioningNetwork);

    harness.step().await;

    assert!(harness.machine.access_point_up());
    assert!(harness.status.portal_open());
    assert_eq!(harness.provisioner.events(), vec!["ap:start".to_string()]);
    assert_eq!(
        *harness.peripheral.printed.lock().unwrap(),
        vec!["SETUP MODE ACTIVE\nConnect to 'PaperDrop' WiFi".to_string()]
    );
    assert_eq!(
        harness.status.device_code(),
        harness.machine.identity().map(|i| i.code.as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn short_password_keeps_provisioning() {
    let mut harness = Harness::new(None);
    harness.step().await;

    let result = harness.submit("HomeNet", "short");
    assert!(
        matches!(result, Err(SubmitError::Invalid(ref reason)) if reason == "Password too short (min 8 chars)")
    );

    harness.step().await;
    harness.step().await;

    assert_eq!(harness.machine.state(), OperatingState::ProvisioningNetwork);
    assert!(!harness.store.has_network_credential().unwrap());
    assert_eq!(harness.provisioner.joins(), 0);
}

#[tokio::test(start_paused = true)]
async fn submission_joins_network_then_goes_online() {
    let mut harness = Harness::new(None);
    harness.provisioner.join_succeeds.store(true, Ordering::SeqCst);
    harness.step().await;

    harness.submit("HomeNet", "longenough1").expect("should accept");
    assert_eq!(harness.status.snapshot().state, ConnectionPhase::Connecting);

    let submitted_at = Instant::now();
    harness.step().await;
    assert_eq!(harness.machine.state(), OperatingState::ConnectingNetwork);
    assert!(Instant::now() - submitted_at >= Duration::from_secs(15));

    harness.step().await;
    assert_eq!(harness.machine.state(), OperatingState::Online);
    assert_eq!(harness.status.snapshot().state, ConnectionPhase::Connected);
    assert_eq!(harness.status.snapshot().status, "Connected!");
    assert!(!harness.machine.access_point_up());
    assert!(!harness.status.portal_open());
    assert_eq!(
        harness.provisioner.events(),
        vec![
            "ap:start".to_string(),
            "join:HomeNet".to_string(),
            "ap:stop".to_string()
        ]
    );

    harness.step().await;
    assert_eq!(harness.link.connects.load(Ordering::SeqCst), 1);

    let OutboundMessage::DeviceHello(hello) = &harness.link.sent()[0] else {
        panic!("first message must be the hello");
    };
    assert_eq!(
        Some(hello.device_code.as_str()),
        harness.status.device_code()
    );
    assert_eq!(hello.firmware_version, "1.0.0");
    assert!(hello.printer_status.connected);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_falls_back_to_hotspot() {
    let mut harness = Harness::new(Some("HomeNet"));
    assert_eq!(harness.machine.state(), OperatingState::ConnectingNetwork);

    let started = Instant::now();
    while harness.provisioner.joins() < 5 {
        harness.step().await;
        assert_eq!(harness.machine.state(), OperatingState::ConnectingNetwork);
        assert!(harness.machine.attempt().is_some());
    }
    harness.step().await;

    // failures at 0, 5, 10, 15, 20 and 25 seconds
    assert_eq!(harness.machine.state(), OperatingState::FallbackHotspot);
    assert_eq!(harness.provisioner.joins(), 6);
    assert_eq!(harness.link.connects.load(Ordering::SeqCst), 0);
    assert_eq!(Instant::now() - started, Duration::from_secs(25));
    assert_eq!(harness.status.snapshot().state, ConnectionPhase::Failed);
    assert_eq!(
        harness.machine.fallback_retry_at(),
        Some(Instant::now() + Duration::from_secs(600))
    );

    harness.step().await;
    assert!(harness.machine.access_point_up());
    assert!(harness.status.portal_open());
}

#[tokio::test(start_paused = true)]
async fn failed_fallback_retry_rearms_timer_and_reopens_hotspot() {
    let mut harness = Harness::new(Some("HomeNet"));
    harness.step_until(OperatingState::FallbackHotspot).await;
    let armed_at = Instant::now();
    let joins = harness.provisioner.joins();

    while harness.provisioner.joins() == joins {
        harness.step().await;
    }

    assert_eq!(Instant::now() - armed_at, Duration::from_secs(600));
    assert_eq!(harness.machine.state(), OperatingState::FallbackHotspot);
    assert_eq!(
        harness.machine.fallback_retry_at(),
        Some(Instant::now() + Duration::from_secs(600))
    );
    assert!(!harness.machine.access_point_up());

    harness.step().await;
    assert!(harness.machine.access_point_up());
    assert_eq!(
        harness.provisioner.events()[joins..],
        [
            "ap:start".to_string(),
            "ap:stop".to_string(),
            "join:HomeNet".to_string(),
            "ap:start".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn successful_fallback_retry_goes_online() {
    let mut harness = Harness::new(Some("HomeNet"));
    harness.step_until(OperatingState::FallbackHotspot).await;
    harness.provisioner.join_succeeds.store(true, Ordering::SeqCst);

    harness.step_until(OperatingState::Online).await;

    assert!(!harness.machine.access_point_up());
    assert_eq!(harness.machine.fallback_retry_at(), None);
    assert_eq!(harness.status.snapshot().state, ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn submission_preempts_fallback() {
    let mut harness = Harness::new(Some("HomeNet"));
    harness.step_until(OperatingState::FallbackHotspot).await;
    harness.step().await;
    assert!(harness.status.portal_open());

    harness
        .submit("OfficeNet", "password456")
        .expect("should accept while hotspot is up");
    harness.provisioner.join_succeeds.store(true, Ordering::SeqCst);

    harness.step().await;
    assert_eq!(harness.machine.state(), OperatingState::ConnectingNetwork);
    assert_eq!(harness.machine.attempt(), None);
    assert_eq!(harness.machine.fallback_retry_at(), None);

    harness.step().await;
    assert_eq!(harness.machine.state(), OperatingState::Online);
    assert_eq!(
        harness.provisioner.events().last().map(String::as_str),
        Some("ap:stop")
    );
    assert!(
        harness
            .provisioner
            .events()
            .contains(&"join:OfficeNet".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn lost_link_reconnects_with_backoff() {
    let mut harness = Harness::new(Some("HomeNet"));
    harness.provisioner.join_succeeds.store(true, Ordering::SeqCst);
    harness.link.push_inbound(Ok(None));

    harness.step_until(OperatingState::Online).await;
    harness.step().await;
    assert_eq!(harness.machine.state(), OperatingState::OfflineRetrying);
    assert_eq!(harness.link.connects.load(Ordering::SeqCst), 1);

    harness.link.refusals.store(1, Ordering::SeqCst);

    let lost_at = Instant::now();
    harness.step().await;
    // first retry after 5s is refused
    assert_eq!(harness.machine.state(), OperatingState::OfflineRetrying);
    assert_eq!(Instant::now() - lost_at, Duration::from_secs(5));

    harness.step().await;
    assert_eq!(harness.machine.state(), OperatingState::Online);
    assert_eq!(Instant::now() - lost_at, Duration::from_millis(12_500));
    assert_eq!(harness.link.connects.load(Ordering::SeqCst), 3);
    assert_eq!(harness.link.hellos(), 2);
}

#[tokio::test(start_paused = true)]
async fn online_jobs_are_dispatched_in_order() {
    let mut harness = Harness::new(Some("HomeNet"));
    harness.provisioner.join_succeeds.store(true, Ordering::SeqCst);
    harness.link.push_inbound(Ok(Some(json!({"type": "ping"}))));
    harness.link.push_inbound(Ok(Some(json!({
        "type": "new_message",
        "message": {"id": "m1", "contentType": "text", "content": "hello", "sender_name": "Ann"}
    }))));

    harness.step_until(OperatingState::Online).await;
    harness.step().await;
    harness.step().await;

    let sent = harness.link.sent();
    assert!(matches!(sent[0], OutboundMessage::DeviceHello(_)));
    assert_eq!(sent[1], OutboundMessage::Pong);

    let statuses: Vec<PrintState> = sent[2..]
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::PrintStatus(status) if status.message_id == "m1" => {
                Some(status.status)
            }
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![PrintState::Printing, PrintState::Printed]);
    assert_eq!(
        *harness.peripheral.printed.lock().unwrap(),
        vec!["hello|Ann".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_access_point() {
    let harness = Harness::new(None);
    let provisioner = harness.provisioner.clone();
    let shutdown = harness.shutdown.clone();

    let task = tokio::spawn(harness.machine.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_secs(10)).await;
    shutdown.cancel();
    task.await.expect("state machine should stop cleanly");

    assert_eq!(
        provisioner.events(),
        vec!["ap:start".to_string(), "ap:stop".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_idle_link() {
    let harness = Harness::new(Some("HomeNet"));
    harness.provisioner.join_succeeds.store(true, Ordering::SeqCst);
    let link = harness.link.clone();
    let peripheral = harness.peripheral.clone();
    let shutdown = harness.shutdown.clone();

    let task = tokio::spawn(harness.machine.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_secs(60)).await;

    // parked on receive with the link open
    assert_eq!(link.connects.load(Ordering::SeqCst), 1);
    assert_eq!(link.hellos(), 1);
    assert_eq!(link.closed.load(Ordering::SeqCst), 0);

    shutdown.cancel();
    timeout(Duration::from_secs(1), task)
        .await
        .expect("shutdown should not wait on the link")
        .expect("state machine should stop cleanly");

    assert_eq!(link.closed.load(Ordering::SeqCst), 1);
    assert!(peripheral.printed.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn job_arriving_during_shutdown_is_not_dispatched() {
    let mut harness = Harness::new(Some("HomeNet"));
    harness.provisioner.join_succeeds.store(true, Ordering::SeqCst);
    harness.step_until(OperatingState::Online).await;

    harness.link.push_inbound(Ok(Some(json!({
        "type": "new_message",
        "message": {"id": "late", "contentType": "text", "content": "too late"}
    }))));
    harness.shutdown.cancel();
    harness.step().await;

    assert!(harness.peripheral.printed.lock().unwrap().is_empty());
    assert!(
        !harness
            .link
            .sent()
            .iter()
            .any(|m| matches!(m, OutboundMessage::PrintStatus(_)))
    );
}
