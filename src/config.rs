use anyhow::{Context, Result, ensure};
use std::{env, fmt, path::PathBuf, time::Duration};

/// Agent configuration loaded and validated at startup
///
/// Built once in `main` and handed to the components that need it.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Operating mode selected via `PAPERDROP_ENV`
    pub mode: AgentMode,

    /// Upstream cloud link configuration
    pub cloud: CloudConfig,

    /// Provisioning portal configuration
    pub portal: PortalConfig,

    /// WiFi interface and access point configuration
    pub network: NetworkConfig,

    /// Print output configuration
    pub peripheral: PeripheralConfig,

    /// State machine timers
    pub timers: TimerConfig,

    /// Path configuration
    pub paths: PathConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentMode {
    Production,
    /// Skips all OS network commands and goes straight online
    Development,
    /// Real network handling, but print output goes to debug files
    Integration,
}

#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub ws_url: String,
    pub firmware_version: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

#[derive(Clone, Debug)]
pub struct PortalConfig {
    pub port: u16,
    pub dashboard_url: String,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub interface: String,
    pub ap_script: PathBuf,
    pub wpa_supplicant_conf: PathBuf,
    pub country: String,
    /// Addresses starting with this prefix belong to our own access point
    pub ap_subnet_prefix: String,
    pub join_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct PeripheralConfig {
    /// External renderer command; debug files are written when unset
    pub renderer: Option<PathBuf>,
    pub debug_dir: PathBuf,
    pub render_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerConfig {
    /// Budget for joining the saved network before falling back to the hotspot
    pub connect_budget: Duration,
    /// Interval between saved network retries while in fallback hotspot
    pub fallback_retry: Duration,
    /// How long the access point stays up after a successful join
    pub ap_grace: Duration,
    /// Pause after a credential submission so the portal can render its result page
    pub submit_grace: Duration,
    pub join_retry_delay: Duration,
    pub poll_interval: Duration,
    pub error_retry: Duration,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub config_dir: PathBuf,
}

impl AgentConfig {
    /// Load the configuration from process environment variables
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup
    ///
    /// Missing keys fall back to production defaults; present but malformed
    /// values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = AgentMode::load(&lookup)?;
        let cloud = CloudConfig::load(&lookup)?;
        let portal = PortalConfig::load(&lookup)?;
        let network = NetworkConfig::load(&lookup)?;
        let peripheral = PeripheralConfig::load(&lookup)?;
        let timers = TimerConfig::load(&lookup)?;
        let paths = PathConfig::load(&lookup);

        Ok(Self {
            mode,
            cloud,
            portal,
            network,
            peripheral,
            timers,
            paths,
        })
    }
}

impl AgentMode {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        match lookup("PAPERDROP_ENV").as_deref() {
            None | Some("") | Some("production") => Ok(Self::Production),
            Some("development") => Ok(Self::Development),
            Some("integration") => Ok(Self::Integration),
            Some(other) => anyhow::bail!("failed to parse PAPERDROP_ENV: unknown mode {other:?}"),
        }
    }

    /// Whether print output should go to debug files instead of the renderer
    pub fn uses_debug_output(&self) -> bool {
        matches!(self, Self::Development | Self::Integration)
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Integration => write!(f, "integration"),
        }
    }
}

impl CloudConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let ws_url = lookup("PAPERDROP_WS_URL")
            .unwrap_or_else(|| "wss://paperdrop-backend.onrender.com/api/device/connect".to_string());

        ensure!(
            ws_url.starts_with("ws://") || ws_url.starts_with("wss://"),
            "failed to parse PAPERDROP_WS_URL: expected ws:// or wss:// url"
        );

        let firmware_version =
            lookup("PAPERDROP_FIRMWARE_VERSION").unwrap_or_else(|| "1.0.0".to_string());

        let reconnect_initial = positive_secs(lookup, "RECONNECT_INITIAL_SECS", 5)?;
        let reconnect_max = secs(lookup, "RECONNECT_MAX_SECS", 60)?;

        ensure!(
            reconnect_max >= reconnect_initial,
            "failed to validate reconnect delays: RECONNECT_MAX_SECS is below RECONNECT_INITIAL_SECS"
        );

        Ok(Self {
            ws_url,
            firmware_version,
            connect_timeout: secs(lookup, "LINK_CONNECT_TIMEOUT_SECS", 15)?,
            ping_interval: positive_secs(lookup, "PING_INTERVAL_SECS", 30)?,
            ping_timeout: positive_secs(lookup, "PING_TIMEOUT_SECS", 10)?,
            reconnect_initial,
            reconnect_max,
        })
    }
}

impl PortalConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = lookup("PORTAL_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse::<u16>()
            .context("failed to parse PORTAL_PORT: invalid format")?;

        let dashboard_url = lookup("DASHBOARD_URL")
            .unwrap_or_else(|| "https://paperdrop-frontend.onrender.com/setup".to_string());

        Ok(Self {
            port,
            dashboard_url,
        })
    }
}

impl NetworkConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let interface = lookup("WIFI_INTERFACE").unwrap_or_else(|| "wlan0".to_string());
        let ap_script = lookup("AP_SCRIPT")
            .unwrap_or_else(|| "/opt/paperdrop/enable_apsta.sh".to_string())
            .into();
        let wpa_supplicant_conf = lookup("WPA_SUPPLICANT_CONF")
            .unwrap_or_else(|| "/etc/wpa_supplicant/wpa_supplicant.conf".to_string())
            .into();
        let country = lookup("WIFI_COUNTRY").unwrap_or_else(|| "US".to_string());
        let ap_subnet_prefix = lookup("AP_SUBNET_PREFIX").unwrap_or_else(|| "192.168.4.".to_string());

        Ok(Self {
            interface,
            ap_script,
            wpa_supplicant_conf,
            country,
            ap_subnet_prefix,
            join_timeout: secs(lookup, "JOIN_TIMEOUT_SECS", 30)?,
        })
    }
}

impl PeripheralConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let renderer = lookup("PAPERDROP_RENDERER")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let debug_dir = lookup("DEBUG_PRINT_DIR")
            .unwrap_or_else(|| "./debug_prints".to_string())
            .into();

        Ok(Self {
            renderer,
            debug_dir,
            render_timeout: secs(lookup, "RENDER_TIMEOUT_SECS", 60)?,
        })
    }
}

impl TimerConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let timers = Self {
            connect_budget: secs_or(lookup, "CONNECT_TIMEOUT_SECS", defaults.connect_budget)?,
            fallback_retry: secs_or(lookup, "FALLBACK_RETRY_SECS", defaults.fallback_retry)?,
            ap_grace: secs_or(lookup, "AP_GRACE_SECS", defaults.ap_grace)?,
            submit_grace: secs_or(lookup, "SUBMIT_GRACE_SECS", defaults.submit_grace)?,
            join_retry_delay: secs_or(lookup, "JOIN_RETRY_DELAY_SECS", defaults.join_retry_delay)?,
            poll_interval: secs_or(lookup, "POLL_INTERVAL_SECS", defaults.poll_interval)?,
            error_retry: secs_or(lookup, "ERROR_RETRY_SECS", defaults.error_retry)?,
        };

        ensure!(
            !timers.poll_interval.is_zero(),
            "failed to validate POLL_INTERVAL_SECS: must be greater than zero"
        );

        Ok(timers)
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            connect_budget: Duration::from_secs(5 * 60),
            fallback_retry: Duration::from_secs(10 * 60),
            ap_grace: Duration::from_secs(60),
            submit_grace: Duration::from_secs(15),
            join_retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            error_retry: Duration::from_secs(5),
        }
    }
}

impl PathConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let config_dir = lookup("CONFIG_DIR")
            .unwrap_or_else(|| "/etc/paperdrop".to_string())
            .into();

        Self { config_dir }
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    secs_or(lookup, key, Duration::from_secs(default))
}

fn positive_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration> {
    let duration = secs(lookup, key, default)?;

    ensure!(
        !duration.is_zero(),
        "failed to validate {key}: must be greater than zero"
    );

    Ok(duration)
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .context(format!("failed to parse {key}: invalid format")),
    }
}
