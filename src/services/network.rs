//! WiFi provisioning primitives
//!
//! Wraps the OS commands for the provisioning access point, joining a saved
//! network and scanning. The state machine only sees the
//! [`NetworkProvisioner`] contract.

use crate::{config::NetworkConfig, services::credential_store::NetworkCredential};
use anyhow::{Context, Result, bail, ensure};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::Write,
    net::{IpAddr, Ipv4Addr},
    os::unix::fs::PermissionsExt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    process::Command,
    time::{Instant, sleep},
};
use trait_variant::make;

const MAX_SCAN_RESULTS: usize = 10;
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ROUTE_PROBE_TARGET: &str = "8.8.8.8:80";

/// A network seen by the last scan
#[derive(Clone, Debug, PartialEq)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub signal_dbm: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalStrength {
    Strong,
    Good,
    Weak,
}

impl ScannedNetwork {
    pub fn strength(&self) -> SignalStrength {
        if self.signal_dbm > -60.0 {
            SignalStrength::Strong
        } else if self.signal_dbm > -70.0 {
            SignalStrength::Good
        } else {
            SignalStrength::Weak
        }
    }
}

impl fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strong => write!(f, "Strong"),
            Self::Good => write!(f, "Good"),
            Self::Weak => write!(f, "Weak"),
        }
    }
}

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait NetworkProvisioner {
    /// Bring up the provisioning access point; no-op when already up
    async fn start_access_point(&self) -> Result<()>;
    /// Tear down the provisioning access point; no-op when already down
    async fn stop_access_point(&self) -> Result<()>;
    /// Apply the credential and wait a bounded time for an address
    async fn join_network(&self, credential: &NetworkCredential) -> Result<()>;
    async fn has_network_address(&self) -> bool;
    async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>>;
}

/// Provisioner driving the real interface through `iw`, `ip`, `wpa_cli` and
/// the access point helper script
#[derive(Debug)]
pub struct ShellNetworkProvisioner {
    config: NetworkConfig,
    access_point_up: AtomicBool,
}

impl ShellNetworkProvisioner {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            access_point_up: AtomicBool::new(false),
        }
    }

    async fn run_access_point_script(&self, action: &str) -> Result<()> {
        let mut cmd = Command::new("bash");
        cmd.arg(&self.config.ap_script).arg(action);

        run_command(cmd)
            .await
            .map(|_| ())
            .context(format!("failed to {action} access point"))
    }

    fn write_supplicant_config(&self, credential: &NetworkCredential) -> Result<()> {
        let path = &self.config.wpa_supplicant_conf;
        let content = supplicant_config(&self.config.country, credential)?;
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .context(format!("failed to create {}", temp_path.display()))?;

        let mut perm = file
            .metadata()
            .context("failed to read supplicant config metadata")?
            .permissions();
        perm.set_mode(0o600);
        file.set_permissions(perm)
            .context("failed to set supplicant config permissions")?;

        file.write_all(content.as_bytes())
            .context("failed to write supplicant config")?;
        file.sync_all().context("failed to sync supplicant config")?;

        fs::rename(&temp_path, path).context(format!("failed to replace {}", path.display()))
    }

    async fn interface_address(&self) -> Result<Option<Ipv4Addr>> {
        let mut cmd = Command::new("ip");
        cmd.args(["-4", "addr", "show"]).arg(&self.config.interface);

        let output = run_command(cmd).await?;
        Ok(parse_interface_address(
            &output,
            &self.config.ap_subnet_prefix,
        ))
    }

    fn trigger_background_scan(&self) {
        let mut cmd = Command::new("iw");
        cmd.args(["dev", &self.config.interface, "scan"]);

        tokio::spawn(async move {
            if let Err(e) = run_command(cmd).await {
                warn!("background scan failed: {e:#}");
            }
        });
    }
}

impl NetworkProvisioner for ShellNetworkProvisioner {
    async fn start_access_point(&self) -> Result<()> {
        if self.access_point_up.swap(true, Ordering::AcqRel) {
            debug!("access point already up");
            return Ok(());
        }

        info!("starting access point");

        if let Err(e) = self.run_access_point_script("start").await {
            self.access_point_up.store(false, Ordering::Release);
            return Err(e);
        }

        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        if !self.access_point_up.swap(false, Ordering::AcqRel) {
            debug!("access point already down");
            return Ok(());
        }

        info!("stopping access point");
        self.run_access_point_script("stop").await
    }

    async fn join_network(&self, credential: &NetworkCredential) -> Result<()> {
        info!(
            "joining {} on {}",
            credential.ssid, self.config.interface
        );

        self.write_supplicant_config(credential)?;

        let mut cmd = Command::new("wpa_cli");
        cmd.args(["-i", &self.config.interface, "reconfigure"]);
        run_command(cmd)
            .await
            .context("failed to reconfigure wpa_supplicant")?;

        let deadline = Instant::now() + self.config.join_timeout;

        while Instant::now() < deadline {
            sleep(ADDRESS_POLL_INTERVAL).await;

            match self.interface_address().await {
                Ok(Some(addr)) => {
                    info!("joined {} with address {addr}", credential.ssid);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => debug!("address query failed: {e:#}"),
            }
        }

        bail!(
            "timed out after {}s waiting for an address on {}",
            self.config.join_timeout.as_secs(),
            self.config.interface
        )
    }

    async fn has_network_address(&self) -> bool {
        match self.interface_address().await {
            Ok(addr) => addr.is_some(),
            Err(e) => {
                debug!("address query failed: {e:#}");
                false
            }
        }
    }

    async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>> {
        let mut cmd = Command::new("iw");
        cmd.args(["dev", &self.config.interface, "scan", "dump"]);

        let output = run_command(cmd).await.context("failed to read scan results")?;
        let networks = parse_scan_output(&output);

        if networks.is_empty() {
            debug!("scan cache empty, triggering active scan");
            self.trigger_background_scan();
        }

        Ok(networks)
    }
}

/// Provisioner used in development mode; never touches the OS
#[derive(Debug, Default)]
pub struct SimulatedNetworkProvisioner;

impl NetworkProvisioner for SimulatedNetworkProvisioner {
    async fn start_access_point(&self) -> Result<()> {
        info!("[dev] skipping access point start");
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        info!("[dev] skipping access point stop");
        Ok(())
    }

    async fn join_network(&self, credential: &NetworkCredential) -> Result<()> {
        info!("[dev] pretending to join {}", credential.ssid);
        Ok(())
    }

    async fn has_network_address(&self) -> bool {
        true
    }

    async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>> {
        Ok(vec![
            ScannedNetwork {
                ssid: "Dev_Net_1".to_string(),
                signal_dbm: -45.0,
            },
            ScannedNetwork {
                ssid: "Dev_Net_2".to_string(),
                signal_dbm: -75.0,
            },
        ])
    }
}

/// Provisioner selected at startup from the agent mode
#[derive(Debug)]
pub enum NetworkBackend {
    Shell(ShellNetworkProvisioner),
    Simulated(SimulatedNetworkProvisioner),
}

impl NetworkProvisioner for NetworkBackend {
    async fn start_access_point(&self) -> Result<()> {
        match self {
            Self::Shell(p) => p.start_access_point().await,
            Self::Simulated(p) => p.start_access_point().await,
        }
    }

    async fn stop_access_point(&self) -> Result<()> {
        match self {
            Self::Shell(p) => p.stop_access_point().await,
            Self::Simulated(p) => p.stop_access_point().await,
        }
    }

    async fn join_network(&self, credential: &NetworkCredential) -> Result<()> {
        match self {
            Self::Shell(p) => p.join_network(credential).await,
            Self::Simulated(p) => p.join_network(credential).await,
        }
    }

    async fn has_network_address(&self) -> bool {
        match self {
            Self::Shell(p) => p.has_network_address().await,
            Self::Simulated(p) => p.has_network_address().await,
        }
    }

    async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>> {
        match self {
            Self::Shell(p) => p.scan_networks().await,
            Self::Simulated(p) => p.scan_networks().await,
        }
    }
}

/// Address the device uses to reach the internet
///
/// Connecting a UDP socket sends nothing; it only selects the outbound route.
pub async fn discover_local_ip() -> IpAddr {
    async fn probe() -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(ROUTE_PROBE_TARGET).await?;
        Ok(socket.local_addr()?.ip())
    }

    probe().await.unwrap_or_else(|e| {
        debug!("local address probe failed: {e}");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

async fn run_command(mut cmd: Command) -> Result<String> {
    let description = format!("{:?}", cmd.as_std());
    debug!("running {description}");

    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .context(format!("failed to spawn {description}"))?;

    ensure!(
        output.status.success(),
        "{description} failed with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether a value cannot be written as a quoted wpa_supplicant string
pub fn needs_escaping(value: &str) -> bool {
    value.chars().any(|c| c == '"' || c.is_control())
}

/// Render a single-network wpa_supplicant configuration
///
/// SSIDs with quotes or control characters are written hex encoded. Such
/// characters are rejected in the passphrase.
fn supplicant_config(country: &str, credential: &NetworkCredential) -> Result<String> {
    ensure!(
        !needs_escaping(&credential.passphrase),
        "passphrase contains unsupported characters"
    );

    let ssid = if needs_escaping(&credential.ssid) {
        credential
            .ssid
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    } else {
        format!("\"{}\"", credential.ssid)
    };

    Ok(format!(
        "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\n\
         update_config=1\n\
         country={country}\n\
         \n\
         network={{\n    ssid={ssid}\n    psk=\"{}\"\n}}\n",
        credential.passphrase
    ))
}

/// First IPv4 address in `ip -4 addr show` output outside the access point subnet
pub fn parse_interface_address(output: &str, ap_subnet_prefix: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("inet "))
        .filter_map(|rest| rest.split(['/', ' ']).next())
        .filter(|addr| ap_subnet_prefix.is_empty() || !addr.starts_with(ap_subnet_prefix))
        .find_map(|addr| addr.parse().ok())
}

/// Parse `iw dev <if> scan dump` output
///
/// Hidden networks are skipped, duplicates keep their strongest signal and
/// the result is sorted strongest first.
pub fn parse_scan_output(output: &str) -> Vec<ScannedNetwork> {
    let mut strongest: HashMap<String, f32> = HashMap::new();
    let mut signal = f32::MIN;

    for line in output.lines().map(str::trim) {
        if line.starts_with("BSS ") {
            signal = f32::MIN;
        } else if let Some(rest) = line.strip_prefix("signal:") {
            if let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse().ok()) {
                signal = value;
            }
        } else if let Some(ssid) = line.strip_prefix("SSID:") {
            let ssid = ssid.trim();
            if ssid.is_empty() || ssid.contains("\\x00") {
                continue;
            }
            strongest
                .entry(ssid.to_string())
                .and_modify(|s| *s = s.max(signal))
                .or_insert(signal);
        }
    }

    let mut networks: Vec<ScannedNetwork> = strongest
        .into_iter()
        .map(|(ssid, signal_dbm)| ScannedNetwork { ssid, signal_dbm })
        .collect();

    networks.sort_by(|a, b| b.signal_dbm.total_cmp(&a.signal_dbm).then(a.ssid.cmp(&b.ssid)));
    networks.truncate(MAX_SCAN_RESULTS);
    networks
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN_DUMP: &str = "\
BSS aa:bb:cc:dd:ee:01(on wlan0)
\tfreq: 2412
\tsignal: -72.00 dBm
\tSSID: HomeNet
BSS aa:bb:cc:dd:ee:02(on wlan0)
\tsignal: -48.00 dBm
\tSSID: HomeNet
BSS aa:bb:cc:dd:ee:03(on wlan0)
\tsignal: -65.00 dBm
\tSSID: Cafe
BSS aa:bb:cc:dd:ee:04(on wlan0)
\tsignal: -30.00 dBm
\tSSID:
BSS aa:bb:cc:dd:ee:05(on wlan0)
\tsignal: -80.00 dBm
\tSSID: \\x00\\x00
";

    #[test]
    fn scan_output_is_deduplicated_and_sorted() {
        let networks = parse_scan_output(SCAN_DUMP);

        assert_eq!(
            networks,
            vec![
                ScannedNetwork {
                    ssid: "HomeNet".to_string(),
                    signal_dbm: -48.0
                },
                ScannedNetwork {
                    ssid: "Cafe".to_string(),
                    signal_dbm: -65.0
                },
            ]
        );
        assert_eq!(networks[0].strength(), SignalStrength::Strong);
        assert_eq!(networks[1].strength(), SignalStrength::Good);
    }

    #[test]
    fn scan_output_is_capped() {
        let dump: String = (0..15)
            .map(|i| format!("BSS 00:00:00:00:00:{i:02}\n\tsignal: -{}.00 dBm\n\tSSID: net{i}\n", 40 + i))
            .collect();

        let networks = parse_scan_output(&dump);
        assert_eq!(networks.len(), MAX_SCAN_RESULTS);
        assert_eq!(networks[0].ssid, "net0");
    }

    #[test]
    fn weak_signal_label() {
        let network = ScannedNetwork {
            ssid: "Far".to_string(),
            signal_dbm: -70.0,
        };
        assert_eq!(network.strength().to_string(), "Weak");
    }

    #[test]
    fn interface_address_ignores_access_point_subnet() {
        let ap_only = "\
3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 192.168.4.1/24 brd 192.168.4.255 scope global wlan0
";
        assert_eq!(parse_interface_address(ap_only, "192.168.4."), None);

        let joined = "\
3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 192.168.4.1/24 brd 192.168.4.255 scope global wlan0
    inet 10.0.0.23/24 brd 10.0.0.255 scope global dynamic wlan0
";
        assert_eq!(
            parse_interface_address(joined, "192.168.4."),
            Some(Ipv4Addr::new(10, 0, 0, 23))
        );
        assert_eq!(parse_interface_address("", "192.168.4."), None);
    }

    #[test]
    fn supplicant_config_quotes_plain_ssid() {
        let config = supplicant_config(
            "US",
            &NetworkCredential {
                ssid: "HomeNet".to_string(),
                passphrase: "longenough1".to_string(),
            },
        )
        .expect("should render config");

        assert!(config.contains("country=US\n"));
        assert!(config.contains("ssid=\"HomeNet\""));
        assert!(config.contains("psk=\"longenough1\""));
    }

    #[test]
    fn supplicant_config_hex_encodes_unsafe_ssid() {
        let config = supplicant_config(
            "DE",
            &NetworkCredential {
                ssid: "a\"b".to_string(),
                passphrase: "longenough1".to_string(),
            },
        )
        .expect("should render config");

        assert!(config.contains("ssid=612262\n"));
    }

    #[test]
    fn supplicant_config_rejects_unsafe_passphrase() {
        let result = supplicant_config(
            "US",
            &NetworkCredential {
                ssid: "HomeNet".to_string(),
                passphrase: "bad\"pass\nword".to_string(),
            },
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn simulated_provisioner_always_succeeds() {
        let provisioner = NetworkBackend::Simulated(SimulatedNetworkProvisioner);
        let credential = NetworkCredential {
            ssid: "HomeNet".to_string(),
            passphrase: "longenough1".to_string(),
        };

        assert!(provisioner.start_access_point().await.is_ok());
        assert!(provisioner.join_network(&credential).await.is_ok());
        assert!(provisioner.has_network_address().await);
        assert_eq!(provisioner.scan_networks().await.expect("should scan").len(), 2);
    }
}
