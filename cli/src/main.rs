// wifiprov — desktop provisioning tool
//
// Cross-platform (macOS, Linux, Windows) command-line front end for
// wifiprov-core: discover devices, secure a session, hand over Wi-Fi
// credentials. `--simulate` runs everything against in-process devices.

mod ble;
mod config;
mod host;
mod softap;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use wifiprov_core::simulator::SimulatedRadio;
use wifiprov_core::transport::META_SOFTAP_PASSWORD;
use wifiprov_core::{
    AllowAll, ConnectFailure, DeviceDescriptor, DeviceFailureReason, HandshakeFailure,
    ProofOfPossession, ProvisionError, ProvisioningClient, SecurityType, SessionConfig,
    SessionEvent, SessionHandle, TransportKind, WifiCredentials,
};

#[derive(Parser)]
#[command(name = "wifiprov")]
#[command(about = "Wi-Fi provisioning for BLE and SoftAP devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Talk to simulated devices instead of real radios
    #[arg(long, global = true)]
    simulate: bool,

    /// Log more (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List provisionable devices
    Scan {
        /// Name prefix filter (default from config)
        #[arg(short, long)]
        prefix: Option<String>,
        /// ble or softap
        #[arg(short, long)]
        transport: Option<String>,
        /// Seconds to scan
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List Wi-Fi networks the device can see
    Networks {
        #[command(flatten)]
        target: DeviceArgs,
    },
    /// Send Wi-Fi credentials and wait for the device to join
    Provision {
        #[command(flatten)]
        target: DeviceArgs,
        #[arg(long)]
        ssid: String,
        #[arg(long, default_value = "")]
        passphrase: String,
        /// Access point BSSID, aa:bb:cc:dd:ee:ff
        #[arg(long)]
        bssid: Option<String>,
        #[arg(long)]
        channel: Option<u8>,
    },
    /// Exchange data with an application-defined endpoint
    Custom {
        #[command(flatten)]
        target: DeviceArgs,
        #[arg(short, long)]
        endpoint: String,
        /// UTF-8 payload
        #[arg(long, conflicts_with = "hex", required_unless_present = "hex")]
        text: Option<String>,
        /// Hex payload, e.g. "00 7f ff"
        #[arg(long)]
        hex: Option<String>,
    },
    /// Show the device protocol version and capabilities
    Info {
        #[command(flatten)]
        target: DeviceArgs,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct DeviceArgs {
    /// Address (BLE) or host (SoftAP) as listed by `scan`
    #[arg(short, long)]
    device: String,
    /// Proof of possession printed on the device
    #[arg(long, default_value = "")]
    pop: String,
    /// none, secure-v1 or secure-v2 (default from config)
    #[arg(long)]
    security: Option<String>,
    /// ble or softap (default from config)
    #[arg(short, long)]
    transport: Option<String>,
    /// Device access point password (SoftAP)
    #[arg(long)]
    ap_password: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

struct App {
    client: ProvisioningClient,
    config: config::Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        1 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Config { action } => cmd_config(action),
        command => {
            let app = build_app(cli.simulate).await?;
            run(&app, command).await
        }
    }
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Scan {
            prefix,
            transport,
            timeout,
        } => cmd_scan(app, prefix, transport, timeout).await,
        Commands::Networks { target } => cmd_networks(app, &target).await,
        Commands::Provision {
            target,
            ssid,
            passphrase,
            bssid,
            channel,
        } => cmd_provision(app, &target, ssid, passphrase, bssid, channel).await,
        Commands::Custom {
            target,
            endpoint,
            text,
            hex,
        } => cmd_custom(app, &target, &endpoint, text, hex).await,
        Commands::Info { target } => cmd_info(app, &target).await,
        Commands::Config { action } => cmd_config(action),
    }
}

async fn build_app(simulate: bool) -> Result<App> {
    let config = config::Config::load()?;
    let session_config = SessionConfig::default().with_request_timeout(config.request_duration());

    let client = if simulate {
        println!("{}", "Using simulated devices".dimmed());
        let radio = Arc::new(SimulatedRadio::demo());
        ProvisioningClient::new(radio.clone(), radio, Arc::new(AllowAll))
    } else {
        let radio = Arc::new(host::HostRadio::from_config(&config).await?);
        ProvisioningClient::new(radio.clone(), radio, Arc::new(AllowAll))
    };
    let client = client.with_session_config(session_config).map_err(fail)?;

    Ok(App { client, config })
}

// ============================================================================
// ERROR REPORTING
// ============================================================================

/// One actionable message per failure kind
fn explain(err: &ProvisionError) -> String {
    match err {
        ProvisionError::PermissionDenied(kind) => {
            format!("Permission needed: allow {} access for this program", kind)
        }
        ProvisionError::ScanStartFailed(_) => {
            "Could not start discovery; check that the radio is switched on".to_string()
        }
        ProvisionError::ScanAborted(_) => {
            "Discovery was interrupted by the radio; scan again".to_string()
        }
        ProvisionError::ConnectionFailed {
            reason: ConnectFailure::NotFound,
        } => "Device not found; make sure it is powered and in range, then run `wifiprov scan`"
            .to_string(),
        ProvisionError::ConnectionFailed { .. } => "Could not open a link to the device".to_string(),
        ProvisionError::HandshakeFailed(HandshakeFailure::WrongSecret) => {
            "Wrong device password (proof of possession)".to_string()
        }
        ProvisionError::HandshakeFailed(HandshakeFailure::Transport(_)) => {
            "The link dropped during the secure handshake".to_string()
        }
        ProvisionError::HandshakeFailed(HandshakeFailure::Protocol(_)) => {
            "The device does not accept this security scheme; try another --security".to_string()
        }
        ProvisionError::SequenceViolation { .. } => {
            "Secure channel integrity check failed; reconnect to the device".to_string()
        }
        ProvisionError::SessionBusy => "Another request is still running on this device".to_string(),
        ProvisionError::NoActiveDevice | ProvisionError::SessionNotSecured => {
            "No secured session with the device".to_string()
        }
        ProvisionError::InvalidState { operation, state } => {
            format!("Cannot {} while the session is {}", operation, state)
        }
        ProvisionError::VersionQueryFailed(_) => {
            "The device did not report its protocol version".to_string()
        }
        ProvisionError::ScanFailed(_) => "The device could not scan for Wi-Fi networks".to_string(),
        ProvisionError::ConfigApplyFailed(_) => {
            "The device rejected the Wi-Fi configuration".to_string()
        }
        ProvisionError::SessionCreationFailed(_) => {
            "The device could not apply the configuration".to_string()
        }
        ProvisionError::WifiConfigFailed(_) => {
            "The device never confirmed the join; check the credentials and try again".to_string()
        }
        ProvisionError::ProvisioningFailedFromDevice { reason } => match reason {
            DeviceFailureReason::AuthError => "The network rejected the passphrase".to_string(),
            DeviceFailureReason::NetworkNotFound => {
                "The device cannot see that network; move it closer or check the ssid".to_string()
            }
            DeviceFailureReason::IpAssignTimeout => {
                "The network did not give the device an IP address".to_string()
            }
            DeviceFailureReason::Unknown => "The device could not join the network".to_string(),
        },
        ProvisionError::CustomExchangeFailed { .. } => {
            "The custom endpoint exchange failed".to_string()
        }
        ProvisionError::OperationAbortedByDisconnect => {
            "The device disconnected before the operation finished".to_string()
        }
        ProvisionError::InvalidConfig(_) => "Invalid settings; see `wifiprov config list`".to_string(),
    }
}

fn fail(err: ProvisionError) -> anyhow::Error {
    let hint = explain(&err);
    anyhow::Error::new(err).context(hint)
}

// ============================================================================
// DEVICE RESOLUTION
// ============================================================================

fn transport_kind(app: &App, arg: Option<&String>) -> Result<TransportKind> {
    match arg {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid transport: {}", raw)),
        None => app.config.transport_kind(),
    }
}

/// Scan until `target.device` shows up
async fn find_device(app: &App, target: &DeviceArgs) -> Result<DeviceDescriptor> {
    let kind = transport_kind(app, target.transport.as_ref())?;
    let mut scan = app
        .client
        .scan_stream("", kind, app.config.scan_duration())
        .await
        .map_err(fail)?;

    while let Some(item) = scan.next_device().await {
        let descriptor = item.map_err(|e| fail(e.into()))?;
        if descriptor.id.eq_ignore_ascii_case(&target.device) {
            scan.stop();
            return Ok(match &target.ap_password {
                Some(password) => descriptor.with_metadata(META_SOFTAP_PASSWORD, password.clone()),
                None => descriptor,
            });
        }
    }

    Err(fail(ProvisionError::ConnectionFailed {
        reason: ConnectFailure::NotFound,
    }))
}

async fn open_secured(app: &App, target: &DeviceArgs) -> Result<SessionHandle> {
    let descriptor = find_device(app, target).await?;
    let security: SecurityType = match &target.security {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid security scheme: {}", raw))?,
        None => app.config.security_type()?,
    };

    println!(
        "{} Found {} ({})",
        "✓".green(),
        descriptor.display_name.bright_cyan(),
        descriptor.id
    );
    let pop = ProofOfPossession::from(target.pop.as_str());
    let handle = app
        .client
        .connect(&descriptor, pop, security)
        .await
        .map_err(fail)?;
    println!("{} Secured session ({})", "✓".green(), security);
    Ok(handle)
}

// ============================================================================
// COMMANDS
// ============================================================================

async fn cmd_scan(
    app: &App,
    prefix: Option<String>,
    transport: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let kind = transport_kind(app, transport.as_ref())?;
    let prefix = prefix.unwrap_or_else(|| app.config.device_prefix.clone());
    let timeout = timeout
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| app.config.scan_duration());

    println!("{} {} devices...", "Scanning for".bold(), kind);
    let devices = app.client.scan(&prefix, kind, timeout).await.map_err(fail)?;

    if devices.is_empty() {
        println!("{}", "No devices found.".dimmed());
        return Ok(());
    }

    println!("{} ({} found)", "Devices".bold(), devices.len());
    println!();
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        println!("  {} {}", "•".bright_green(), device.display_name.bright_cyan());
        println!("    Address: {}  Signal: {}", device.id, rssi.dimmed());
    }
    Ok(())
}

async fn cmd_networks(app: &App, target: &DeviceArgs) -> Result<()> {
    let handle = open_secured(app, target).await?;
    let result = app.client.scan_wifi_networks(&handle).await;
    app.client.disconnect(&handle).await;
    let networks = result.map_err(fail)?;

    if networks.is_empty() {
        println!("{}", "The device sees no networks.".dimmed());
        return Ok(());
    }

    println!();
    println!("{} ({} visible)", "Wi-Fi networks".bold(), networks.len());
    for network in networks {
        println!(
            "  {:<32} {:>5} dBm  ch {:<3} {}",
            network.ssid.bright_cyan(),
            network.rssi,
            network.channel,
            network.auth.to_string().dimmed()
        );
    }
    Ok(())
}

async fn cmd_provision(
    app: &App,
    target: &DeviceArgs,
    ssid: String,
    passphrase: String,
    bssid: Option<String>,
    channel: Option<u8>,
) -> Result<()> {
    let mut credentials = WifiCredentials::new(ssid, passphrase);
    if let Some(raw) = bssid {
        credentials = credentials.with_bssid(parse_bssid(&raw)?);
    }
    if let Some(channel) = channel {
        credentials = credentials.with_channel(channel);
    }

    let handle = open_secured(app, target).await?;
    let mut events = app.client.subscribe(&handle);
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::Progress { phase, .. } = event {
                println!("  {} {}", "•".bright_green(), phase);
            }
        }
    });

    let result = app.client.provision_with(&handle, credentials).await;
    app.client.disconnect(&handle).await;
    printer.abort();

    let joined = result.map_err(fail)?;
    println!();
    println!("{} Device joined {}", "✓".green(), joined.bright_cyan());
    Ok(())
}

async fn cmd_custom(
    app: &App,
    target: &DeviceArgs,
    endpoint: &str,
    text: Option<String>,
    hex_payload: Option<String>,
) -> Result<()> {
    let payload = match (text, hex_payload) {
        (Some(text), _) => text.into_bytes(),
        (None, Some(raw)) => parse_hex(&raw)?,
        (None, None) => anyhow::bail!("Give --text or --hex"),
    };

    let handle = open_secured(app, target).await?;
    let result = app.client.send_custom_data(&handle, endpoint, &payload).await;
    app.client.disconnect(&handle).await;
    let response = result.map_err(fail)?;

    println!("{} {} bytes from {}", "←".bright_blue(), response.len(), endpoint.bright_cyan());
    println!("  Hex:  {}", hex::encode(&response));
    println!("  Text: {}", String::from_utf8_lossy(&response));
    Ok(())
}

async fn cmd_info(app: &App, target: &DeviceArgs) -> Result<()> {
    let descriptor = find_device(app, target).await?;
    let handle = app.client.open_session(&descriptor).map_err(fail)?;
    let session = handle.session();

    session.connect().await.map_err(fail)?;
    let result = session.read_version_info().await;
    session.disconnect().await;
    let info = result.map_err(fail)?;

    println!("{}", "Device Information".bold());
    println!("  Name:      {}", descriptor.display_name.bright_cyan());
    println!("  Address:   {}", descriptor.id);
    println!("  Protocol:  {}", info.prov.ver);
    match info.prov.sec_ver.and_then(SecurityType::from_version) {
        Some(scheme) => println!("  Security:  {}", scheme.to_string().bright_yellow()),
        None => println!("  Security:  {}", "(not reported)".dimmed()),
    }
    if info.prov.cap.is_empty() {
        println!("  Features:  {}", "(none)".dimmed());
    } else {
        println!("  Features:  {}", info.prov.cap.join(", "));
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

// ============================================================================
// PARSING
// ============================================================================

/// "00 7f ff", "00:7f:ff" and "007fff" all decode to the same bytes
fn parse_hex(raw: &str) -> Result<Vec<u8>> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    hex::decode(&digits).with_context(|| format!("Invalid hex payload: {}", raw))
}

fn parse_bssid(raw: &str) -> Result<[u8; 6]> {
    let bytes = parse_hex(raw)?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("A BSSID is six bytes: {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_hex_separators() {
        assert_eq!(parse_hex("00 7f ff").unwrap(), vec![0x00, 0x7f, 0xff]);
        assert_eq!(parse_hex("00:7F:FF").unwrap(), vec![0x00, 0x7f, 0xff]);
        assert_eq!(parse_hex("007fff").unwrap(), vec![0x00, 0x7f, 0xff]);
        assert!(parse_hex("0g").is_err());
        assert!(parse_hex("abc").is_err());
    }

    #[test]
    fn test_parse_bssid() {
        assert_eq!(
            parse_bssid("24:0a:c4:00:00:01").unwrap(),
            [0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01]
        );
        assert!(parse_bssid("24:0a:c4").is_err());
    }

    #[test]
    fn test_each_failure_has_its_own_message() {
        let errors = vec![
            ProvisionError::PermissionDenied(TransportKind::Ble),
            ProvisionError::ScanStartFailed("off".into()),
            ProvisionError::ScanAborted("reset".into()),
            ProvisionError::ConnectionFailed {
                reason: ConnectFailure::NotFound,
            },
            ProvisionError::ConnectionFailed {
                reason: ConnectFailure::TransportError("io".into()),
            },
            ProvisionError::HandshakeFailed(HandshakeFailure::WrongSecret),
            ProvisionError::HandshakeFailed(HandshakeFailure::Transport("io".into())),
            ProvisionError::HandshakeFailed(HandshakeFailure::Protocol("v".into())),
            ProvisionError::SequenceViolation {
                expected: 2,
                received: 1,
            },
            ProvisionError::SessionBusy,
            ProvisionError::NoActiveDevice,
            ProvisionError::ScanFailed("x".into()),
            ProvisionError::ConfigApplyFailed("x".into()),
            ProvisionError::SessionCreationFailed("x".into()),
            ProvisionError::WifiConfigFailed("x".into()),
            ProvisionError::ProvisioningFailedFromDevice {
                reason: DeviceFailureReason::AuthError,
            },
            ProvisionError::ProvisioningFailedFromDevice {
                reason: DeviceFailureReason::NetworkNotFound,
            },
            ProvisionError::CustomExchangeFailed { cause: "x".into() },
            ProvisionError::OperationAbortedByDisconnect,
        ];

        let messages: HashSet<String> = errors.iter().map(explain).collect();
        assert_eq!(messages.len(), errors.len());
    }

    #[test]
    fn test_wrong_secret_message_is_actionable() {
        let message = explain(&ProvisionError::HandshakeFailed(HandshakeFailure::WrongSecret));
        assert!(message.contains("password"));
    }

    #[tokio::test]
    async fn test_simulated_device_resolves() {
        let radio = Arc::new(SimulatedRadio::demo());
        let app = App {
            client: ProvisioningClient::new(radio.clone(), radio, Arc::new(AllowAll)),
            config: config::Config::default(),
        };
        let target = DeviceArgs {
            device: "aa:bb".to_string(),
            pop: "abcd1234".to_string(),
            security: None,
            transport: None,
            ap_password: None,
        };

        let descriptor = find_device(&app, &target).await.unwrap();
        assert_eq!(descriptor.display_name, "PROV_123");

        let handle = open_secured(&app, &target).await.unwrap();
        let networks = app.client.scan_wifi_networks(&handle).await.unwrap();
        assert_eq!(networks[0].ssid, "Home");
    }
}
