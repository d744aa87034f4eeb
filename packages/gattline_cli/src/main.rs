//! gattline: send a line to a BLE peripheral and/or wait for one back.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, ArgGroup, Parser, ValueEnum};

use gattline::config::GattLayout;
use gattline::AttributeHandle;

#[derive(Parser, Debug)]
#[command(
    name = "gattline",
    version,
    about = "Send a line to a BLE peripheral over GATT and/or wait for a reply",
    after_help = "Example:\n  gattline --mac D1:5E:28:7A:4E:E0 --message \"Hello from CLI on Linux\" --wait"
)]
#[command(group(ArgGroup::new("action").args(["message", "wait"]).required(true).multiple(true)))]
struct Cli {
    /// Target Bluetooth MAC address
    #[arg(long, value_name = "ADDR")]
    mac: String,

    /// Send a message to the device (CRLF is appended)
    #[arg(long)]
    message: Option<String>,

    /// Wait for an incoming line
    #[arg(long)]
    wait: bool,

    /// JSON file with config_handle, write_handle, enable_value and mtu
    #[arg(long, value_name = "FILE")]
    layout: Option<PathBuf>,

    /// Handle of the notification configuration descriptor
    #[arg(long, value_name = "HANDLE", value_parser = parse_handle)]
    config_handle: Option<AttributeHandle>,

    /// Handle that receives the message
    #[arg(long, value_name = "HANDLE", value_parser = parse_handle)]
    write_handle: Option<AttributeHandle>,

    /// Fixed ATT MTU
    #[arg(long)]
    mtu: Option<u16>,

    /// Local adapter address to connect from
    #[arg(long, value_name = "ADDR")]
    adapter: Option<String>,

    /// The peer uses a random LE address
    #[arg(long)]
    random: bool,

    /// Link security level
    #[arg(long, value_enum, default_value_t = Security::Low)]
    security: Security,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Security {
    Low,
    Medium,
    High,
}

/// Accept `0x002e` style hex or plain decimal.
fn parse_handle(s: &str) -> Result<AttributeHandle, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => AttributeHandle::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid handle {:?}: {}", s, e))
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn build_layout(cli: &Cli) -> Result<GattLayout, String> {
    let mut layout = match &cli.layout {
        Some(path) => GattLayout::from_json_file(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?,
        None => GattLayout::default(),
    };
    if let Some(handle) = cli.config_handle {
        layout.config_handle = handle;
    }
    if let Some(handle) = cli.write_handle {
        layout.write_handle = handle;
    }
    if let Some(mtu) = cli.mtu {
        layout.mtu = mtu;
    }
    layout.validate().map_err(|e| e.to_string())?;
    Ok(layout)
}

#[cfg(target_os = "linux")]
fn connector(cli: &Cli) -> Result<gattline::transport::l2cap::L2capConnector, String> {
    use gattline::transport::l2cap::{AddressType, BdAddr, L2capConnector, SecurityLevel};

    let mut connector = L2capConnector::new()
        .with_address_type(if cli.random {
            AddressType::Random
        } else {
            AddressType::Public
        })
        .with_security(match cli.security {
            Security::Low => SecurityLevel::Low,
            Security::Medium => SecurityLevel::Medium,
            Security::High => SecurityLevel::High,
        });
    if let Some(adapter) = &cli.adapter {
        let adapter: BdAddr = adapter.parse().map_err(|e| format!("--adapter: {}", e))?;
        connector = connector.with_adapter(adapter);
    }
    Ok(connector)
}

#[cfg(target_os = "linux")]
async fn run(cli: Cli) -> ExitCode {
    use gattline::transport::stdin::StdinInput;
    use gattline::{ClientSession, SessionRequest};
    use tokio_util::sync::CancellationToken;

    let layout = match build_layout(&cli) {
        Ok(layout) => layout,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };
    let connector = match connector(&cli) {
        Ok(connector) => connector,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let mut session = ClientSession::new(connector)
        .with_layout(layout)
        .with_cancellation(cancel);
    match StdinInput::new() {
        Ok(input) => session = session.with_local_input(Box::new(input)),
        Err(e) => log::debug!("Running without stdin readiness: {}", e),
    }

    let mut request = SessionRequest::new(cli.mac.as_str()).with_wait(cli.wait);
    if let Some(message) = cli.message {
        request = request.with_message(message);
    }

    match session.run(&request).await {
        Ok(outcome) => {
            if let Some(line) = outcome.line {
                let mut stdout = std::io::stdout().lock();
                let printed = stdout
                    .write_all(&line)
                    .and_then(|_| stdout.write_all(b"\r\n"))
                    .and_then(|_| stdout.flush());
                if let Err(e) = printed {
                    eprintln!("Error: failed to write output: {}", e);
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) if e.is_cancelled() => {
            eprintln!("Interrupted");
            ExitCode::from(130)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn run(cli: Cli) -> ExitCode {
    if let Err(e) = build_layout(&cli) {
        eprintln!("Error: {}", e);
        return ExitCode::from(2);
    }
    eprintln!("Error: the L2CAP transport is only available on Linux");
    ExitCode::FAILURE
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli).await
}
