use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{fmt, EnvFilter};

use keyring_store::{ArmoredKeyCodec, KeyCodec, KeyRing, KeyRingStore, LocalKeyRingStore};
use keytransfer_core::{
    ChannelObserver, CloseReason, PairingDescriptor, SessionEvent, SessionManager,
    TransferConfig, TransferDirection,
};

#[derive(Parser, Debug)]
#[command(name = "keytransfer", version, about = "Move an OpenPGP key ring between two devices on the same network")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for config and received key rings
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to <data-dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen for a peer and print the pairing descriptor
    Serve {
        /// Key ring to send once paired; without it, wait to receive one
        #[arg(long)]
        keyring: Option<PathBuf>,

        /// Port to listen on (0 = any free port)
        #[arg(long)]
        port: Option<u16>,

        /// Network interface whose address goes into the descriptor
        #[arg(long)]
        interface: Option<String>,

        /// Wi-Fi network name to advertise
        #[arg(long)]
        ssid: Option<String>,

        /// Also accept peers that typed in host and port instead of scanning
        /// the descriptor; both users then compare a phrase
        #[arg(long)]
        allow_manual: bool,
    },

    /// Connect using a scanned pairing descriptor
    Connect {
        /// Descriptor text, e.g. KEYTRANSFER:192.168.1.5/1336/A1B2...
        #[arg(long)]
        descriptor: String,

        #[arg(long)]
        keyring: Option<PathBuf>,
    },

    /// Connect by host and port, then compare a phrase with the other device
    ConnectManual {
        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,

        #[arg(long)]
        keyring: Option<PathBuf>,
    },

    /// Decode a pairing descriptor and show its contents
    Decode {
        #[arg(long)]
        descriptor: String,
    },

    /// List local network interfaces
    Interfaces {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keytransfer")
    });
    let cfg_path = cli.config.unwrap_or_else(|| data_dir.join("config.json"));

    match cli.cmd {
        Commands::Serve {
            keyring,
            port,
            interface,
            ssid,
            allow_manual,
        } => {
            let mut cfg = TransferConfig::load_or_default(&cfg_path)?;
            if let Some(port) = port {
                cfg.listen_port = port;
            }
            if ssid.is_some() {
                cfg.wifi_ssid = ssid;
            }
            if interface.is_some() {
                cfg.advertised_interface = interface;
            }
            if allow_manual {
                cfg.allow_manual_pairing = true;
            }
            let payload = keyring.as_deref().map(read_key_ring).transpose()?;

            let (manager, events) = new_manager(cfg);
            manager.start_server().await?;
            run_session(manager, events, payload, &data_dir).await?;
        }

        Commands::Connect { descriptor, keyring } => {
            let cfg = TransferConfig::load_or_default(&cfg_path)?;
            let descriptor: PairingDescriptor = descriptor
                .parse()
                .context("Invalid pairing descriptor")?;
            let payload = keyring.as_deref().map(read_key_ring).transpose()?;

            println!("Connecting to {}:{}...", descriptor.host, descriptor.port);
            let (manager, events) = new_manager(cfg);
            manager.start_client(descriptor).await?;
            run_session(manager, events, payload, &data_dir).await?;
        }

        Commands::ConnectManual {
            host,
            port,
            keyring,
        } => {
            let cfg = TransferConfig::load_or_default(&cfg_path)?;
            let payload = keyring.as_deref().map(read_key_ring).transpose()?;

            println!("Connecting to {}:{}...", host, port);
            let (manager, events) = new_manager(cfg);
            manager.start_client_manual(&host, port).await?;
            run_session(manager, events, payload, &data_dir).await?;
        }

        Commands::Decode { descriptor } => {
            let descriptor = PairingDescriptor::decode(&descriptor)?;

            println!("Pairing descriptor:");
            println!("  Host: {}", descriptor.host);
            println!("  Port: {}", descriptor.port);
            println!("  Key: {} bytes", descriptor.preshared_key.as_bytes().len());
            if let Some(ssid) = &descriptor.wifi_ssid {
                println!("  Wi-Fi: {}", ssid);
            }
            println!("  Check phrase: {}", descriptor.comparison_phrase());
        }

        Commands::Interfaces { json } => {
            let ips = lan::list_interface_ips_result()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ips)?);
            } else {
                println!("Found {} address(es):", ips.len());
                for item in &ips {
                    let lo = if item.is_loopback { " (loopback)" } else { "" };
                    println!("  {:<12} {:<5} {}{}", item.name, item.family, item.ip, lo);
                }
                if let Some(ip) = lan::select_advertised_ip(&ips, None) {
                    println!("Default advertised address: {}", ip);
                }
            }
        }
    }

    Ok(())
}

fn new_manager(cfg: TransferConfig) -> (SessionManager, UnboundedReceiver<SessionEvent>) {
    let (observer, events) = ChannelObserver::new();
    (SessionManager::new(cfg, Arc::new(observer)), events)
}

fn read_key_ring(path: &Path) -> Result<KeyRing> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read key ring {}", path.display()))?;
    let ring = ArmoredKeyCodec
        .deserialize(&data)
        .with_context(|| format!("{} is not an OpenPGP key ring", path.display()))?;
    Ok(ring)
}

/// Drive one session from the event stream until it closes.
async fn run_session(
    manager: SessionManager,
    mut events: UnboundedReceiver<SessionEvent>,
    payload: Option<KeyRing>,
    data_dir: &Path,
) -> Result<()> {
    if let Some(ring) = &payload {
        manager.send(ArmoredKeyCodec.serialize(ring))?;
        println!("Key ring queued ({} bytes, {:?})", ring.len(), ring.kind);
    }

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                println!("\nCancelling...");
                manager.close();
                continue;
            }
        };
        let Some(event) = event else {
            anyhow::bail!("Session ended without a close event");
        };

        match event {
            SessionEvent::DescriptorReady { descriptor, .. } => {
                println!("✓ Waiting for a peer");
                println!("  Scan or type on the other device:");
                println!("  {}", descriptor);
                if manager.config().allow_manual_pairing {
                    println!("  Or connect manually to {}:{}", descriptor.host, descriptor.port);
                }
            }

            SessionEvent::StateChanged { session, state } => {
                tracing::debug!("Session {} is now {:?}", session, state);
            }

            SessionEvent::PeerConnected { peer, .. } => {
                println!("✓ Connected to {}", peer);
            }

            SessionEvent::PhraseReady { phrase, .. } => {
                println!("Check that the other device shows the same phrase:");
                println!("  {}", phrase);
                spawn_phrase_prompt(manager.clone(), std::io::BufReader::new(std::io::stdin()));
            }

            SessionEvent::TransferComplete {
                direction: TransferDirection::Sent,
                payload,
                ..
            } => {
                println!("✓ Key ring sent ({} bytes)", payload.len());
            }

            SessionEvent::TransferComplete {
                direction: TransferDirection::Received,
                payload,
                ..
            } => {
                save_received(&payload, data_dir).await?;
            }

            SessionEvent::Closed { reason, .. } => {
                return match reason {
                    CloseReason::Completed => Ok(()),
                    CloseReason::Cancelled | CloseReason::Replaced => {
                        println!("✗ Transfer cancelled");
                        Ok(())
                    }
                    CloseReason::Failed(why) => {
                        println!("✗ Transfer failed: {:?}", why);
                        anyhow::bail!("Transfer failed: {:?}", why)
                    }
                };
            }
        }
    }
}

async fn save_received(payload: &[u8], data_dir: &Path) -> Result<()> {
    let ring = ArmoredKeyCodec
        .deserialize(payload)
        .context("Peer sent something that is not a key ring")?;
    let store = LocalKeyRingStore::new(data_dir)?;
    let id = store.put(&ring).await?;

    println!("✓ Key ring received ({} bytes, {:?})", ring.len(), ring.kind);
    println!(
        "  Saved to: {}",
        store.path_for(&id, ring.encoding).display()
    );
    Ok(())
}

/// Ask the local user about the phrase on a detached thread. The session may
/// end before anyone answers; a runtime blocking task would then keep the
/// process alive until Enter is pressed.
fn spawn_phrase_prompt<R>(manager: SessionManager, input: R) -> std::thread::JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::spawn(move || {
        let confirmed = matches!(prompt_yes_no(input), Ok(true));
        if let Err(e) = manager.confirm_phrase(confirmed) {
            tracing::debug!("Phrase answer not delivered: {}", e);
        }
    })
}

fn prompt_yes_no<R: BufRead>(mut input: R) -> std::io::Result<bool> {
    print!("Does it match? [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(is_yes(&line))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim(), "y" | "Y" | "yes" | "Yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::{Duration, Instant};

    /// Stdin stand-in that never produces a line.
    struct SilentInput;

    impl Read for SilentInput {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                std::thread::park();
            }
        }
    }

    #[test]
    fn answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes("  Yes\r\n"));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no\n"));
    }

    #[test]
    fn unanswered_prompt_does_not_hold_the_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let manager = runtime.block_on(async { new_manager(TransferConfig::default()).0 });

        let prompt = spawn_phrase_prompt(manager, std::io::BufReader::new(SilentInput));
        let started = Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!prompt.is_finished());
    }

    #[test]
    fn prompt_thread_finishes_once_answered() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let manager = runtime.block_on(async { new_manager(TransferConfig::default()).0 });

        // No session to confirm; the thread still finishes after reading a line.
        let prompt = spawn_phrase_prompt(manager, std::io::Cursor::new(b"y\n".to_vec()));
        prompt.join().unwrap();
    }
}
