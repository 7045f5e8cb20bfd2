//! Sonara audio server daemon
//!
//! Parses the CLI, sets process-wide signal dispositions, and runs the
//! server loop until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sonara_core::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "sonarad", about = "Sonara audio server", version)]
struct Args {
    /// Syslog-style log level mask, 0 (emergencies only) to 7 (debug).
    #[arg(long, default_value_t = 6)]
    syslog_mask: u32,

    /// Directory for the client rendezvous socket.
    #[arg(long, default_value = "/run/sonara")]
    state_dir: PathBuf,

    /// Directory containing per-device configuration (devices.json).
    #[arg(long)]
    device_config_dir: Option<PathBuf>,

    /// JSON DSP pipeline configuration file.
    #[arg(long)]
    dsp_config: Option<PathBuf>,

    /// Comma-separated device profiles to leave disabled (hfp,hsp,a2dp).
    #[arg(long, value_delimiter = ',')]
    disable_profile: Vec<String>,

    /// Suffix appended when resolving use-case configs for internal cards.
    #[arg(long)]
    internal_ucm_suffix: Option<String>,

    /// Run without registering hardware devices (virtual devices only).
    #[arg(long)]
    no_hw: bool,
}

fn level_filter(mask: u32) -> &'static str {
    match mask {
        0..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        _ => "debug",
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_term(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    // Dead clients must surface as EPIPE errors, not kill the process, and
    // helper children reap themselves.
    unsafe {
        sigaction(
            Signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )?;
        sigaction(
            Signal::SIGCHLD,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )?;
        let term = SigAction::new(
            SigHandler::Handler(handle_term),
            SaFlags::empty(),
            SigSet::empty(),
        );
        sigaction(Signal::SIGINT, &term)?;
        sigaction(Signal::SIGTERM, &term)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(args.syslog_mask)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    install_signal_handlers().context("signal setup")?;

    if !args.disable_profile.is_empty() {
        info!(profiles = ?args.disable_profile, "profiles left disabled");
    }
    if let Some(suffix) = &args.internal_ucm_suffix {
        info!(suffix, "internal ucm suffix set");
    }

    let config = ServerConfig {
        state_dir: args.state_dir,
        dsp_config_path: args.dsp_config,
        device_config_dir: args.device_config_dir,
        use_hw_devices: !args.no_hw,
    };

    let mut server = Server::new(config).context("server init")?;
    info!("sonarad started");

    // Bridge the signal flag into the Arc the server loop watches.
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        std::thread::Builder::new()
            .name("sonara-sigwatch".into())
            .spawn(move || loop {
                if !RUNNING.load(Ordering::SeqCst) {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            })?;
    }

    server.run(&running).context("server loop")?;
    info!("sonarad exiting");
    Ok(())
}
