//! micwatch - which processes are using the microphone.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing_subscriber::EnvFilter;

use micwatch_detect::{
    new_session_callback, new_usage_callback, DetectConfig, Detector, RenderProcessInfo,
};

#[derive(Parser, Debug)]
#[command(name = "micwatch", version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show processes currently using a microphone
    Usage {
        /// Print the structured result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print executable paths of microphone users, one per line
    Processes,
    /// Show processes currently producing audio output
    Render {
        #[arg(long)]
        json: bool,
    },
    /// Report microphone usage changes as they happen
    Watch {
        /// Stop after this many seconds (runs until interrupted otherwise)
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Stream per-process session events from capture devices
    Sessions {
        /// Include full path and device name
        #[arg(long)]
        enhanced: bool,
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,micwatch=debug,micwatch_detect=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DetectConfig> {
    match path {
        Some(path) => DetectConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(DetectConfig::default()),
    }
}

fn print_render(processes: &[RenderProcessInfo]) {
    if processes.is_empty() {
        println!("  (no audio output)");
    }
    for p in processes {
        println!("  {} (pid {}) on {}", p.process_name, p.process_id, p.device_name);
    }
}

fn session_state(active: bool) -> &'static str {
    if active {
        "active"
    } else {
        "inactive"
    }
}

/// Drain `rx` until the deadline passes or every sender is gone.
fn pump_until<T>(rx: &Receiver<T>, seconds: Option<u64>, mut handle: impl FnMut(T)) {
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    loop {
        let received = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                rx.recv_timeout(remaining)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(item) => handle(item),
            Err(_) => break,
        }
    }
}

fn run(detector: &Detector, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Usage { json } => {
            let usage = detector.active_microphone_usage();
            if json {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else if usage.success {
                if usage.processes.is_empty() {
                    println!("No process is using a microphone.");
                }
                for process in &usage.processes {
                    println!("{process}");
                }
            }
            if !usage.success {
                bail!("{} (code {})", usage.error_message, usage.error_code);
            }
        }
        Command::Processes => {
            for process in detector.active_microphone_processes()? {
                println!("{process}");
            }
        }
        Command::Render { json } => {
            let render = detector.active_render_processes();
            if json {
                println!("{}", serde_json::to_string_pretty(&render)?);
            } else {
                print_render(&render);
            }
        }
        Command::Watch { seconds } => {
            let (tx, rx) = unbounded();
            let started = detector.start_microphone_usage_monitor(new_usage_callback(
                move |active, render| {
                    let _ = tx.send((active, render));
                },
            ));
            if !started {
                bail!("could not start the microphone usage monitor");
            }

            pump_until(&rx, seconds, |(active, render)| {
                println!("microphone {}", if active { "IN USE" } else { "idle" });
                print_render(&render);
            });
            detector.stop_microphone_usage_monitor();
        }
        Command::Sessions {
            enhanced: true,
            seconds,
        } => {
            let (tx, rx) = unbounded();
            let handle = detector
                .start_enhanced_session_monitor(new_session_callback(move |info| {
                    let _ = tx.send(info);
                }))
                .context("starting session monitor")?;
            tracing::info!(%handle, "watching capture sessions");

            pump_until(&rx, seconds, |info| {
                println!(
                    "{} (pid {}) {} on {} [{}]",
                    info.process_name,
                    info.process_id,
                    session_state(info.is_active),
                    info.device_name,
                    info.full_path
                );
            });
            detector.stop_session_monitor(handle);
        }
        Command::Sessions {
            enhanced: false,
            seconds,
        } => {
            let (tx, rx) = unbounded();
            let handle = detector
                .start_session_monitor(move |name, active| {
                    let _ = tx.send((name.to_string(), active));
                })
                .context("starting session monitor")?;
            tracing::info!(%handle, "watching capture sessions");

            pump_until(&rx, seconds, |(name, active)| {
                println!("{name} {}", session_state(active));
            });
            detector.stop_session_monitor(handle);
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_ref())?;
    tracing::debug!(?config, "configuration loaded");

    let detector = Detector::new(&config);
    run(&detector, args.command)
}
