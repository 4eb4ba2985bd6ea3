//! Receives a netmic stream and plays it into the virtual cable

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netmic::audio::jitter::JitterBuffer;
use netmic::audio::playback::PlaybackDriver;
use netmic::config::Config;
use netmic::feedback::spawn_feedback;
use netmic::network::{bind_receiver_socket, AudioReceiver, UdpLink};
use netmic::session::spawn_receiver_session;

const USAGE: &str = "\
Usage: receiver [options] [bind address]

Listens for a netmic sender and plays the stream into the configured
output device, typically a virtual cable input.

Options:
  --config <path>   Load settings from a TOML file
  --list-devices    Print audio devices and exit
  -h, --help        Show this help";

struct Args {
    bind: Option<String>,
    config: Option<PathBuf>,
    list_devices: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        bind: None,
        config: None,
        list_devices: false,
    };

    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => {
                let path = raw.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--list-devices" => args.list_devices = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option {other}\n{USAGE}"),
            other => {
                if args.bind.is_some() {
                    bail!("multiple bind addresses given\n{USAGE}");
                }
                args.bind = Some(other.to_string());
            }
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    if args.list_devices {
        netmic::audio::device::list_devices()?;
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;
    let bind_addr = args
        .bind
        .unwrap_or_else(|| config.network.bind_addr.clone());

    let frame_len = config.audio.frame_samples() * config.audio.channels as usize;
    let jitter = JitterBuffer::new_shared(&config.jitter, frame_len);

    let socket = Arc::new(bind_receiver_socket(
        &bind_addr,
        config.network.port,
        config.network.socket_buffer_bytes,
    )?);

    let mut playback = PlaybackDriver::new(&config.audio, Arc::clone(&jitter))?;
    playback.start()?;
    let level = playback.level();

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut receiver = AudioReceiver::spawn(
        Arc::clone(&socket),
        Arc::clone(&jitter),
        events_tx,
        config.audio.sample_rate,
        config.audio.channels,
    )?;
    let receiver_stats = receiver.stats();

    let (session, session_task) = spawn_receiver_session(
        UdpLink::new(Arc::clone(&socket)),
        config.session.clone(),
        config.audio.clone(),
        Arc::clone(&jitter),
        Arc::clone(&receiver_stats),
        events_rx,
    );
    let feedback = spawn_feedback(
        session.watch(),
        level,
        Some(Arc::clone(&jitter)),
        Duration::from_secs(1),
    );

    let mut session_watch = session.clone();
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));
    let mut device_lost = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                session.stop();
                break;
            }
            _ = session_watch.wait_until_terminal() => {
                break;
            }
            _ = watchdog.tick() => {
                if playback.has_failed() {
                    error!("Playback device lost");
                    device_lost = true;
                    session.stop();
                    break;
                }
            }
        }
    }

    let result = session_task.await.context("session task panicked")?;
    receiver.stop();
    playback.stop();
    feedback.abort();

    let jitter_stats = jitter.lock().stats();
    let playback_stats = playback.stats();
    info!(
        "Received {} packets, played {} frames, concealed {}, {} malformed, {} resyncs",
        receiver_stats.packets_received(),
        playback_stats.frames_played(),
        jitter_stats.concealed,
        receiver_stats.malformed(),
        jitter_stats.resyncs,
    );

    if device_lost {
        bail!("playback device disconnected");
    }
    result?;
    Ok(())
}
