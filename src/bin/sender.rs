//! Streams the microphone to a receiver on the LAN

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use crossbeam_channel::bounded;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netmic::audio::buffer::CaptureQueue;
use netmic::audio::capture::{spawn_tone_capture, AudioCapture};
use netmic::audio::framer::{FrameAssembler, Framer};
use netmic::audio::meter::LevelMeter;
use netmic::config::Config;
use netmic::constants::CAPTURE_QUEUE_BLOCKS;
use netmic::feedback::spawn_feedback;
use netmic::network::{connect_sender_socket, AckListener, AudioSender, UdpLink};
use netmic::session::spawn_sender_session;

const USAGE: &str = "\
Usage: sender [options] <receiver address>

Streams the default microphone to a netmic receiver. The address may be
a bare host or host:port.

Options:
  --config <path>   Load settings from a TOML file
  --tone            Send a 440 Hz test tone instead of the microphone
  --list-devices    Print audio devices and exit
  -h, --help        Show this help";

struct Args {
    target: Option<String>,
    config: Option<PathBuf>,
    tone: bool,
    list_devices: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        target: None,
        config: None,
        tone: false,
        list_devices: false,
    };

    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => {
                let path = raw.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--tone" => args.tone = true,
            "--list-devices" => args.list_devices = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option {other}\n{USAGE}"),
            other => {
                if args.target.is_some() {
                    bail!("multiple receiver addresses given\n{USAGE}");
                }
                args.target = Some(other.to_string());
            }
        }
    }
    Ok(args)
}

fn resolve_target(raw: &str, default_port: u16) -> anyhow::Result<SocketAddr> {
    let candidate = if raw.contains(':') {
        raw.to_string()
    } else {
        format!("{}:{}", raw, default_port)
    };
    candidate
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}", candidate))?
        .next()
        .with_context(|| format!("{} resolved to no addresses", candidate))
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
    let raw_target = match &args.target {
        Some(target) => target,
        None => bail!("no receiver address given\n{USAGE}"),
    };
    let target = resolve_target(raw_target, config.network.port)?;

    let socket = Arc::new(connect_sender_socket(
        target,
        config.network.socket_buffer_bytes,
    )?);

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut ack_listener = AckListener::spawn(Arc::clone(&socket), events_tx)?;

    let meter = LevelMeter::new();
    let level = meter.handle();
    let (frames_tx, frames_rx) = bounded(64);
    let frame_samples = config.audio.frame_samples();

    // Tone mode replaces the device with a generator, everything after
    // the capture queue is identical
    let mut capture = None;
    let mut tone = None;
    let mut framer = if args.tone {
        let queue = Arc::new(CaptureQueue::new(CAPTURE_QUEUE_BLOCKS));
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_tone_capture(
            Arc::clone(&queue),
            config.audio.sample_rate,
            frame_samples,
            Arc::clone(&running),
        )?;
        tone = Some((running, handle));
        let assembler =
            FrameAssembler::new(1, config.audio.channels, config.audio.sample_rate, frame_samples);
        Framer::spawn(queue, frames_tx, assembler, meter)?
    } else {
        let mut device_capture = AudioCapture::new(&config.audio)?;
        device_capture.start()?;
        let assembler = FrameAssembler::new(
            device_capture.channels(),
            config.audio.channels,
            config.audio.sample_rate,
            frame_samples,
        );
        let framer = Framer::spawn(device_capture.queue(), frames_tx, assembler, meter)?;
        capture = Some(device_capture);
        framer
    };

    let mut audio_sender = AudioSender::spawn(
        Arc::clone(&socket),
        frames_rx,
        config.session.heartbeat_interval(),
    )?;

    let (session, session_task) = spawn_sender_session(
        UdpLink::new(Arc::clone(&socket)),
        config.session.clone(),
        config.audio.clone(),
        events_rx,
    );
    let feedback = spawn_feedback(session.watch(), level, None, Duration::from_secs(1));

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
                if capture.as_ref().map(|c| c.has_failed()).unwrap_or(false) {
                    error!("Capture device lost");
                    device_lost = true;
                    session.stop();
                    break;
                }
            }
        }
    }

    // Upstream first so no fresh audio races the goodbye
    if let Some(mut device_capture) = capture {
        device_capture.stop();
    }
    if let Some((running, handle)) = tone {
        running.store(false, Ordering::SeqCst);
        let _ = handle.join();
    }
    framer.stop();
    audio_sender.stop();

    let result = session_task.await.context("session task panicked")?;
    ack_listener.stop();
    feedback.abort();

    let stats = audio_sender.stats();
    info!(
        "Sent {} packets ({} bytes), {} heartbeats, {} frames framed, {} dropped",
        stats.packets_sent(),
        stats.bytes_sent(),
        stats.heartbeats_sent(),
        framer.frames_produced(),
        framer.frames_dropped(),
    );

    if device_lost {
        bail!("capture device disconnected");
    }
    result?;
    Ok(())
}
