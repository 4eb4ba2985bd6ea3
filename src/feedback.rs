//! Periodic status lines for the terminal
//!
//! Both binaries log one line per interval: session state, a VU bar over
//! the smoothed level, and on the receiver the jitter counters. The line
//! is the whole user interface while a stream is running.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audio::jitter::{JitterStats, SharedJitter};
use crate::audio::meter::LevelHandle;
use crate::session::SessionSnapshot;

/// Width of the VU bar in characters
const BAR_WIDTH: usize = 20;

/// Meter readings older than this render as no signal
const STALE_AFTER: Duration = Duration::from_secs(2);

/// Render a level as `[######--------------]`
pub fn vu_bar(level: f32, width: usize) -> String {
    let filled = ((level.clamp(0.0, 1.0) * width as f32).round() as usize).min(width);
    let mut bar = String::with_capacity(width + 2);
    bar.push('[');
    for _ in 0..filled {
        bar.push('#');
    }
    for _ in filled..width {
        bar.push('-');
    }
    bar.push(']');
    bar
}

/// Level in decibels relative to full scale, floored at -60
pub fn level_db(level: f32) -> f32 {
    if level <= 0.0 {
        return -60.0;
    }
    (20.0 * level.log10()).max(-60.0)
}

fn status_line(
    snapshot: &SessionSnapshot,
    level: f32,
    stale: bool,
    jitter: Option<JitterStats>,
) -> String {
    let mut line = match snapshot.peer {
        Some(peer) => format!("{} with {}", snapshot.state, peer),
        None => snapshot.state.to_string(),
    };

    if stale {
        line.push_str(&format!(" | {} no signal", vu_bar(0.0, BAR_WIDTH)));
    } else {
        line.push_str(&format!(
            " | {} {:>5.1} dB",
            vu_bar(level, BAR_WIDTH),
            level_db(level)
        ));
    }

    if let Some(stats) = jitter {
        line.push_str(&format!(
            " | depth {} concealed {} late {} underruns {}",
            stats.depth, stats.concealed, stats.too_late, stats.underruns
        ));
    }
    line
}

fn meter_is_stale(level: &LevelHandle) -> bool {
    let updated = level.updated_us();
    if updated == 0 {
        return true;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    now.saturating_sub(updated) > STALE_AFTER.as_micros() as u64
}

/// Spawn the status loop, it ends on its own when the session does
pub fn spawn_feedback(
    session: watch::Receiver<SessionSnapshot>,
    level: LevelHandle,
    jitter: Option<SharedJitter>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if session.has_changed().is_err() {
                break;
            }
            let snapshot = session.borrow().clone();
            if snapshot.state.is_terminal() {
                break;
            }

            let jitter_stats = jitter.as_ref().map(|j| j.lock().stats());
            info!(
                "{}",
                status_line(
                    &snapshot,
                    level.level(),
                    meter_is_stale(&level),
                    jitter_stats
                )
            );
        }
    })
}
