//! Jitter buffer between the network and the playback clock
//!
//! Frames arrive whenever the network delivers them; playback consumes one
//! frame per tick. The buffer absorbs reordering and delay variance with a
//! sequence-indexed ring, conceals frames that never arrive, and jumps
//! forward when the sender restarts far ahead.
//!
//! Playout rules, in order, when the next frame is missing:
//! - ring fully drained: drop back to priming and report an underrun
//! - enough audio already buffered ahead: conceal immediately, waiting
//!   would only add latency we cannot recover
//! - otherwise wait up to `max_wait_ticks` ticks for the frame, then conceal
//!
//! Sequence comparisons use wrapping distance so `u32` rollover is
//! transparent.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::audio::AudioFrame;
use crate::config::JitterConfig;

/// Jitter buffer shared between the receive thread and the audio callback
pub type SharedJitter = Arc<Mutex<JitterBuffer>>;

/// Signed distance from `b` to `a` in sequence space
fn seq_distance(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// What [`JitterBuffer::insert`] did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    /// Sequence already buffered, frame discarded
    Duplicate,
    /// Playout already passed this sequence, frame discarded
    TooLate,
    /// Frame was so far ahead the buffer cleared and jumped to it
    Resync,
}

/// What playback gets for one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    /// The expected frame, in order
    Frame(AudioFrame),
    /// The expected frame is missing, play this silence in its place
    Concealed(Vec<i16>),
    /// Nothing to play yet, priming or waiting on a late frame
    NotReady,
}

/// Counters since creation, plus the current depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub inserted: u64,
    pub duplicates: u64,
    pub too_late: u64,
    pub resyncs: u64,
    pub concealed: u64,
    pub underruns: u64,
    pub primings: u64,
    pub depth: usize,
}

pub struct JitterBuffer {
    slots: Vec<Option<AudioFrame>>,
    mask: u32,
    target_depth: usize,
    max_wait_ticks: u32,
    frame_len: usize,
    next_playout: u32,
    primed: bool,
    has_played: bool,
    waited: u32,
    stats: JitterStats,
}

impl JitterBuffer {
    /// `frame_len` is the total sample count of one frame, used to size
    /// concealment silence
    pub fn new(config: &JitterConfig, frame_len: usize) -> Self {
        let capacity = config.capacity.next_power_of_two().max(2);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity as u32 - 1,
            target_depth: config.target_depth.min(capacity - 1),
            max_wait_ticks: config.max_wait_ticks,
            frame_len,
            next_playout: 0,
            primed: false,
            has_played: false,
            waited: 0,
            stats: JitterStats::default(),
        }
    }

    pub fn new_shared(config: &JitterConfig, frame_len: usize) -> SharedJitter {
        Arc::new(Mutex::new(Self::new(config, frame_len)))
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Frames currently buffered
    pub fn depth(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Total sample count of one frame
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            depth: self.depth(),
            ..self.stats
        }
    }

    /// Forget all buffered audio and return to priming
    ///
    /// Cumulative counters survive, they describe the life of the session.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.primed = false;
        self.has_played = false;
        self.waited = 0;
        self.next_playout = 0;
    }

    /// Store a received frame at its sequence position
    pub fn insert(&mut self, frame: AudioFrame) -> InsertOutcome {
        let seq = frame.sequence;

        if self.depth() == 0 && !self.has_played {
            // First frame of a fresh stream defines where playout starts
            self.next_playout = seq;
        }

        let dist = seq_distance(seq, self.next_playout);

        if dist < 0 {
            if self.has_played {
                // Playout has moved past this sequence, a straggler must
                // not rewind the stream
                self.stats.too_late += 1;
                return InsertOutcome::TooLate;
            }
            // Still in the initial priming, an earlier frame just extends
            // the window back
            self.next_playout = seq;
            return self.store(frame);
        }

        if dist as usize >= self.capacity() {
            warn!(
                "Sequence jump of {} frames, resyncing playout to {}",
                dist, seq
            );
            for slot in &mut self.slots {
                *slot = None;
            }
            self.next_playout = seq;
            self.primed = false;
            self.waited = 0;
            self.stats.resyncs += 1;
            self.store(frame);
            return InsertOutcome::Resync;
        }

        self.store(frame)
    }

    fn store(&mut self, frame: AudioFrame) -> InsertOutcome {
        let idx = (frame.sequence & self.mask) as usize;
        if let Some(existing) = &self.slots[idx] {
            if existing.sequence == frame.sequence {
                self.stats.duplicates += 1;
                return InsertOutcome::Duplicate;
            }
        }
        self.slots[idx] = Some(frame);
        self.stats.inserted += 1;
        InsertOutcome::Stored
    }

    /// Advance the playout clock by one tick
    pub fn pop_next(&mut self) -> PopOutcome {
        if !self.primed {
            if self.depth() >= self.target_depth {
                self.primed = true;
                self.waited = 0;
                self.stats.primings += 1;
                debug!(
                    "Primed with {} frames, playout starts at {}",
                    self.depth(),
                    self.next_playout
                );
            } else {
                return PopOutcome::NotReady;
            }
        }

        let idx = (self.next_playout & self.mask) as usize;
        let wanted = self.next_playout;
        if let Some(frame) = self.slots[idx].take_if(|f| f.sequence == wanted) {
            self.next_playout = self.next_playout.wrapping_add(1);
            self.waited = 0;
            self.has_played = true;
            return PopOutcome::Frame(frame);
        }

        let ahead = self.depth();
        if ahead == 0 {
            self.primed = false;
            self.waited = 0;
            self.stats.underruns += 1;
            debug!("Jitter buffer drained, repriming");
            return PopOutcome::NotReady;
        }

        if ahead >= self.target_depth || self.waited >= self.max_wait_ticks {
            self.stats.concealed += 1;
            debug!("Concealing missing frame {}", self.next_playout);
            self.next_playout = self.next_playout.wrapping_add(1);
            self.waited = 0;
            return PopOutcome::Concealed(vec![0; self.frame_len]);
        }

        self.waited += 1;
        PopOutcome::NotReady
    }
}
