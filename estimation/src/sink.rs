//! Estimate output and the channel it leaves the estimation loop through.
//!
//! Consumers (visualizers, loggers) are decoupled by a capacity-one channel.
//! Pushing never waits: while the slot is occupied, newer estimates are
//! dropped.

use crate::rotation::{rotate, RotationMatrix, Vec4};
use crate::ImuSample;
use nalgebra::Vector3;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// One attitude update, as sent to visualizers.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Estimate {
    /// Seconds since the estimation loop started.
    pub time: f64,
    /// Unit quaternion (w, x, y, z).
    pub quaternion: [f64; 4],
    pub rotation: RotationMatrix,
    /// Reference x, y and z unit axes expressed in the estimated frame.
    pub axes: [[f64; 3]; 3],
    /// Named scalar channels for 2D plots (the filtered sample).
    pub channels: BTreeMap<&'static str, f64>,
}

impl Estimate {
    pub fn new(time: Duration, quaternion: &Vec4<f64>, rotation: RotationMatrix, sample: &ImuSample) -> Self {
        let axes = [Vector3::x(), Vector3::y(), Vector3::z()].map(|axis| {
            let v = rotate(&rotation, &axis);
            [v.x, v.y, v.z]
        });
        Self {
            time: time.as_secs_f64(),
            quaternion: [quaternion[0], quaternion[1], quaternion[2], quaternion[3]],
            rotation,
            axes,
            channels: sample.channels().collect(),
        }
    }
}

/// Sending half of the estimate channel.
#[derive(Debug)]
pub struct EstimateSink {
    tx: mpsc::Sender<Estimate>,
    dropped: u64,
}

/// Creates the capacity-one estimate channel.
pub fn channel() -> (EstimateSink, mpsc::Receiver<Estimate>) {
    let (tx, rx) = mpsc::channel(1);
    (EstimateSink { tx, dropped: 0 }, rx)
}

/// Empties the receiving end without waiting, for a consumer that (re)joins
/// late and only wants updates from now on. Returns how many were discarded.
pub fn discard_pending(rx: &mut mpsc::Receiver<Estimate>) -> usize {
    let mut discarded = 0;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

impl EstimateSink {
    /// Offers an estimate to the consumer without waiting. Returns whether it
    /// was accepted; a full or closed channel silently discards it.
    pub fn push(&mut self, estimate: Estimate) -> bool {
        match self.tx.try_send(estimate) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                trace!(dropped = self.dropped, "Estimate sink full, dropping update");
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Estimate sink closed, dropping update");
                false
            }
        }
    }

    /// Number of estimates discarded because the consumer was behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
