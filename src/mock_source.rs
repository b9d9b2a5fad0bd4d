//! Synthetic power-profiler sample stream.
//!
//! Produces what a USB power monitor streams: one current reading per sample as a
//! little-endian `f32` in amperes, followed by one byte of digital channel levels.
//! The trace is a device alternating between a sleep floor and periodic radio bursts,
//! with ±5% noise on every reading.
//!
//! The sample buffer never interprets these bytes; this module only exists to drive
//! it with realistic volume.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bytes per encoded sample: `f32` current plus one digital byte.
pub const SAMPLE_SIZE: usize = 5;

const SLEEP_CURRENT_A: f32 = 0.000_004;
const ACTIVE_CURRENT_A: f32 = 0.012;
const BURST_PERIOD_SECS: f64 = 0.1;
const BURST_DUTY: f64 = 0.08;

/// One decoded sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Current in amperes
    pub current: f32,
    /// Digital channel levels, bit `n` is channel `n`
    pub digital: u8,
}

impl Sample {
    /// Append the wire encoding of this sample to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.current.to_le_bytes());
        out.push(self.digital);
    }

    /// Decode one sample from exactly [`SAMPLE_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; SAMPLE_SIZE] = bytes.try_into().ok()?;
        Some(Self {
            current: f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            digital: raw[4],
        })
    }
}

/// Deterministic-on-request generator of encoded sample chunks.
#[derive(Debug)]
pub struct MockSampleSource {
    rng: StdRng,
    sample_rate_hz: u32,
    produced: u64,
}

impl MockSampleSource {
    /// Create a source; `seed` makes the stream reproducible.
    pub fn new(sample_rate_hz: u32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            sample_rate_hz: sample_rate_hz.max(1),
            produced: 0,
        }
    }

    /// Samples generated so far.
    #[must_use]
    pub fn samples_produced(&self) -> u64 {
        self.produced
    }

    /// Generate the next `samples` samples, encoded.
    pub fn next_chunk(&mut self, samples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples * SAMPLE_SIZE);
        for _ in 0..samples {
            let sample = self.next_sample();
            sample.encode_into(&mut out);
        }
        out
    }

    fn next_sample(&mut self) -> Sample {
        let t = self.produced as f64 / f64::from(self.sample_rate_hz);
        self.produced += 1;

        let phase = (t % BURST_PERIOD_SECS) / BURST_PERIOD_SECS;
        let active = phase < BURST_DUTY;
        let base = if active {
            ACTIVE_CURRENT_A
        } else {
            SLEEP_CURRENT_A
        };
        let noise: f32 = self.rng.gen_range(-0.05..0.05);

        Sample {
            current: base * (1.0 + noise),
            // Channel 0 mirrors the radio enable line
            digital: u8::from(active),
        }
    }
}
