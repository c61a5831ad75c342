/// Development mode: a simulated converter for machines without the
/// sensor hardware.
///
/// Produces deterministic readings from per-channel water levels with a
/// small pseudo-random jitter, and can drain one channel per conversion to
/// exercise the leak pipeline end to end. Used by the binary when
/// `LEAKMON_SIMULATE` is set, and by the integration tests.

use crate::adc::{self, AdcError, AdcInterface};
use crate::config::{DEFAULT_EMPTY_RAW, DEFAULT_FULL_RAW};

/// Full-scale voltage of the simulated 16-bit converter.
const FULL_SCALE_VOLTS: f64 = 3.3;
const FULL_SCALE_RAW: f64 = 65535.0;

/// Jitter amplitude in raw counts, small enough to stay far below the
/// leak threshold after averaging.
const JITTER_COUNTS: i32 = 20;

struct SimulatedChannel {
    level_percent: f64,
    /// Level change applied after every conversion, percentage points.
    /// Negative values simulate a leak.
    drain_per_read: f64,
}

pub struct SimulatedAdc {
    channels: [SimulatedChannel; 2],
    rng_state: u64,
}

impl SimulatedAdc {
    /// Both containers at the given fill levels, no drain.
    pub fn new(reference_percent: f64, control_percent: f64) -> Self {
        Self {
            channels: [
                SimulatedChannel {
                    level_percent: reference_percent,
                    drain_per_read: 0.0,
                },
                SimulatedChannel {
                    level_percent: control_percent,
                    drain_per_read: 0.0,
                },
            ],
            rng_state: 0x5eed_1e51,
        }
    }

    /// Drain a channel by `percent_per_read` points after each conversion.
    pub fn set_drain(&mut self, channel: u8, percent_per_read: f64) -> Result<(), AdcError> {
        adc::check_channel(channel)?;
        self.channels[channel as usize].drain_per_read = -percent_per_read;
        Ok(())
    }

    /// Deterministic jitter in [-JITTER_COUNTS, JITTER_COUNTS].
    fn jitter(&mut self) -> i32 {
        // Numerical Recipes LCG constants.
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let span = (2 * JITTER_COUNTS + 1) as u64;
        ((self.rng_state >> 33) % span) as i32 - JITTER_COUNTS
    }

    fn convert(&mut self, channel: u8) -> Result<i32, AdcError> {
        adc::check_channel(channel)?;
        if channel as usize >= self.channels.len() {
            return Err(AdcError::ReadFailed(format!(
                "no simulated sensor on channel {}",
                channel
            )));
        }

        let jitter = self.jitter();
        let state = &mut self.channels[channel as usize];
        let span = (DEFAULT_EMPTY_RAW - DEFAULT_FULL_RAW) as f64;
        let raw = DEFAULT_EMPTY_RAW as f64 - state.level_percent / 100.0 * span;

        state.level_percent =
            (state.level_percent + state.drain_per_read).clamp(0.0, 100.0);

        Ok(raw as i32 + jitter)
    }
}

impl AdcInterface for SimulatedAdc {
    fn read_raw(&mut self, channel: u8) -> Result<i32, AdcError> {
        self.convert(channel)
    }

    fn read_voltage(&mut self, channel: u8) -> Result<f64, AdcError> {
        let raw = self.convert(channel)?;
        Ok(raw as f64 / FULL_SCALE_RAW * FULL_SCALE_VOLTS)
    }
}
