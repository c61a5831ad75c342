/// Analog-to-digital converter abstraction.
///
/// The physical device is a 4-channel 16-bit I2C ADC (ADS1115-class) shared
/// by both water level sensors: reference on channel 0, control on channel 1.
/// This module defines the seam the sensor stack reads through; concrete
/// backends live behind it (`dev_mode::SimulatedAdc` for hardware-less
/// machines, a hardware driver on the deployment target).
///
/// Hardware failures are explicit `Err` values, never panics and never
/// silently-swallowed sentinels. Callers decide how to degrade.

use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Channel wired to the reference (monitored container) sensor.
pub const CHANNEL_REFERENCE: u8 = 0;

/// Channel wired to the control (sealed container) sensor.
pub const CHANNEL_CONTROL: u8 = 1;

/// Highest valid channel index on the converter.
pub const MAX_CHANNEL: u8 = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by an ADC backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdcError {
    /// Channel index outside 0..=3.
    InvalidChannel(u8),
    /// The bus transaction or conversion failed.
    ReadFailed(String),
    /// The converter could not be brought up at all.
    InitFailed(String),
}

impl std::fmt::Display for AdcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdcError::InvalidChannel(ch) => {
                write!(f, "Invalid ADC channel {} (must be 0-{})", ch, MAX_CHANNEL)
            }
            AdcError::ReadFailed(msg) => write!(f, "ADC read failed: {}", msg),
            AdcError::InitFailed(msg) => write!(f, "ADC initialization failed: {}", msg),
        }
    }
}

impl std::error::Error for AdcError {}

// ---------------------------------------------------------------------------
// Converter interface
// ---------------------------------------------------------------------------

/// A multi-channel analog converter.
///
/// One instantaneous conversion per call; averaging is the sensor layer's
/// job. Implementations take `&mut self` because a conversion occupies the
/// shared bus.
pub trait AdcInterface: Send {
    /// Read the raw conversion value (0-65535 on a 16-bit device).
    fn read_raw(&mut self, channel: u8) -> Result<i32, AdcError>;

    /// Read the channel voltage in volts.
    fn read_voltage(&mut self, channel: u8) -> Result<f64, AdcError>;
}

/// The converter as shared between the two sensors.
///
/// The mutex scope is "one full N-sample averaging run": a sensor holds the
/// lock for its whole averaging loop so two reads of the same channel can
/// never interleave. Cross-sensor serialization is a side effect of sharing
/// one bus and is acceptable at these sample rates.
pub type SharedAdc = Arc<Mutex<Box<dyn AdcInterface>>>;

/// Wrap a backend for sharing between sensors.
pub fn share(adc: Box<dyn AdcInterface>) -> SharedAdc {
    Arc::new(Mutex::new(adc))
}

/// Validate a channel index, for backends to call before touching the bus.
pub fn check_channel(channel: u8) -> Result<(), AdcError> {
    if channel > MAX_CHANNEL {
        Err(AdcError::InvalidChannel(channel))
    } else {
        Ok(())
    }
}
