/// Sensor stack: per-channel acquisition, health tracking, and the
/// dual-sensor coordinator that turns two levels into a leak signal.

pub mod dual;
pub mod health;
pub mod level;
