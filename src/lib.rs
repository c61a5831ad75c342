/// Dual-sensor water leak detection service.
///
/// Two eTape water level sensors share one ADC: the reference sensor sits
/// in the monitored container, the control sensor in a sealed container at
/// the same fill level. Evaporation and temperature move both levels
/// together; a leak moves only the reference. The engine samples both on a
/// schedule, persists every reading, tracks per-sensor health, and raises
/// a Slack alert when the divergence persists.

pub mod adc;
pub mod alert;
pub mod config;
pub mod dev_mode;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod sensor;
pub mod store;
