/// Alerting pipeline: hysteresis + cooldown decision logic and the
/// dispatcher that persists and notifies.

pub mod dispatch;
pub mod leak;
