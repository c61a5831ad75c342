/// Alert dispatch: persist first, notify second.
///
/// The store write is the authoritative record of an alert; Slack delivery
/// is best effort on top of it. A notification failure is logged and
/// otherwise ignored, a store failure propagates to the sampling loop's
/// error handler.

use crate::logging::{self, Subsystem};
use crate::model::{AlertRecord, CombinedReading};
use crate::notify::Notifier;
use crate::store::{ReadingStore, StoreError};

pub const ALERT_TYPE_LEAK: &str = "leak_detected";

/// Build the persisted alert message for a divergent reading.
pub fn leak_alert_message(reading: &CombinedReading) -> String {
    format!(
        "Potential leak detected! Difference: {:.1}% (Reference: {:.1}%, Control: {:.1}%)",
        reading.difference, reading.reference.percentage, reading.control.percentage
    )
}

/// Persist and announce a leak alert, returning the stored alert id.
pub fn dispatch_leak_alert(
    store: &mut dyn ReadingStore,
    notifier: &dyn Notifier,
    reading: &CombinedReading,
) -> Result<i64, StoreError> {
    let message = leak_alert_message(reading);
    let record = AlertRecord {
        alert_type: ALERT_TYPE_LEAK.to_string(),
        message: message.clone(),
        difference: reading.difference,
        timestamp: reading.timestamp,
        acknowledged: false,
    };

    let id = store.store_alert(&record)?;
    logging::warn(Subsystem::Monitor, None, &message);

    if !notifier.notify_leak(reading) {
        logging::warn(
            Subsystem::Slack,
            None,
            "Leak alert stored but Slack notification was not delivered",
        );
    }

    Ok(id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
