/// Slack notifications for leak and system alerts.
///
/// Delivery is strictly best effort: every path returns a bool rather than
/// an error, and the sampling loop never stalls or aborts because Slack is
/// down. The bot token comes from the environment, not the config file.

use chrono::Utc;
use serde_json::json;
use std::time::Duration;

use crate::config::SlackConfig;
use crate::logging::{self, Subsystem};
use crate::model::CombinedReading;

const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
const DEFAULT_CHANNEL: &str = "#alerts";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound notification channel. `true` means delivered.
/// Implementations are shared across the worker and control threads.
pub trait Notifier: Send + Sync {
    fn notify_leak(&self, reading: &CombinedReading) -> bool;
    fn notify_system(&self, alert_type: &str, message: &str) -> bool;
    fn notify_recovery(&self, message: &str) -> bool;
}

pub struct SlackNotifier {
    enabled: bool,
    bot_token: Option<String>,
    channel: String,
    mention_users: Vec<String>,
    client: reqwest::blocking::Client,
}

impl SlackNotifier {
    /// Build from config plus the token from the environment. Enabled
    /// without a token downgrades to disabled with an error logged, so a
    /// misconfigured deployment still monitors.
    pub fn new(config: &SlackConfig, bot_token: Option<String>) -> Result<Self, reqwest::Error> {
        let mut enabled = config.enabled;
        if enabled && bot_token.is_none() {
            logging::error(
                Subsystem::Slack,
                None,
                "Slack enabled but SLACK_BOT_TOKEN is not set, disabling notifications",
            );
            enabled = false;
        }

        let channel = config
            .channel
            .clone()
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
        if enabled {
            logging::info(
                Subsystem::Slack,
                None,
                &format!("Slack notifications enabled for channel {}", channel),
            );
        }

        Ok(Self {
            enabled,
            bot_token,
            channel,
            mention_users: config.mention_users.clone(),
            client: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
        })
    }

    /// Post a startup message to verify token and channel.
    pub fn test_connection(&self) -> bool {
        if !self.enabled {
            logging::info(Subsystem::Slack, None, "Slack notifications disabled");
            return false;
        }
        self.send(
            ":gear: Water monitoring service startup - Slack notifications active",
            false,
        )
    }

    fn build_leak_message(&self, reading: &CombinedReading) -> String {
        let mentions = self.mention_users.join(" ");
        format!(
            ":rotating_light: *WATER LEAK DETECTED* :rotating_light:\n\
             \n\
             {}\n\
             \n\
             *Alert Details:*\n\
             \u{2022} Sensor Difference: {:.1}%\n\
             \u{2022} Reference Sensor: {:.1}%\n\
             \u{2022} Control Sensor: {:.1}%\n\
             \u{2022} Detection Time: {}\n\
             \n\
             *Action Required:*\n\
             Check water system immediately for potential leaks.",
            mentions,
            reading.difference.abs(),
            reading.reference.percentage,
            reading.control.percentage,
            reading.timestamp.format("%Y-%m-%d %H:%M:%S"),
        )
    }

    fn send(&self, message: &str, urgent: bool) -> bool {
        let token = match &self.bot_token {
            Some(t) => t,
            None => return false,
        };

        let mut payload = json!({
            "channel": self.channel,
            "text": message,
            "parse": "full",
            "link_names": true,
        });
        if urgent {
            payload["attachments"] = json!([{
                "color": "danger",
                "text": message,
                "footer": "Water Monitoring System",
                "ts": Utc::now().timestamp(),
            }]);
        }

        let response = self
            .client
            .post(SLACK_POST_MESSAGE_URL)
            .bearer_auth(token)
            .json(&payload)
            .send();

        let body: serde_json::Value = match response.and_then(|r| r.json()) {
            Ok(body) => body,
            Err(e) => {
                logging::error(
                    Subsystem::Slack,
                    None,
                    &format!("Failed to reach Slack: {}", e),
                );
                return false;
            }
        };

        if body["ok"].as_bool() == Some(true) {
            logging::info(Subsystem::Slack, None, "Slack message sent");
            true
        } else {
            logging::error(
                Subsystem::Slack,
                None,
                &format!(
                    "Slack API error: {}",
                    body["error"].as_str().unwrap_or("unknown")
                ),
            );
            false
        }
    }
}

impl Notifier for SlackNotifier {
    fn notify_leak(&self, reading: &CombinedReading) -> bool {
        if !self.enabled {
            return false;
        }
        let message = self.build_leak_message(reading);
        self.send(&message, true)
    }

    fn notify_system(&self, alert_type: &str, message: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.send(
            &format!(":warning: *System Alert: {}*\n{}", alert_type, message),
            false,
        )
    }

    fn notify_recovery(&self, message: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.send(&format!(":white_check_mark: *System Recovery*\n{}", message), false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LeakStatus, SensorReading};
    use chrono::TimeZone;

    fn sample_reading() -> CombinedReading {
        let timestamp = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        CombinedReading {
            reference: SensorReading {
                raw: 42500,
                voltage: 2.1,
                percentage: 25.0,
                timestamp,
            },
            control: SensorReading {
                raw: 35000,
                voltage: 1.6,
                percentage: 50.0,
                timestamp,
            },
            difference: -25.0,
            status: LeakStatus::LeakDetected,
            timestamp,
        }
    }

    fn notifier_with(mention_users: Vec<String>) -> SlackNotifier {
        let config = SlackConfig {
            enabled: true,
            channel: Some("#water-alerts".to_string()),
            mention_users,
        };
        SlackNotifier::new(&config, Some("xoxb-test".to_string()))
            .expect("client should build")
    }

    #[test]
    fn test_leak_message_reports_absolute_difference() {
        let notifier = notifier_with(vec![]);
        let message = notifier.build_leak_message(&sample_reading());

        assert!(message.contains("WATER LEAK DETECTED"));
        assert!(
            message.contains("Sensor Difference: 25.0%"),
            "difference must be unsigned in the message:\n{}",
            message
        );
        assert!(message.contains("Reference Sensor: 25.0%"));
        assert!(message.contains("Control Sensor: 50.0%"));
        assert!(message.contains("2026-03-10 12:00:00"));
    }

    #[test]
    fn test_leak_message_includes_mentions() {
        let notifier = notifier_with(vec!["@oncall".to_string(), "@plumber".to_string()]);
        let message = notifier.build_leak_message(&sample_reading());
        assert!(message.contains("@oncall @plumber"));
    }

    #[test]
    fn test_enabled_without_token_downgrades_to_disabled() {
        let config = SlackConfig {
            enabled: true,
            channel: None,
            mention_users: vec![],
        };
        let notifier = SlackNotifier::new(&config, None).expect("client should build");
        assert!(!notifier.enabled);
        assert!(!notifier.notify_leak(&sample_reading()));
    }

    #[test]
    fn test_disabled_notifier_never_sends() {
        let config = SlackConfig::default();
        let notifier = SlackNotifier::new(&config, Some("xoxb-test".to_string()))
            .expect("client should build");
        assert!(!notifier.notify_system("sensor_failure", "Reference sensor failed"));
        assert!(!notifier.test_connection());
    }
}
