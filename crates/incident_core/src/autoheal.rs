use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::HealConfig;

pub const DEFAULT_TARGET: &str = "service_x";
const MANUAL_TICKET: &str = "Manual investigation ticket created.";

/// Command template per remediation action. `{service}` is the target.
const SCRIPTS: &[(&str, &str)] = &[
    ("restart_service", "systemctl restart {service}"),
    ("clear_cache", "rm -rf /tmp/cache/*"),
    ("scale_up", "kubectl scale deployment {service} --replicas=5"),
    ("reset_password", "Resetting password for user..."),
];

/// Keywords checked in order; the first matching rule wins.
const RULES: &[(&[&str], &str)] = &[
    (&["latency", "slow"], "scale_up"),
    (&["down", "crash"], "restart_service"),
    (&["disk", "full"], "clear_cache"),
    (&["login", "password"], "reset_password"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealResult {
    pub action: String,
    pub command_executed: String,
    pub status: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Simulated remediation. Commands are rendered and reported, never run.
#[derive(Debug, Clone)]
pub struct AutoHealer {
    delay: Duration,
}

impl AutoHealer {
    pub fn new(config: &HealConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.delay_ms),
        }
    }

    pub fn determine_action(description: &str) -> &'static str {
        let desc = description.to_lowercase();
        RULES
            .iter()
            .find(|(words, _)| words.iter().any(|w| desc.contains(w)))
            .map_or("engineer_investigation", |(_, action)| *action)
    }

    pub fn command_for(action: &str, target: &str) -> String {
        SCRIPTS
            .iter()
            .find(|(name, _)| *name == action)
            .map_or_else(
                || MANUAL_TICKET.to_string(),
                |(_, template)| template.replace("{service}", target),
            )
    }

    pub async fn execute(&self, action: &str, target: &str) -> HealResult {
        let command = Self::command_for(action, target);
        info!(action, target, command = %command, "simulating auto-heal");
        tokio::time::sleep(self.delay).await;

        HealResult {
            action: action.to_string(),
            command_executed: command,
            status: "Success".to_string(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_rules_pick_actions_in_order() {
        assert_eq!(AutoHealer::determine_action("API latency spike"), "scale_up");
        assert_eq!(AutoHealer::determine_action("Service is DOWN"), "restart_service");
        assert_eq!(AutoHealer::determine_action("Disk nearly full"), "clear_cache");
        assert_eq!(AutoHealer::determine_action("Login loop"), "reset_password");
        // slow beats crash because scale_up is checked first
        assert_eq!(AutoHealer::determine_action("slow then crash"), "scale_up");
        assert_eq!(
            AutoHealer::determine_action("printer jammed"),
            "engineer_investigation"
        );
    }

    #[test]
    fn commands_render_target() {
        assert_eq!(
            AutoHealer::command_for("scale_up", "checkout"),
            "kubectl scale deployment checkout --replicas=5"
        );
        assert_eq!(AutoHealer::command_for("clear_cache", "x"), "rm -rf /tmp/cache/*");
        assert_eq!(AutoHealer::command_for("reboot_moon", "x"), MANUAL_TICKET);
    }

    #[tokio::test]
    async fn execute_reports_success() {
        let healer = AutoHealer::new(&HealConfig { delay_ms: 0 });
        let result = healer.execute("restart_service", "billing").await;

        assert_eq!(result.status, "Success");
        assert_eq!(result.command_executed, "systemctl restart billing");
        assert!(result.timestamp > 1.6e9);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_waits_for_configured_delay() {
        let healer = AutoHealer::new(&HealConfig { delay_ms: 1000 });
        let started = tokio::time::Instant::now();
        healer.execute("clear_cache", DEFAULT_TARGET).await;
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
