//! Messaging fan-out
//!
//! Notifications are an out-of-band side effect: delivery failures are
//! logged and reported back as a flag, they never fail the task that asked
//! for them.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::providers::{Messaging, Notification};

/// Fire-and-forget notification sender
#[derive(Clone)]
pub struct Notifier {
    messaging: Arc<dyn Messaging>,
}

impl Notifier {
    pub fn new(messaging: Arc<dyn Messaging>) -> Self {
        Self { messaging }
    }

    /// Send a notification, swallowing delivery failures.
    ///
    /// Returns whether delivery succeeded so callers can record it.
    pub async fn send(&self, notification: Notification) -> bool {
        match self.messaging.send_notification(&notification).await {
            Ok(()) => {
                debug!(template = %notification.template, "Notification sent");
                true
            }
            Err(e) => {
                warn!(
                    template = %notification.template,
                    error = %e,
                    "Notification delivery failed"
                );
                false
            }
        }
    }

    /// Kickoff reminder ahead of the branch fork
    pub async fn kickoff_reminder(&self, release_id: &str, version: &str) -> bool {
        self.send(Notification::new(
            "kickoff-reminder",
            format!("Release v{} kickoff reminder", version.trim_start_matches('v')),
            format!(
                "Release {} kicks off soon. Review the release checklist before the branch is cut.",
                release_id
            ),
        ))
        .await
    }

    /// Regression build availability announcement
    pub async fn regression_build_message(&self, cycle_tag: &str, build_numbers: &str) -> bool {
        self.send(Notification::new(
            "regression-build",
            format!("Regression builds ready for {}", cycle_tag),
            format!(
                "Builds {} are available for regression cycle {}.",
                build_numbers, cycle_tag
            ),
        ))
        .await
    }

    /// Post-regression wrap-up announcement
    pub async fn post_regression_message(&self, release_id: &str, tag: &str) -> bool {
        self.send(Notification::new(
            "post-regression",
            format!("Release {} entering pre-release", tag),
            format!(
                "Regression finished for release {}. Pre-release tasks are underway for {}.",
                release_id, tag
            ),
        ))
        .await
    }

    /// Outstanding cherry-picks reminder
    pub async fn cherry_picks_reminder(&self, branch: &str, since_tag: &str) -> bool {
        self.send(Notification::new(
            "cherry-picks-reminder",
            format!("Cherry-picks outstanding on {}", branch),
            format!(
                "Branch {} has commits not in {}. Land or drop them before the release tag.",
                branch, since_tag
            ),
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::mock_registry;

    #[tokio::test]
    async fn test_send_reports_delivery() {
        let (registry, state) = mock_registry();
        let notifier = Notifier::new(registry.messaging.clone());

        assert!(notifier.kickoff_reminder("r1", "1.0.0").await);

        state.set_failing("send_notification", true);
        // Failure is swallowed, only reported as false
        assert!(!notifier.kickoff_reminder("r1", "1.0.0").await);
    }
}
