//! In-memory providers for tests and dry-run operation
//!
//! Every provider shares one [`MockState`], which records calls, hands out
//! sequential identifiers, and can be told to fail specific methods or hold
//! long-running work in a non-terminal state.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    AutomationStatus, CicdWorkflow, Messaging, Notification, PmTicket, ProviderRegistry, Scm,
    TestManagementRun, TicketStatus, WorkflowRun, WorkflowRunStatus, WorkflowTrigger,
};
use crate::release::PlatformName;
use crate::{Error, Result};

/// Shared knobs and call log for the mock providers
pub struct MockState {
    failing: Mutex<HashSet<String>>,
    failing_after: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
    seq: AtomicU64,
    /// When false, `get_test_status` reports a still-running automation run
    pub automation_terminal: AtomicBool,
    /// When false, `check_ticket_status` reports an incomplete ticket
    pub tickets_complete: AtomicBool,
    /// What `check_cherry_picks` reports; true means divergence exists
    pub cherry_picks_divergent: AtomicBool,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(HashSet::new()),
            failing_after: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            automation_terminal: AtomicBool::new(true),
            tickets_complete: AtomicBool::new(true),
            cherry_picks_divergent: AtomicBool::new(false),
        })
    }

    /// Make the named method fail until cleared. Clearing also removes any
    /// after-N failure set for it.
    pub fn set_failing(&self, method: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(method.to_string());
        } else {
            set.remove(method);
            self.failing_after.lock().unwrap().remove(method);
        }
    }

    /// Let the named method succeed `successes` times, then fail every call
    /// after that until cleared via `set_failing(method, false)`.
    pub fn set_failing_after(&self, method: &str, successes: usize) {
        self.failing_after
            .lock()
            .unwrap()
            .insert(method.to_string(), successes);
    }

    /// All recorded calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls recorded for one method
    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(method))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, method: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(method) {
            return Err(Error::Provider(format!("{} failed (injected)", method)));
        }
        // record() runs before check(), so the current call is in the count
        if let Some(limit) = self.failing_after.lock().unwrap().get(method).copied() {
            if self.call_count(method) > limit {
                return Err(Error::Provider(format!("{} failed (injected)", method)));
            }
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.seq.fetch_add(1, Ordering::SeqCst))
    }
}

/// Build a registry where every provider is backed by the returned state
pub fn mock_registry() -> (ProviderRegistry, Arc<MockState>) {
    let state = MockState::new();
    let registry = ProviderRegistry::new(
        Arc::new(MockScm {
            state: state.clone(),
        }),
        Arc::new(MockCicd {
            state: state.clone(),
        }),
        Arc::new(MockPm {
            state: state.clone(),
        }),
        Arc::new(MockTestManagement {
            state: state.clone(),
        }),
        Arc::new(MockMessaging {
            state: state.clone(),
        }),
    );
    (registry, state)
}

pub struct MockScm {
    state: Arc<MockState>,
}

#[async_trait]
impl Scm for MockScm {
    async fn fork_branch(&self, base_branch: &str, new_branch: &str) -> Result<serde_json::Value> {
        self.state
            .record(format!("fork_branch:{}:{}", base_branch, new_branch));
        self.state.check("fork_branch")?;
        Ok(serde_json::json!({"branch": new_branch, "base": base_branch}))
    }

    async fn create_tag(&self, tag: &str, branch: &str) -> Result<serde_json::Value> {
        self.state.record(format!("create_tag:{}:{}", tag, branch));
        self.state.check("create_tag")?;
        Ok(serde_json::json!({"tag": tag, "sha": self.state.next_id("sha")}))
    }

    async fn create_release_notes(&self, tag: &str, branch: &str) -> Result<serde_json::Value> {
        self.state
            .record(format!("create_release_notes:{}:{}", tag, branch));
        self.state.check("create_release_notes")?;
        Ok(serde_json::json!({"tag": tag, "notes": format!("Notes for {}", tag)}))
    }

    async fn check_cherry_picks(&self, branch: &str, since_tag: &str) -> Result<bool> {
        self.state
            .record(format!("check_cherry_picks:{}:{}", branch, since_tag));
        self.state.check("check_cherry_picks")?;
        Ok(self.state.cherry_picks_divergent.load(Ordering::SeqCst))
    }
}

pub struct MockCicd {
    state: Arc<MockState>,
}

#[async_trait]
impl CicdWorkflow for MockCicd {
    async fn trigger(&self, request: &WorkflowTrigger) -> Result<WorkflowRun> {
        self.state.record(format!(
            "trigger:{}:{}",
            request.kind.as_str(),
            request.platform.as_str()
        ));
        self.state.check("trigger")?;
        let run_id = self.state.next_id("run");
        Ok(WorkflowRun {
            build_number: Some(self.state.next_id("build")),
            status: WorkflowRunStatus::Queued,
            url: Some(format!("https://ci.example.com/runs/{}", run_id)),
            run_id,
        })
    }

    async fn get_status(&self, run_id: &str) -> Result<WorkflowRun> {
        self.state.record(format!("get_status:{}", run_id));
        self.state.check("get_status")?;
        Ok(WorkflowRun {
            run_id: run_id.to_string(),
            build_number: None,
            status: WorkflowRunStatus::Succeeded,
            url: None,
        })
    }

    async fn find_dispatched_run(&self, correlation_id: &str) -> Result<Option<WorkflowRun>> {
        self.state
            .record(format!("find_dispatched_run:{}", correlation_id));
        self.state.check("find_dispatched_run")?;
        Ok(Some(WorkflowRun {
            run_id: correlation_id.to_string(),
            build_number: None,
            status: WorkflowRunStatus::Running,
            url: None,
        }))
    }
}

pub struct MockPm {
    state: Arc<MockState>,
}

#[async_trait]
impl PmTicket for MockPm {
    async fn create_tickets(&self, platform: PlatformName, version: &str) -> Result<String> {
        self.state
            .record(format!("create_tickets:{}:{}", platform.as_str(), version));
        self.state.check("create_tickets")?;
        Ok(self.state.next_id("TICKET"))
    }

    async fn check_ticket_status(&self, ticket_key: &str) -> Result<TicketStatus> {
        self.state
            .record(format!("check_ticket_status:{}", ticket_key));
        self.state.check("check_ticket_status")?;
        let current = if self.state.tickets_complete.load(Ordering::SeqCst) {
            "Released"
        } else {
            "In Review"
        };
        Ok(TicketStatus {
            current_status: current.to_string(),
            completed_status: "Released".to_string(),
        })
    }
}

pub struct MockTestManagement {
    state: Arc<MockState>,
}

#[async_trait]
impl TestManagementRun for MockTestManagement {
    async fn create_test_runs(&self, platform: PlatformName, version: &str) -> Result<String> {
        self.state
            .record(format!("create_test_runs:{}:{}", platform.as_str(), version));
        self.state.check("create_test_runs")?;
        Ok(self.state.next_id("testrun"))
    }

    async fn reset_test_run(&self, run_id: &str) -> Result<serde_json::Value> {
        self.state.record(format!("reset_test_run:{}", run_id));
        self.state.check("reset_test_run")?;
        Ok(serde_json::json!({"runId": run_id, "reset": true}))
    }

    async fn get_test_status(&self, run_id: &str) -> Result<AutomationStatus> {
        self.state.record(format!("get_test_status:{}", run_id));
        self.state.check("get_test_status")?;
        let terminal = self.state.automation_terminal.load(Ordering::SeqCst);
        Ok(AutomationStatus {
            run_id: run_id.to_string(),
            passed: if terminal { 42 } else { 17 },
            failed: 0,
            total: 42,
            threshold_met: terminal,
            is_terminal: terminal,
        })
    }
}

pub struct MockMessaging {
    state: Arc<MockState>,
}

#[async_trait]
impl Messaging for MockMessaging {
    async fn send_notification(&self, notification: &Notification) -> Result<()> {
        self.state
            .record(format!("send_notification:{}", notification.template));
        self.state.check("send_notification")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failure() {
        let (registry, state) = mock_registry();

        state.set_failing("fork_branch", true);
        let result = registry.scm.fork_branch("develop", "release/v1.0.0").await;
        assert!(matches!(result, Err(Error::Provider(_))));

        state.set_failing("fork_branch", false);
        let result = registry.scm.fork_branch("develop", "release/v1.0.0").await;
        assert!(result.is_ok());
        assert_eq!(state.call_count("fork_branch"), 2);
    }

    #[tokio::test]
    async fn test_failure_after_n_successes() {
        let (registry, state) = mock_registry();
        state.set_failing_after("create_tag", 1);

        assert!(registry.scm.create_tag("v1.0.0", "main").await.is_ok());
        assert!(registry.scm.create_tag("v1.0.1", "main").await.is_err());
        assert!(registry.scm.create_tag("v1.0.2", "main").await.is_err());

        state.set_failing("create_tag", false);
        assert!(registry.scm.create_tag("v1.0.3", "main").await.is_ok());
    }

    #[tokio::test]
    async fn test_automation_status_knob() {
        let (registry, state) = mock_registry();

        state.automation_terminal.store(false, Ordering::SeqCst);
        let status = registry.test_management.get_test_status("r1").await.unwrap();
        assert!(!status.is_terminal);

        state.automation_terminal.store(true, Ordering::SeqCst);
        let status = registry.test_management.get_test_status("r1").await.unwrap();
        assert!(status.is_terminal);
        assert!(status.threshold_met);
    }

    #[tokio::test]
    async fn test_sequential_ids() {
        let (registry, _state) = mock_registry();
        let a = registry
            .pm
            .create_tickets(PlatformName::Android, "1.0.0")
            .await
            .unwrap();
        let b = registry
            .pm
            .create_tickets(PlatformName::Ios, "1.0.0")
            .await
            .unwrap();
        assert_ne!(a, b);
    }
}
