//! Cadence Core - Release orchestration engine
//!
//! This crate provides the core of the release orchestrator:
//! - Domain model: releases, cron jobs, regression cycles, tasks
//! - Database layer and the per-release advisory lease
//! - Task executor dispatching against provider capability traits
//! - Stage state machine (kickoff / regression / pre-release)
//! - Global scheduler with bounded per-tick concurrency
//! - Service operations invoked by the external HTTP layer

pub mod cron_job;
pub mod database;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod polling;
pub mod providers;
pub mod regression;
pub mod release;
pub mod release_service;
pub mod stages;
pub mod state_history;
pub mod task;
pub mod task_executor;
pub mod scheduler;
pub mod uploads;

pub use database::{Database, DatabaseConfig};
pub use error::{Error, Result};

// Re-export release types
pub use release::{
    PlatformName, PlatformTargetMapping, Release, ReleaseStatus, ReleaseType, TargetName,
};

// Re-export orchestration state types
pub use cron_job::{
    CronConfig, CronJob, CronStatus, PauseType, RegressionSlot, StageStatus,
    DEFAULT_LOCK_TIMEOUT_SEC,
};

// Re-export task types
pub use task::{
    kickoff_task_types, post_regression_task_types, regression_task_types, ReleaseTask,
    TaskCategory, TaskStage, TaskStatus, TaskType, KICKOFF_TASK_ORDER,
    POST_REGRESSION_TASK_ORDER, REGRESSION_TASK_ORDER,
};

// Re-export regression cycle types
pub use regression::{cycle_tag, release_tag, CycleStatus, RegressionCycle};

// Re-export upload/build types
pub use uploads::{
    validate_build_extension, Build, ReleaseUpload, UploadSummary, ALLOWED_BUILD_EXTENSIONS,
};

// Re-export audit types
pub use state_history::{HistoryAction, StateHistory, StateHistoryItem};

// Re-export provider abstractions
pub use providers::{
    AutomationStatus, CicdProviderType, CicdWorkflow, Messaging, Notification, PmTicket,
    ProviderRegistry, Scm, TestManagementRun, TicketStatus, WorkflowKind, WorkflowRun,
    WorkflowRunStatus, WorkflowTrigger,
};

// Re-export execution machinery
pub use notify::Notifier;
pub use orchestrator::Orchestrator;
pub use polling::{PollStats, PollerConfig, WorkflowPoller};
pub use release_service::{PauseOutcome, ReleaseService};
pub use scheduler::{
    IntervalTickSource, Scheduler, SchedulerConfig, TickSource, TickStats,
};
pub use stages::{StageContext, StageState};
pub use task_executor::{TaskContext, TaskExecutor};
