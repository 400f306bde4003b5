//! Scripted scenario driver.
//!
//! A script is a JSON array of steps run in order against one scheduler:
//!
//! ```json
//! [
//!   { "step": "enqueue", "timeoutMs": 5000,
//!     "instruction": { "kind": "request_email",
//!                      "parameters": { "prompt": "Your email?" },
//!                      "metadata": { "version": "1.0.0", "producer_id": "form_collector" } } },
//!   { "step": "wait", "ms": 6000 },
//!   { "step": "retry", "id": 1 },
//!   { "step": "complete", "response": { "email": "user@example.com" } }
//! ]
//! ```

use crate::instruction::{Instruction, InstructionEnvelope};
use crate::scheduler::{ManualClock, Scheduler, SchedulerSnapshot};
use crate::types::InstructionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ReplayStep {
    #[serde(rename_all = "camelCase")]
    Enqueue {
        instruction: InstructionEnvelope,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Complete {
        #[serde(default)]
        response: Option<serde_json::Value>,
    },
    Cancel {
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        message: String,
    },
    Defer {
        #[serde(default)]
        reason: Option<String>,
    },
    Retry {
        id: InstructionId,
    },
    Resume {
        id: InstructionId,
    },
    Cleanup,
    Clear,
    Wait {
        ms: u64,
    },
}

impl ReplayStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enqueue { .. } => "enqueue",
            Self::Complete { .. } => "complete",
            Self::Cancel { .. } => "cancel",
            Self::Error { .. } => "error",
            Self::Defer { .. } => "defer",
            Self::Retry { .. } => "retry",
            Self::Resume { .. } => "resume",
            Self::Cleanup => "cleanup",
            Self::Clear => "clear",
            Self::Wait { .. } => "wait",
        }
    }
}

/// What a step did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Enqueued { id: InstructionId },
    /// Queue full or rate limited
    Rejected,
    /// Invalid or unauthorized instruction
    Refused { error: String },
    /// Active-slot transition; `id` is `None` when the slot was empty
    Transitioned { id: Option<InstructionId> },
    Applied { accepted: bool },
    CleanedUp { removed: usize },
    Cleared,
    Waited { ms: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step: &'static str,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub snapshot: SchedulerSnapshot,
}

pub fn parse_script(raw: &str) -> anyhow::Result<Vec<ReplayStep>> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid replay script: {}", e))
}

/// Runs steps against a scheduler. With a manual clock, `wait` advances
/// virtual time; otherwise it sleeps.
pub struct Replay {
    scheduler: Scheduler,
    clock: Option<ManualClock>,
}

impl Replay {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            clock: None,
        }
    }

    pub fn with_manual_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn run(&self, steps: Vec<ReplayStep>) -> Vec<StepReport> {
        info!("Replaying {} steps", steps.len());
        let mut reports = Vec::with_capacity(steps.len());

        for (index, step) in steps.into_iter().enumerate() {
            let name = step.name();
            let outcome = self.apply(step).await;
            debug!("Step {} ({}): {:?}", index, name, outcome);
            reports.push(StepReport {
                index,
                step: name,
                outcome,
                snapshot: self.scheduler.snapshot(),
            });
        }

        reports
    }

    async fn apply(&self, step: ReplayStep) -> StepOutcome {
        let scheduler = &self.scheduler;
        match step {
            ReplayStep::Enqueue {
                instruction,
                timeout_ms,
            } => {
                let instruction = match Instruction::try_from(instruction) {
                    Ok(instruction) => instruction,
                    Err(e) => return StepOutcome::Refused { error: e.to_string() },
                };
                match scheduler.enqueue(instruction, timeout_ms.map(Duration::from_millis)) {
                    Ok(Some(id)) => StepOutcome::Enqueued { id },
                    Ok(None) => StepOutcome::Rejected,
                    Err(e) => StepOutcome::Refused { error: e.to_string() },
                }
            }
            ReplayStep::Complete { response } => StepOutcome::Transitioned {
                id: scheduler.complete_active(response),
            },
            ReplayStep::Cancel { reason } => StepOutcome::Transitioned {
                id: scheduler.cancel_active(reason),
            },
            ReplayStep::Error { message } => StepOutcome::Transitioned {
                id: scheduler.error_active(message),
            },
            ReplayStep::Defer { reason } => StepOutcome::Transitioned {
                id: scheduler.defer_active(reason),
            },
            ReplayStep::Retry { id } => StepOutcome::Applied {
                accepted: scheduler.retry_instruction(id),
            },
            ReplayStep::Resume { id } => StepOutcome::Applied {
                accepted: scheduler.resume_instruction(id),
            },
            ReplayStep::Cleanup => StepOutcome::CleanedUp {
                removed: scheduler.cleanup(),
            },
            ReplayStep::Clear => {
                scheduler.clear();
                StepOutcome::Cleared
            }
            ReplayStep::Wait { ms } => {
                let delay = Duration::from_millis(ms);
                match &self.clock {
                    Some(clock) => clock.advance(delay),
                    None => tokio::time::sleep(delay).await,
                }
                StepOutcome::Waited { ms }
            }
        }
    }
}
