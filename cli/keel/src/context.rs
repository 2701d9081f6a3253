//! Per-command context passed explicitly to every flow.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::prompt::Prompter;

/// Progress of a flow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Starting,
    Running,
    Success,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        })
    }
}

/// Shared command context.
#[derive(Clone)]
pub struct CommandContext {
    /// Command name, attached to every progress event.
    pub command: &'static str,
    pub config: Config,
    pub prompter: Arc<dyn Prompter>,
}

impl CommandContext {
    pub fn new(command: &'static str, config: Config, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            command,
            config,
            prompter,
        }
    }

    /// Emit a progress event for `stage`.
    pub fn report(&self, stage: &str, status: Status) {
        match status {
            Status::Failed => error!(command = self.command, stage, status = %status, "Stage failed"),
            _ => info!(command = self.command, stage, status = %status, "Stage progress"),
        }
    }

    /// Ask the operator through the configured prompter.
    pub fn confirm(&self, question: &str, default: bool) -> anyhow::Result<bool> {
        self.prompter.confirm(question, default)
    }
}
