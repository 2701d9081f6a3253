//! Yes/no questions for the operator.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tracing::info;

use crate::config::Config;

/// Asks the operator to confirm a step.
pub trait Prompter: Send + Sync {
    /// Ask `question`; `default` is the answer to an empty reply.
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;
}

/// Interpret a reply. Empty means `default`, anything unrecognized is
/// `None` so the question is asked again.
pub fn parse_answer(input: &str, default: bool) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Reads answers from stdin.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let stdin = io::stdin();
        loop {
            print!("{question} {hint} ");
            io::stdout().flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                // Closed input.
                return Ok(default);
            }
            if let Some(answer) = parse_answer(&line, default) {
                return Ok(answer);
            }
            println!("Please answer y or n.");
        }
    }
}

/// Answers every question with its default.
#[derive(Debug, Default)]
pub struct DefaultsPrompter;

impl Prompter for DefaultsPrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        info!(question, answer = default, "Using default answer");
        Ok(default)
    }
}

/// Replays canned answers and records the questions asked. Once the
/// answers run out, defaults are used.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(question.to_string());
        Ok(self
            .answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(default))
    }
}

/// Prompter matching the configuration and the `--yes` flag.
pub fn prompter_for(config: &Config, assume_defaults: bool) -> Arc<dyn Prompter> {
    if assume_defaults || config.use_default_option {
        Arc::new(DefaultsPrompter)
    } else {
        Arc::new(TerminalPrompter)
    }
}
