//! Recording process runner for tests
//!
//! Responses are matched by substring against the command line. Each rule
//! replays its outcomes in order and repeats the last one once exhausted.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::process::{ProcessOutcome, ProcessRequest, ProcessRunner};
use crate::common::{Error, Result};

struct Rule {
    needle: String,
    outcomes: VecDeque<MockResponse>,
}

#[derive(Clone)]
enum MockResponse {
    Outcome(ProcessOutcome),
    SpawnError(String),
}

/// A [`ProcessRunner`] that never spawns anything
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ProcessRequest>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `needle` with `outcome`
    pub fn respond(self, needle: &str, outcome: ProcessOutcome) -> Self {
        self.respond_seq(needle, vec![outcome])
    }

    /// Answer successive matching commands with `outcomes` in order
    pub fn respond_seq(self, needle: &str, outcomes: Vec<ProcessOutcome>) -> Self {
        self.push_rule(needle, outcomes.into_iter().map(MockResponse::Outcome).collect())
    }

    /// Fail to spawn commands containing `needle`
    pub fn spawn_error(self, needle: &str, reason: &str) -> Self {
        self.push_rule(needle, VecDeque::from([MockResponse::SpawnError(reason.into())]))
    }

    fn push_rule(self, needle: &str, outcomes: VecDeque<MockResponse>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                needle: needle.to_string(),
                outcomes,
            });
        }
        self
    }

    /// Every request received so far
    pub fn calls(&self) -> Vec<ProcessRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of requests whose command contains `needle`
    pub fn invocations(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|r| r.command.contains(needle))
            .count()
    }

    fn next_response(&self, command: &str) -> MockResponse {
        let Ok(mut rules) = self.rules.lock() else {
            return MockResponse::Outcome(ProcessOutcome::success(""));
        };
        let rule = rules.iter_mut().find(|r| command.contains(&r.needle));
        match rule {
            Some(rule) if rule.outcomes.len() > 1 => rule
                .outcomes
                .pop_front()
                .unwrap_or(MockResponse::Outcome(ProcessOutcome::success(""))),
            Some(rule) => rule
                .outcomes
                .front()
                .cloned()
                .unwrap_or(MockResponse::Outcome(ProcessOutcome::success(""))),
            None => MockResponse::Outcome(ProcessOutcome::success("")),
        }
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutcome> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        match self.next_response(&request.command) {
            MockResponse::SpawnError(reason) => Err(Error::ProcessSpawn {
                command: request.command.clone(),
                reason,
            }),
            MockResponse::Outcome(mut outcome) => {
                // an outcome's duration is simulated, bounded by the timeout
                match request.timeout {
                    Some(limit) if outcome.duration > limit => {
                        tokio::time::sleep(limit).await;
                        outcome.exit_code = None;
                        outcome.timed_out = true;
                        outcome.duration = limit;
                    }
                    _ => tokio::time::sleep(outcome.duration).await,
                }
                Ok(outcome)
            }
        }
    }
}
