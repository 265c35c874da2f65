//! Executor strategy selection.
//!
//! One executor per [`Modality`]. The selector is a closed match over the
//! modality enum, so adding a modality means adding a variant and one arm here.

mod multi_turn;
mod single_turn;

pub use multi_turn::{MultiTurnExecutor, DEFAULT_MAX_TURNS};
pub use single_turn::SingleTurnExecutor;

use crate::errors::ExecutionError;
use crate::model::{ConversationTurn, ExecutionUnit, Modality, TargetRef, TestCase};
use crate::providers::agent::ConversationAgent;
use crate::providers::target::TargetInvoker;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything one attempt needs. Borrowed, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub unit: &'a ExecutionUnit,
    pub test_case: &'a TestCase,
    pub target: &'a TargetRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub execution_time_ms: u64,
    /// Conversation trace; empty for single-turn.
    pub transcript: Vec<ConversationTurn>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn modality(&self) -> Modality;

    /// Runs one attempt. Retrying is the caller's job.
    async fn execute(&self, req: ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutionError>;
}

#[derive(Clone)]
pub struct ExecutorSelector {
    single_turn: Arc<SingleTurnExecutor>,
    multi_turn: Arc<MultiTurnExecutor>,
}

impl ExecutorSelector {
    pub fn new(invoker: Arc<dyn TargetInvoker>, agent: Arc<dyn ConversationAgent>) -> Self {
        Self {
            single_turn: Arc::new(SingleTurnExecutor::new(invoker.clone())),
            multi_turn: Arc::new(MultiTurnExecutor::new(invoker, agent)),
        }
    }

    pub fn select(&self, tc: &TestCase) -> Arc<dyn Executor> {
        match tc.modality() {
            Modality::SingleTurn => self.single_turn.clone(),
            Modality::MultiTurn => self.multi_turn.clone(),
        }
    }
}
