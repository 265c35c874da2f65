use super::{ExecutionOutcome, ExecutionRequest, Executor};
use crate::errors::ExecutionError;
use crate::model::Modality;
use crate::providers::target::{extract_response, TargetInput, TargetInvoker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// One invocation, one extracted output.
pub struct SingleTurnExecutor {
    invoker: Arc<dyn TargetInvoker>,
}

impl SingleTurnExecutor {
    pub fn new(invoker: Arc<dyn TargetInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl Executor for SingleTurnExecutor {
    fn modality(&self) -> Modality {
        Modality::SingleTurn
    }

    async fn execute(&self, req: ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutionError> {
        let input = TargetInput {
            prompt: req.test_case.prompt.clone(),
            context: req.test_case.context.clone(),
            conversation: Vec::new(),
            tenant: Some(req.unit.tenant().clone()),
            attempt: req.unit.attempt_count(),
        };

        let start = Instant::now();
        let resp = self
            .invoker
            .invoke(req.target, &input)
            .await
            .map_err(|e| ExecutionError::invocation(&e))?;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        let output = extract_response(&resp, req.target.response_pointer.as_deref())
            .ok_or(ExecutionError::EmptyResponse)?;

        Ok(ExecutionOutcome {
            output,
            execution_time_ms,
            transcript: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionUnit, TargetRef, TestCase};
    use crate::providers::target::fake::FakeInvoker;
    use crate::providers::target::TargetResponse;
    use crate::tenant::TenantContext;

    struct Failing;

    #[async_trait]
    impl TargetInvoker for Failing {
        async fn invoke(&self, _t: &TargetRef, _i: &TargetInput) -> anyhow::Result<TargetResponse> {
            anyhow::bail!("503 upstream unavailable")
        }

        fn kind(&self) -> &'static str {
            "failing"
        }
    }

    fn fixtures() -> (ExecutionUnit, TestCase, TargetRef) {
        let unit = ExecutionUnit::new("run", "t1", TenantContext::new("org", "user"));
        let tc = TestCase {
            id: "t1".into(),
            prompt: "capital of France?".into(),
            context: vec![],
            expected_output: Some("Paris".into()),
            metrics: vec![],
            modality: None,
            conversation: None,
            tags: vec![],
        };
        let target = TargetRef {
            name: "fake".into(),
            kind: "fake".into(),
            endpoint: None,
            response_pointer: None,
            headers: Default::default(),
        };
        (unit, tc, target)
    }

    #[tokio::test]
    async fn returns_extracted_output() {
        let (unit, tc, target) = fixtures();
        let exec = SingleTurnExecutor::new(Arc::new(FakeInvoker::echo().with_response("Paris")));
        let out = exec
            .execute(ExecutionRequest {
                unit: &unit,
                test_case: &tc,
                target: &target,
            })
            .await
            .unwrap();
        assert_eq!(out.output, "Paris");
        assert!(out.transcript.is_empty());
    }

    #[tokio::test]
    async fn wraps_invocation_failure() {
        let (unit, tc, target) = fixtures();
        let exec = SingleTurnExecutor::new(Arc::new(Failing));
        let err = exec
            .execute(ExecutionRequest {
                unit: &unit,
                test_case: &tc,
                target: &target,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Invocation { ref detail } if detail.contains("503")));
    }

    #[tokio::test]
    async fn blank_output_is_empty_response() {
        let (unit, tc, target) = fixtures();
        let exec = SingleTurnExecutor::new(Arc::new(FakeInvoker::echo().with_response("  ")));
        let err = exec
            .execute(ExecutionRequest {
                unit: &unit,
                test_case: &tc,
                target: &target,
            })
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::EmptyResponse);
    }
}
