use crucible_core::engine::aggregator::ResultAggregator;
use crucible_core::engine::controller::RunController;
use crucible_core::model::{
    MetricResult, ResultStatus, RunAttributes, RunStatus, ScoreType, TestConfiguration, TestRun, UnitOutcome,
    UnitProgress, UnitResolution,
};
use crucible_core::storage::{Repository, RunFinalization, Store};
use crucible_core::TenantContext;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

const TOTAL: usize = 5;

fn cfg() -> TestConfiguration {
    let tests: String = (0..TOTAL).map(|i| format!("\n  - {{id: t{i}, prompt: p{i}}}")).collect();
    crucible_core::config::parse_config(&format!("id: st\ntarget: {{name: echo}}\ntests:{tests}\n"), "inline").unwrap()
}

fn fresh_run() -> (RunController, Arc<Store>, TestRun) {
    let store = Arc::new(Store::memory().unwrap());
    store.init_schema().unwrap();
    let controller = RunController::new(store.clone());
    let run = controller
        .create_run(&cfg(), &TenantContext::new("org", "user"), BTreeMap::new())
        .unwrap();
    (controller, store, run)
}

fn finalization(status: RunStatus, current: &TestRun) -> RunFinalization {
    RunFinalization {
        status,
        completed_tests: current.completed_tests,
        failed_tasks: current.failed_tasks,
        skipped_tests: current.skipped_tests,
        attributes: RunAttributes::default(),
        last_error: None,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Progress(UnitProgress),
    Finalize(RunStatus),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop_oneof![
            Just(UnitProgress::Succeeded),
            Just(UnitProgress::Failed),
            Just(UnitProgress::Skipped),
        ]
        .prop_map(Op::Progress),
        prop_oneof![
            Just(RunStatus::Progress),
            Just(RunStatus::Completed),
            Just(RunStatus::Partial),
            Just(RunStatus::Failed),
        ]
        .prop_map(Op::Finalize),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn status_never_leaves_a_terminal_state(ops in prop::collection::vec(op(), 1..40)) {
        let (controller, store, run) = fresh_run();
        let tenant = run.tenant.clone();
        let mut expected = RunStatus::Progress;
        let mut resolved = 0usize;

        for op in ops {
            let current = store.get_run(&tenant, &run.id).unwrap().unwrap();
            match op {
                Op::Progress(p) => {
                    let bumped = store.record_progress(&tenant, &run.id, p).unwrap();
                    let allowed = expected == RunStatus::Progress && resolved < TOTAL;
                    prop_assert_eq!(bumped, allowed);
                    if bumped {
                        resolved += 1;
                    }
                }
                Op::Finalize(to) => {
                    let won = controller.transition(&run, &finalization(to, &current)).unwrap();
                    let allowed = expected == RunStatus::Progress && to.is_terminal();
                    prop_assert_eq!(won, allowed);
                    if won {
                        expected = to;
                    }
                }
            }

            let after = store.get_run(&tenant, &run.id).unwrap().unwrap();
            prop_assert_eq!(after.status, expected);
            prop_assert!(after.resolved_units() as usize <= TOTAL);
            if current.status.is_terminal() {
                prop_assert_eq!(after.status, current.status);
            }
        }
    }
}

fn outcomes() -> Vec<UnitResolution> {
    (0..TOTAL)
        .map(|i| {
            if i == 2 {
                return UnitResolution::Failed {
                    test_case_id: format!("t{i}"),
                    reason: "target invocation failed: timeout".into(),
                };
            }
            let mut metrics = BTreeMap::new();
            metrics.insert(
                "quality".to_string(),
                MetricResult {
                    score: 0.2 * i as f64,
                    is_successful: true,
                    reason: String::new(),
                    threshold_used: Some(0.5),
                    score_type: ScoreType::Numeric,
                    category: None,
                    evaluation_failed: false,
                },
            );
            UnitResolution::Succeeded(UnitOutcome {
                test_case_id: format!("t{i}"),
                status: ResultStatus::Pass,
                execution_time_ms: 100,
                metrics,
            })
        })
        .collect()
}

#[test]
fn fan_in_twice_does_not_double_count() {
    let (controller, _store, run) = fresh_run();
    let aggregator = ResultAggregator::new(controller);
    let outcomes = outcomes();

    let first = aggregator.on_all_complete(&run, &outcomes).unwrap();
    let second = aggregator.on_all_complete(&run, &outcomes).unwrap();

    assert_eq!(first.status, RunStatus::Partial);
    assert_eq!(first.completed_tests, 4);
    assert_eq!(first.failed_tasks, 1);
    assert_eq!(first.completed_tests + first.failed_tasks, first.total_tests);
    // (0.0 + 0.2 + 0.6 + 0.8) / 4
    assert!((first.attributes.aggregated_metrics["quality"] - 0.4).abs() < 1e-9);
    assert_eq!(first, second);
}

#[derive(Clone, Default)]
struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn illegal_transitions_are_logged_not_applied() {
    let writer = CaptureWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (controller, store, run) = fresh_run();
    assert!(!controller.transition(&run, &finalization(RunStatus::Progress, &run)).unwrap());
    assert!(controller.transition(&run, &finalization(RunStatus::Failed, &run)).unwrap());
    assert!(!controller.transition(&run, &finalization(RunStatus::Completed, &run)).unwrap());

    let stored = store.get_run(&run.tenant, &run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);

    let logs = String::from_utf8(writer.buf.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("WARN"), "{logs}");
    assert!(logs.contains("illegal run transition ignored"));
    assert!(logs.contains("run already terminal; transition ignored"));
}
