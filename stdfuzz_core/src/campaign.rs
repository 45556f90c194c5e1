use crate::config::FuzzConfig;
use crate::engine::{DerivedInputs, MutationError};
use crate::executor::{CommandExecutor, ExecutionStatus, Executor, ExecutorError};
use crate::mutator::MutatorSet;
use crate::observer::{ExecutionRecord, Observer};
use crate::oracle::{ExitCodeOracle, Oracle, Verdict};
use log::{debug, error, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::ControlFlow;
use thiserror::Error;

/// What a non-accepted verdict does to the rest of the campaign.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop at the first rejected or timed-out input.
    #[default]
    Halt,
    /// Record every finding and keep going.
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Static,
    Dynamic,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Static => "static",
            Phase::Dynamic => "dynamic",
        })
    }
}

/// How a campaign that did not error out ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignOutcome {
    Completed,
    HaltedOnFailure,
}

/// A non-accepted execution, kept for the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub phase: Phase,
    pub position: usize,
    /// `None` for the seed itself.
    pub mutator: Option<String>,
    pub input: String,
    /// MD5 hex digest of the input bytes.
    pub input_hash: String,
    pub verdict: Verdict,
    pub status: ExecutionStatus,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignReport {
    /// Replaying with this value derives the same dynamic inputs.
    pub rng_seed: u64,
    pub executions: usize,
    pub outcome: CampaignOutcome,
    pub findings: Vec<Finding>,
}

impl CampaignReport {
    fn new(rng_seed: u64) -> Self {
        Self {
            rng_seed,
            executions: 0,
            outcome: CampaignOutcome::Completed,
            findings: Vec::new(),
        }
    }

    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("Error while executing {phase} input #{position}: {source}")]
    Execution {
        phase: Phase,
        position: usize,
        #[source]
        source: ExecutorError,
    },
    #[error("Observer '{observer}' failed: {source}")]
    Observer {
        observer: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Executes, judges, reports and records single inputs.
struct InputRunner<E, O> {
    executor: E,
    oracle: O,
    policy: FailurePolicy,
    observers: Vec<Box<dyn Observer>>,
}

impl<E, O> InputRunner<E, O>
where
    E: Executor<String>,
    O: Oracle<String>,
{
    fn notify<F>(&mut self, mut event: F) -> Result<(), CampaignError>
    where
        F: FnMut(&mut dyn Observer) -> Result<(), anyhow::Error>,
    {
        for observer in self.observers.iter_mut() {
            event(observer.as_mut()).map_err(|source| CampaignError::Observer {
                observer: observer.name(),
                source,
            })?;
        }
        Ok(())
    }

    fn run_input(
        &mut self,
        report: &mut CampaignReport,
        phase: Phase,
        position: usize,
        mutator: Option<&str>,
        input: String,
    ) -> Result<ControlFlow<()>, CampaignError> {
        let result = self
            .executor
            .execute(&input)
            .map_err(|source| CampaignError::Execution {
                phase,
                position,
                source,
            })?;
        report.executions += 1;

        let verdict = self.oracle.judge(&input, &result);
        debug!(
            "{phase} #{position} ({}) -> {} in {:?}",
            mutator.unwrap_or("seed"),
            result.status,
            result.elapsed
        );

        let record = ExecutionRecord {
            phase,
            position,
            mutator,
            input: &input,
            result: &result,
            verdict,
        };
        self.notify(|observer| observer.on_execution(&record))?;

        if verdict.is_accepted() {
            return Ok(ControlFlow::Continue(()));
        }

        warn!(
            "Target {verdict} {phase} input #{position} ({})",
            mutator.unwrap_or("seed")
        );
        let input_hash = format!("{:x}", md5::compute(input.as_bytes()));
        report.findings.push(Finding {
            phase,
            position,
            mutator: mutator.map(str::to_string),
            input,
            input_hash,
            verdict,
            status: result.status,
            output: result.output,
        });

        match self.policy {
            FailurePolicy::Halt => {
                match result.status {
                    ExecutionStatus::Exited(_) => {
                        error!("Error: Command exited with non-zero exit code")
                    }
                    status => error!("Error: Command failed ({status})"),
                }
                Ok(ControlFlow::Break(()))
            }
            FailurePolicy::Record => Ok(ControlFlow::Continue(())),
        }
    }
}

/// One full run over the seed and every derived input.
///
/// The static phase runs the seed and then each static mutator's output; the
/// dynamic phase does the same with the dynamic set. Inputs are derived lazily
/// and executed one at a time.
pub struct Campaign<E, O> {
    seed: String,
    static_mutators: MutatorSet,
    dynamic_mutators: MutatorSet,
    rng: ChaCha8Rng,
    rng_seed: u64,
    runner: InputRunner<E, O>,
}

impl<E, O> Campaign<E, O>
where
    E: Executor<String>,
    O: Oracle<String>,
{
    pub fn new(seed: impl Into<String>, executor: E, oracle: O, rng_seed: u64) -> Self {
        Self {
            seed: seed.into(),
            static_mutators: MutatorSet::new(),
            dynamic_mutators: MutatorSet::new(),
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
            rng_seed,
            runner: InputRunner {
                executor,
                oracle,
                policy: FailurePolicy::default(),
                observers: Vec::new(),
            },
        }
    }

    pub fn with_static_mutators(mut self, mutators: MutatorSet) -> Self {
        self.static_mutators = mutators;
        self
    }

    pub fn with_dynamic_mutators(mut self, mutators: MutatorSet) -> Self {
        self.dynamic_mutators = mutators;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.runner.policy = policy;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.runner.observers.push(observer);
    }

    fn run_phase(
        &mut self,
        phase: Phase,
        report: &mut CampaignReport,
    ) -> Result<ControlFlow<()>, CampaignError> {
        let mutators = match phase {
            Phase::Static => &self.static_mutators,
            Phase::Dynamic => &self.dynamic_mutators,
        };
        let mutated_count = mutators.len();
        info!("Starting {phase} phase: seed + {mutated_count} mutated inputs");
        self.runner
            .notify(|observer| observer.on_phase_start(phase, mutated_count + 1))?;

        let seed = self.seed.clone();
        if self
            .runner
            .run_input(report, phase, 0, None, seed)?
            .is_break()
        {
            return Ok(ControlFlow::Break(()));
        }

        for mutated in DerivedInputs::new(&self.seed, mutators, &mut self.rng) {
            let mutated = mutated?;
            let flow = self.runner.run_input(
                report,
                phase,
                mutated.mutator_index + 1,
                Some(mutated.mutator_name.as_str()),
                mutated.value,
            )?;
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Runs the static phase, then the dynamic phase.
    ///
    /// Consumes the campaign: there is no resumption after a halt.
    pub fn run(mut self) -> Result<CampaignReport, CampaignError> {
        info!(
            "Campaign starting with rng seed {} ({} static, {} dynamic mutators, policy {:?})",
            self.rng_seed,
            self.static_mutators.len(),
            self.dynamic_mutators.len(),
            self.runner.policy
        );
        let mut report = CampaignReport::new(self.rng_seed);

        for phase in [Phase::Static, Phase::Dynamic] {
            if self.run_phase(phase, &mut report)?.is_break() {
                report.outcome = CampaignOutcome::HaltedOnFailure;
                break;
            }
        }

        info!(
            "Campaign {:?} after {} executions with {} findings",
            report.outcome,
            report.executions,
            report.findings.len()
        );
        self.runner.notify(|observer| observer.on_finish(&report))?;
        Ok(report)
    }
}

impl Campaign<CommandExecutor, ExitCodeOracle> {
    /// Builds a campaign against an external command from a validated config.
    pub fn from_config(config: &FuzzConfig) -> anyhow::Result<Self> {
        let executor = CommandExecutor::new(config.executor.to_executor_config()?);
        let oracle =
            ExitCodeOracle::with_accepted_codes(config.campaign.accepted_exit_codes.clone());
        let rng_seed = config.campaign.resolve_rng_seed();

        let dynamic = &config.mutators.dynamic;
        let campaign = Campaign::new(config.campaign.seed.clone(), executor, oracle, rng_seed)
            .with_static_mutators(MutatorSet::from_static(&config.mutators.static_entries))
            .with_dynamic_mutators(MutatorSet::from_dynamic(
                &dynamic.kinds,
                dynamic.repeat_count,
                &dynamic.attribute_name,
            ))
            .with_failure_policy(config.campaign.failure_policy);
        Ok(campaign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use crate::mutator::{
        DynamicKind, FnMutator, StaticMutation, StaticMutatorEntry, default_static_entries,
    };
    use rand_core::RngCore;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    const SEED: &str = r#"<html a="value">...</html>"#;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Echoes the input back and exits with whatever `exit_code_for` says.
    struct ScriptedExecutor {
        seen: Log,
        exit_code_for: fn(&str) -> ExecutionStatus,
    }

    impl ScriptedExecutor {
        fn new(exit_code_for: fn(&str) -> ExecutionStatus) -> (Self, Log) {
            let seen = Log::default();
            (
                Self {
                    seen: seen.clone(),
                    exit_code_for,
                },
                seen,
            )
        }
    }

    impl Executor<String> for ScriptedExecutor {
        fn execute(&mut self, input: &String) -> Result<ExecutionResult, ExecutorError> {
            self.seen.borrow_mut().push(input.clone());
            Ok(ExecutionResult {
                status: (self.exit_code_for)(input),
                output: input.clone(),
                elapsed: Duration::from_millis(1),
            })
        }
    }

    struct FailingExecutor;

    impl Executor<String> for FailingExecutor {
        fn execute(&mut self, _input: &String) -> Result<ExecutionResult, ExecutorError> {
            Err(ExecutorError::StdinWrite(std::io::Error::other("pipe exploded")))
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Log,
    }

    impl Observer for RecordingObserver {
        fn name(&self) -> &'static str {
            "RecordingObserver"
        }

        fn on_phase_start(&mut self, phase: Phase, inputs: usize) -> Result<(), anyhow::Error> {
            self.events.borrow_mut().push(format!("start {phase} {inputs}"));
            Ok(())
        }

        fn on_execution(&mut self, record: &ExecutionRecord<'_>) -> Result<(), anyhow::Error> {
            self.events.borrow_mut().push(format!(
                "{} #{} {} {}",
                record.phase, record.position, record.verdict, record.result.output
            ));
            Ok(())
        }

        fn on_finish(&mut self, report: &CampaignReport) -> Result<(), anyhow::Error> {
            self.events
                .borrow_mut()
                .push(format!("finish {:?}", report.outcome));
            Ok(())
        }
    }

    fn accept_all(_input: &str) -> ExecutionStatus {
        ExecutionStatus::Exited(0)
    }

    fn reject_all(_input: &str) -> ExecutionStatus {
        ExecutionStatus::Exited(2)
    }

    fn static_set() -> MutatorSet {
        MutatorSet::from_static(&default_static_entries())
    }

    #[test]
    fn static_phase_runs_seed_then_mutators_in_order() {
        let (executor, seen) = ScriptedExecutor::new(accept_all);
        let campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_static_mutators(static_set());

        let report = campaign.run().unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![
                SEED.to_string(),
                r#"a a="value">...</html>"#.to_string(),
                r#" a="value">...</html>"#.to_string(),
                SEED.to_string(),
            ]
        );
        assert_eq!(report.executions, 4);
        assert_eq!(report.outcome, CampaignOutcome::Completed);
        assert!(!report.has_findings());
    }

    #[test]
    fn zero_repeat_dynamic_phase_runs_only_the_seed() {
        let (executor, seen) = ScriptedExecutor::new(accept_all);
        let campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_dynamic_mutators(MutatorSet::from_dynamic(&DynamicKind::ALL, 0, "a"));

        campaign.run().unwrap();
        assert_eq!(*seen.borrow(), vec![SEED.to_string(), SEED.to_string()]);
    }

    #[test]
    fn dynamic_phase_runs_every_derived_input() {
        let (executor, seen) = ScriptedExecutor::new(accept_all);
        let campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 9)
            .with_dynamic_mutators(MutatorSet::from_dynamic(&DynamicKind::ALL, 2, "a"));

        let report = campaign.run().unwrap();
        assert_eq!(report.executions, 1 + 1 + 12);
        assert_eq!(seen.borrow().len(), 14);
        assert_eq!(report.rng_seed, 9);
    }

    #[test]
    fn unconfigured_campaign_stops_at_first_rejection() {
        let (executor, seen) = ScriptedExecutor::new(reject_all);
        let report = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_static_mutators(static_set())
            .run()
            .unwrap();

        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(report.outcome, CampaignOutcome::HaltedOnFailure);
    }

    #[test]
    fn halt_policy_stops_at_first_rejection() {
        let (executor, seen) = ScriptedExecutor::new(reject_all);
        let campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_static_mutators(static_set())
            .with_failure_policy(FailurePolicy::Halt);

        let report = campaign.run().unwrap();
        assert_eq!(*seen.borrow(), vec![SEED.to_string()]);
        assert_eq!(report.outcome, CampaignOutcome::HaltedOnFailure);
        assert_eq!(report.findings.len(), 1);

        let finding = &report.findings[0];
        assert_eq!(finding.phase, Phase::Static);
        assert_eq!(finding.position, 0);
        assert_eq!(finding.mutator, None);
        assert_eq!(finding.status, ExecutionStatus::Exited(2));
        assert_eq!(finding.verdict, Verdict::Rejected);
        assert_eq!(finding.input_hash, format!("{:x}", md5::compute(SEED)));
    }

    #[test]
    fn halt_policy_skips_dynamic_phase_after_static_rejection() {
        let (executor, seen) = ScriptedExecutor::new(|input| {
            if input.starts_with("a ") {
                ExecutionStatus::Exited(1)
            } else {
                ExecutionStatus::Exited(0)
            }
        });
        let campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_static_mutators(static_set())
            .with_dynamic_mutators(MutatorSet::from_dynamic(&DynamicKind::ALL, 1, "a"))
            .with_failure_policy(FailurePolicy::Halt);

        let report = campaign.run().unwrap();
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(report.findings[0].position, 1);
        assert_eq!(
            report.findings[0].mutator.as_deref(),
            Some(r#"replace("<html" -> "a")"#)
        );
    }

    #[test]
    fn record_policy_collects_every_rejection_and_finishes() {
        let (executor, seen) = ScriptedExecutor::new(reject_all);
        let campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_static_mutators(static_set())
            .with_failure_policy(FailurePolicy::Record);

        let report = campaign.run().unwrap();
        assert_eq!(seen.borrow().len(), 4);
        assert_eq!(report.outcome, CampaignOutcome::Completed);
        assert_eq!(report.findings.len(), 4);
        assert!(report.findings.iter().all(|f| f.verdict == Verdict::Rejected));
        assert_eq!(report.findings[3].phase, Phase::Dynamic);
    }

    #[test]
    fn timeouts_are_findings() {
        let (executor, _seen) = ScriptedExecutor::new(|_| ExecutionStatus::TimedOut);
        let campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_failure_policy(FailurePolicy::Halt);

        let report = campaign.run().unwrap();
        assert_eq!(report.outcome, CampaignOutcome::HaltedOnFailure);
        assert_eq!(report.findings[0].verdict, Verdict::TimedOut);
    }

    #[test]
    fn observers_see_every_execution_including_the_halting_one() {
        let (executor, _seen) = ScriptedExecutor::new(|input| {
            if input.starts_with(' ') {
                ExecutionStatus::Exited(3)
            } else {
                ExecutionStatus::Exited(0)
            }
        });
        let observer = RecordingObserver::default();
        let events = observer.events.clone();
        let mut campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1)
            .with_static_mutators(static_set())
            .with_failure_policy(FailurePolicy::Halt);
        campaign.add_observer(Box::new(observer));

        campaign.run().unwrap();
        assert_eq!(
            *events.borrow(),
            vec![
                "start static 3".to_string(),
                format!("static #0 accepted {SEED}"),
                r#"static #1 accepted a a="value">...</html>"#.to_string(),
                r#"static #2 rejected  a="value">...</html>"#.to_string(),
                "finish HaltedOnFailure".to_string(),
            ]
        );
    }

    #[test]
    fn executor_failure_aborts_campaign() {
        let campaign = Campaign::new(SEED, FailingExecutor, ExitCodeOracle::new(), 1);
        match campaign.run() {
            Err(CampaignError::Execution {
                phase, position, ..
            }) => {
                assert_eq!(phase, Phase::Static);
                assert_eq!(position, 0);
            }
            other => panic!("Expected execution error, got {other:?}"),
        }
    }

    #[test]
    fn mutator_failure_aborts_campaign() {
        let (executor, seen) = ScriptedExecutor::new(accept_all);
        let mut broken = MutatorSet::new();
        broken.push(Box::new(FnMutator::new(
            "broken",
            |_input: &str, _rng: &mut dyn RngCore| Err(anyhow::anyhow!("no can do")),
        )));
        let campaign =
            Campaign::new(SEED, executor, ExitCodeOracle::new(), 1).with_static_mutators(broken);

        let err = campaign.run().unwrap_err();
        assert!(matches!(err, CampaignError::Mutation(_)));
        assert!(err.to_string().contains("no can do"));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn failing_observer_aborts_campaign() {
        struct Grumpy;
        impl Observer for Grumpy {
            fn name(&self) -> &'static str {
                "Grumpy"
            }
            fn on_execution(&mut self, _record: &ExecutionRecord<'_>) -> Result<(), anyhow::Error> {
                Err(anyhow::anyhow!("stdout closed"))
            }
        }

        let (executor, _seen) = ScriptedExecutor::new(accept_all);
        let mut campaign = Campaign::new(SEED, executor, ExitCodeOracle::new(), 1);
        campaign.add_observer(Box::new(Grumpy));

        match campaign.run() {
            Err(CampaignError::Observer { observer, .. }) => assert_eq!(observer, "Grumpy"),
            other => panic!("Expected observer error, got {other:?}"),
        }
    }

    #[test]
    fn same_rng_seed_replays_the_same_inputs() {
        let run = || {
            let (executor, seen) = ScriptedExecutor::new(accept_all);
            Campaign::new(SEED, executor, ExitCodeOracle::new(), 1234)
                .with_dynamic_mutators(MutatorSet::from_dynamic(&DynamicKind::ALL, 3, "a"))
                .run()
                .unwrap();
            seen.take()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn from_config_wires_mutators_and_policy() {
        let mut config = FuzzConfig::default();
        config.executor.command = Some("cat".into());
        config.campaign.rng_seed = Some(5);
        config.campaign.failure_policy = FailurePolicy::Record;
        config.mutators.static_entries = vec![
            StaticMutatorEntry::new(StaticMutation::Reverse),
            StaticMutatorEntry::new(StaticMutation::Uppercase),
        ];
        config.mutators.dynamic.repeat_count = 2;

        let campaign = Campaign::from_config(&config).unwrap();
        assert_eq!(campaign.static_mutators.names(), vec!["reverse", "uppercase"]);
        assert_eq!(campaign.dynamic_mutators.len(), 12);
        assert_eq!(campaign.rng_seed, 5);
        assert_eq!(campaign.runner.policy, FailurePolicy::Record);
        assert_eq!(campaign.runner.executor.config().command, "cat");
    }

    #[test]
    fn report_serializes_to_json() {
        let (executor, _seen) = ScriptedExecutor::new(reject_all);
        let report = Campaign::new("<a>", executor, ExitCodeOracle::new(), 77)
            .with_failure_policy(FailurePolicy::Halt)
            .run()
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rng_seed"], 77);
        assert_eq!(json["outcome"], "halted-on-failure");
        assert_eq!(json["findings"][0]["verdict"], "rejected");
        assert_eq!(json["findings"][0]["status"]["kind"], "exited");
        assert_eq!(json["findings"][0]["status"]["value"], 2);
    }
}
