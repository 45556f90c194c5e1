pub mod campaign;
pub mod config;
pub mod engine;
pub mod executor;
pub mod input;
pub mod mutator;
pub mod observer;
pub mod oracle;

pub use campaign::{
    Campaign, CampaignError, CampaignOutcome, CampaignReport, FailurePolicy, Finding, Phase,
};
pub use config::FuzzConfig;
pub use engine::{DerivedInputs, MutatedInput, MutationError, derive_inputs};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecutionResult, ExecutionStatus, Executor,
    ExecutorError, Shell,
};
pub use input::Input;
pub use mutator::{DynamicKind, Mutator, MutatorSet, StaticMutation, StaticMutatorEntry};
pub use observer::{ConsoleObserver, ExecutionRecord, Observer};
pub use oracle::{ExitCodeOracle, Oracle, Verdict};
