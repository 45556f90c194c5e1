use crate::campaign::FailurePolicy;
use crate::executor::{CommandExecutorConfig, Shell};
use crate::mutator::{DynamicKind, StaticMutation, StaticMutatorEntry, default_static_entries};
use anyhow::{Context, bail, ensure};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SEED: &str = r#"<html a="value">...</html>"#;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    #[serde(default = "default_seed")]
    pub seed: String,
    /// Seeds the mutation generator; drawn at random (and logged) when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_accepted_exit_codes")]
    pub accepted_exit_codes: Vec<i32>,
}

fn default_seed() -> String {
    DEFAULT_SEED.to_string()
}

fn default_accepted_exit_codes() -> Vec<i32> {
    vec![0]
}

impl CampaignSettings {
    pub fn resolve_rng_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            rng_seed: None,
            failure_policy: FailurePolicy::default(),
            accepted_exit_codes: default_accepted_exit_codes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Target command relative to `working_dir`; usually given on the command line.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub shell: Shell,
    /// `0` (the default) waits for the target indefinitely.
    #[serde(default)]
    pub timeout_ms: u64,
}

pub fn default_working_dir() -> PathBuf {
    PathBuf::from("./")
}

impl ExecutorSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn command(&self) -> anyhow::Result<&str> {
        match self.command.as_deref() {
            Some(command) if !command.trim().is_empty() => Ok(command),
            _ => bail!("No target command configured"),
        }
    }

    /// Fails unless the command names an existing file under the working directory.
    pub fn ensure_command_exists(&self) -> anyhow::Result<PathBuf> {
        let command = self.command()?;
        let path = self.working_dir.join(command);
        ensure!(path.exists(), "Could not find command '{command}'.");
        Ok(path)
    }

    pub fn to_executor_config(&self) -> anyhow::Result<CommandExecutorConfig> {
        Ok(CommandExecutorConfig {
            command: self.command()?.to_string(),
            shell: self.shell,
            working_dir: Some(self.working_dir.clone()),
            timeout: self.timeout(),
        })
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command: None,
            working_dir: default_working_dir(),
            shell: Shell::default(),
            timeout_ms: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DynamicMutatorSettings {
    /// How many times each kind is instantiated; `0` disables the dynamic set.
    #[serde(default)]
    pub repeat_count: usize,
    #[serde(default = "default_attribute_name")]
    pub attribute_name: String,
    #[serde(default = "default_dynamic_kinds")]
    pub kinds: Vec<DynamicKind>,
}

fn default_attribute_name() -> String {
    "a".to_string()
}

fn default_dynamic_kinds() -> Vec<DynamicKind> {
    DynamicKind::ALL.to_vec()
}

impl Default for DynamicMutatorSettings {
    fn default() -> Self {
        Self {
            repeat_count: 0,
            attribute_name: default_attribute_name(),
            kinds: default_dynamic_kinds(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorSettings {
    #[serde(rename = "static", default = "default_static_entries")]
    pub static_entries: Vec<StaticMutatorEntry>,
    #[serde(default)]
    pub dynamic: DynamicMutatorSettings,
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            static_entries: default_static_entries(),
            dynamic: DynamicMutatorSettings::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzConfig {
    #[serde(default)]
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub mutators: MutatorSettings,
}

impl FuzzConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {path:?}"))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse TOML from config file {path:?}"))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Checks invariants serde cannot express. Does not touch the file system.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.executor.command()?;
        ensure!(
            !self.campaign.accepted_exit_codes.is_empty(),
            "accepted-exit-codes must list at least one code"
        );
        for entry in &self.mutators.static_entries {
            if let StaticMutation::Replace { from, .. } = &entry.mutation {
                ensure!(
                    !from.is_empty(),
                    "static mutator '{}' replaces an empty string",
                    entry.display_name()
                );
            }
        }
        let dynamic = &self.mutators.dynamic;
        if dynamic.repeat_count > 0 && dynamic.kinds.contains(&DynamicKind::AttributeValueLength) {
            ensure!(
                !dynamic.attribute_name.is_empty(),
                "attribute-name must not be empty when attribute-value-length is enabled"
            );
        }
        Ok(())
    }
}
