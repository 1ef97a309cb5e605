//! Test suite dispatcher.
//!
//! Turns a suite name plus a device into a concrete command line and
//! launches it under the supervisor. Command construction is pure: the
//! same config, context and device always give the same argv.

mod run;
pub mod template;

pub use run::{SuiteRun, SuiteState};
pub use template::{placeholders, render, render_all, UnresolvedPlaceholder};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{CategoryConfig, DeviceConfig, HarnessConfig, SuiteConfig};
use crate::context::{path_string, RunContext};
use crate::supervisor::{LaunchError, LaunchSpec, Supervisor};
use crate::timeout::{SuiteTimeouts, TimeoutEnforcer};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown suite '{0}'")]
    UnknownSuite(String),

    #[error("suite '{suite}' uses unknown category '{category}'")]
    UnknownCategory { suite: String, category: String },

    #[error("suite '{suite}': {source}")]
    Unresolved {
        suite: String,
        #[source]
        source: UnresolvedPlaceholder,
    },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("suite '{suite}': invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        suite: String,
        from: SuiteState,
        to: SuiteState,
    },
}

/// Fully resolved suite invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandLine {
    pub fn to_launch_spec(&self, label: impl Into<String>) -> LaunchSpec {
        LaunchSpec::new(label, self.argv.clone())
            .current_dir(&self.cwd)
            .envs(self.env.clone())
    }

    pub fn display(&self) -> String {
        self.to_launch_spec("").command_line()
    }
}

/// Build the argv for one suite:
/// `<interpreter...> <category_dir>/<run_script> <options...> <extra_args...>`.
///
/// Options are rendered against `values`; `extra_args` are literal.
/// Environment precedence, lowest first: `base_env`, category, suite.
pub fn build_command(
    suite_name: &str,
    suite: &SuiteConfig,
    category: &CategoryConfig,
    category_dir: &Path,
    values: &BTreeMap<String, String>,
    base_env: &BTreeMap<String, String>,
) -> Result<CommandLine, DispatchError> {
    let options = render_all(&category.options, values).map_err(|source| DispatchError::Unresolved {
        suite: suite_name.to_string(),
        source,
    })?;

    let mut argv = category.interpreter.clone();
    argv.push(path_string(&category_dir.join(&category.run_script)));
    argv.extend(options);
    argv.extend(suite.extra_args.iter().cloned());

    let mut env = base_env.clone();
    env.extend(category.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(suite.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(CommandLine {
        argv,
        cwd: category_dir.to_path_buf(),
        env,
    })
}

/// Resolves and launches suites for one run.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'a> {
    config: &'a HarnessConfig,
    ctx: &'a RunContext,
    timeouts: SuiteTimeouts,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a HarnessConfig, ctx: &'a RunContext, timeouts: SuiteTimeouts) -> Self {
        Self { config, ctx, timeouts }
    }

    /// Run-wide values plus the device's own ports and id.
    pub fn values_for(&self, device: &DeviceConfig) -> BTreeMap<String, String> {
        let mut values = self.ctx.placeholder_values();
        values.insert("device_port".to_string(), device.agent_port1.to_string());
        values.insert("http_port".to_string(), device.http_port.to_string());
        values.insert("ssl_port".to_string(), device.ssl_port.to_string());
        values.insert("console_port".to_string(), device.console_port.to_string());
        values.insert("device_id".to_string(), device.device_id());
        values
    }

    pub fn suite(&self, name: &str) -> Result<(&'a SuiteConfig, &'a CategoryConfig), DispatchError> {
        let suite = self
            .config
            .suites
            .get(name)
            .ok_or_else(|| DispatchError::UnknownSuite(name.to_string()))?;
        let category = self
            .config
            .categories
            .get(&suite.category)
            .ok_or_else(|| DispatchError::UnknownCategory {
                suite: name.to_string(),
                category: suite.category.clone(),
            })?;
        Ok((suite, category))
    }

    pub fn command_for(&self, suite_name: &str, device: &DeviceConfig) -> Result<CommandLine, DispatchError> {
        let (suite, category) = self.suite(suite_name)?;
        build_command(
            suite_name,
            suite,
            category,
            &self.config.category_dir(category),
            &self.values_for(device),
            &self.ctx.child_env,
        )
    }

    /// Launch `suite_name` against the device at `device_index`.
    pub fn trigger(
        &self,
        supervisor: &mut Supervisor,
        suite_name: &str,
        device_index: usize,
        device: &DeviceConfig,
        attempt: u32,
    ) -> Result<SuiteRun, DispatchError> {
        let (suite, _) = self.suite(suite_name)?;
        let command = self.command_for(suite_name, device)?;
        let label = format!("{}@{}", suite_name, device.name);
        let process = supervisor.launch(command.to_launch_spec(&label))?;
        tracing::info!(suite = %suite_name, device = %device.name, attempt, "suite started");

        let timeouts = self.timeouts.with_overrides(suite.timeout_secs, suite.idle_timeout_secs);
        Ok(SuiteRun::new(
            suite_name,
            &suite.category,
            command,
            device_index,
            &device.name,
            process,
            attempt,
            TimeoutEnforcer::new(timeouts),
        ))
    }
}
