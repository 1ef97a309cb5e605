//! Harness configuration.
//!
//! One TOML file describes the devices, the suite categories and suites,
//! the artifact under test and the timing constants. It is parsed with
//! serde and validated once at startup; everything downstream works with
//! the validated value.

mod timing;

pub use timing::{Timing, TimingConfig};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use emu_classifier::{Classifier, ClassifierError, ExitPolicy, RuleSpec};
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub paths: PathsConfig,

    #[serde(default)]
    pub emulator: EmulatorConfig,

    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,

    #[serde(default, rename = "category")]
    pub categories: BTreeMap<String, CategoryConfig>,

    #[serde(default, rename = "suite")]
    pub suites: BTreeMap<String, SuiteConfig>,

    /// Suites to run, in device order.
    #[serde(default)]
    pub test_suites: Vec<String>,

    /// Auxiliary packages installed alongside the main artifact.
    #[serde(default, rename = "package")]
    pub packages: BTreeMap<String, PackageConfig>,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub classifier: ClassifierSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root under which tests are unpacked.
    pub work_dir: PathBuf,

    /// Blob upload directory; logs, logcat and summaries land here.
    pub upload_dir: PathBuf,

    /// Artifact under test.
    pub installer_path: PathBuf,

    /// Host utilities; `xre` and `bin` subdirectories are used.
    #[serde(default)]
    pub xre_dir: Option<PathBuf>,

    #[serde(default)]
    pub modules_dir: Option<PathBuf>,

    #[serde(default)]
    pub symbols_path: Option<String>,

    #[serde(default)]
    pub minidump_stackwalk: Option<PathBuf>,

    /// Installed package name. Read from `package_name_file` when unset.
    #[serde(default)]
    pub package_name: Option<String>,

    /// Defaults to `<work_dir>/package-name.txt`.
    #[serde(default)]
    pub package_name_file: Option<PathBuf>,

    #[serde(default = "default_remote_webserver")]
    pub remote_webserver: String,

    #[serde(default = "default_localhost")]
    pub device_ip: String,

    /// Host where emulator consoles and forwarded agent ports listen.
    #[serde(default = "default_localhost")]
    pub console_host: String,
}

fn default_remote_webserver() -> String {
    "10.0.2.2".to_string()
}

fn default_localhost() -> String {
    "127.0.0.1".to_string()
}

/// How emulators are started, probed and fed packages.
///
/// Command templates accept `{name}`, `{console_port}` and `{device_id}`;
/// the install template also accepts `{package}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub command: Vec<String>,
    /// Command-name fragment swept from the process table at teardown.
    pub process_name: Option<String>,
    pub install_command: Vec<String>,
    /// Empty disables the post-startup shell check.
    pub health_command: Vec<String>,
    /// Empty disables per-device log capture.
    pub logcat_command: Vec<String>,
    /// Agent ports inside the device.
    pub device_agent_port1: u16,
    pub device_agent_port2: u16,
    /// Treat an unreachable agent as a startup failure.
    pub require_agent_health: bool,
    pub env: BTreeMap<String, String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            command: argv(&[
                "emulator", "-avd", "{name}", "-port", "{console_port}", "-qemu", "-m", "1024", "-enable-kvm",
            ]),
            process_name: None,
            install_command: argv(&["adb", "-s", "{device_id}", "install", "-r", "{package}"]),
            health_command: argv(&["adb", "-s", "{device_id}", "shell", "ps"]),
            logcat_command: argv(&[
                "adb", "-s", "{device_id}", "logcat", "-v", "time", "Trace:S", "StrictMode:S", "ExchangeService:S",
            ]),
            device_agent_port1: 20701,
            device_agent_port2: 20700,
            require_agent_health: false,
            env: BTreeMap::new(),
        }
    }
}

/// One emulator slot with its statically assigned ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub console_port: u16,
    pub agent_port1: u16,
    pub agent_port2: u16,
    pub http_port: u16,
    pub ssl_port: u16,
    /// Defaults to `emulator-<console_port>`.
    #[serde(default)]
    pub device_id: Option<String>,
}

impl DeviceConfig {
    pub fn device_id(&self) -> String {
        self.device_id
            .clone()
            .unwrap_or_else(|| format!("emulator-{}", self.console_port))
    }

    fn ports(&self) -> [(&'static str, u16); 5] {
        [
            ("console_port", self.console_port),
            ("agent_port1", self.agent_port1),
            ("agent_port2", self.agent_port2),
            ("http_port", self.http_port),
            ("ssl_port", self.ssl_port),
        ]
    }
}

/// A family of suites sharing one runner script and option list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Relative paths are resolved against `paths.work_dir`.
    pub test_dir: PathBuf,
    pub run_script: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
    /// Option templates with `{placeholder}` names.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_interpreter() -> Vec<String> {
    vec!["python".to_string(), "-u".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub category: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Auxiliary packages this suite cannot run without.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Output marker that asks for the suite to be run again.
    #[serde(default)]
    pub rerun_on: Option<String>,
    /// Runs allowed when a rerun is requested; see [`SuiteConfig::run_limit`].
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub idle_timeout_secs: Option<f64>,
}

/// Marionette reruns when the artifact fails to install on the device.
const MARIONETTE_MAX_RUNS: u32 = 5;

impl SuiteConfig {
    /// Configured `max_runs`, else 5 for marionette and 1 for the rest.
    pub fn run_limit(&self) -> u32 {
        self.max_runs.unwrap_or(if self.category == "marionette" { MARIONETTE_MAX_RUNS } else { 1 })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    pub path: PathBuf,
    /// Install on every device, not only where a suite requires it.
    #[serde(default)]
    pub always: bool,
}

/// `[classifier]` table: exit-code policy plus per-category custom rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(flatten)]
    pub policy: ExitPolicy,
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<RuleSpec>>,
}

impl ClassifierSettings {
    pub fn build(&self) -> Result<Classifier, ConfigError> {
        let mut classifier = Classifier::new(self.policy);
        for (category, specs) in &self.rules {
            classifier
                .extend_category(category, specs)
                .map_err(|source| ConfigError::InvalidRule {
                    category: category.clone(),
                    source,
                })?;
        }
        Ok(classifier)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no devices configured")]
    NoDevices,

    #[error("duplicate device name: '{0}'")]
    DuplicateDevice(String),

    #[error("port {port} is assigned to both {first} and {second}")]
    PortConflict { port: u16, first: String, second: String },

    #[error("device '{device}': {field} cannot be 0")]
    ZeroPort { device: String, field: String },

    #[error("no test suites selected")]
    NoSuites,

    #[error("suite '{0}' is selected but not defined")]
    UnknownSuite(String),

    #[error("suite '{suite}' selected more than once")]
    DuplicateSuite { suite: String },

    #[error("suite '{suite}' uses undefined category '{category}'")]
    UnknownCategory { suite: String, category: String },

    #[error("suite '{suite}' requires undefined package '{package}'")]
    UnknownPackage { suite: String, package: String },

    #[error("{suites} suites selected but only {devices} devices configured")]
    TooManySuites { suites: usize, devices: usize },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("invalid classifier rule for category '{category}': {source}")]
    InvalidRule {
        category: String,
        #[source]
        source: ClassifierError,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl HarnessConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the selected suites (command-line override).
    pub fn select_suites(&mut self, suites: Vec<String>) -> Result<(), ConfigError> {
        self.test_suites = suites;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_devices()?;
        self.validate_suites()?;
        self.validate_commands()?;
        self.timing.validate()?;
        self.classifier.build()?;
        Ok(())
    }

    fn validate_devices(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        let mut names = HashSet::new();
        let mut owners: HashMap<u16, String> = HashMap::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(ConfigError::invalid("device.name", "cannot be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
            for (field, port) in device.ports() {
                if port == 0 {
                    return Err(ConfigError::ZeroPort {
                        device: device.name.clone(),
                        field: field.to_string(),
                    });
                }
                let owner = format!("{}.{}", device.name, field);
                if let Some(first) = owners.insert(port, owner.clone()) {
                    return Err(ConfigError::PortConflict {
                        port,
                        first,
                        second: owner,
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_suites(&self) -> Result<(), ConfigError> {
        if self.test_suites.is_empty() {
            return Err(ConfigError::NoSuites);
        }
        let mut seen = HashSet::new();
        for name in &self.test_suites {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateSuite { suite: name.clone() });
            }
            let suite = self
                .suites
                .get(name)
                .ok_or_else(|| ConfigError::UnknownSuite(name.clone()))?;
            if !self.categories.contains_key(&suite.category) {
                return Err(ConfigError::UnknownCategory {
                    suite: name.clone(),
                    category: suite.category.clone(),
                });
            }
            if let Some(package) = suite.requires.iter().find(|p| !self.packages.contains_key(*p)) {
                return Err(ConfigError::UnknownPackage {
                    suite: name.clone(),
                    package: package.clone(),
                });
            }
            if suite.max_runs == Some(0) {
                return Err(ConfigError::invalid(format!("suite.{}.max_runs", name), "must be at least 1"));
            }
            for (field, value) in [("timeout_secs", suite.timeout_secs), ("idle_timeout_secs", suite.idle_timeout_secs)] {
                if let Some(secs) = value {
                    if !secs.is_finite() || secs <= 0.0 {
                        return Err(ConfigError::invalid(
                            format!("suite.{}.{}", name, field),
                            "must be a positive number of seconds",
                        ));
                    }
                }
            }
        }
        if self.test_suites.len() > self.devices.len() {
            return Err(ConfigError::TooManySuites {
                suites: self.test_suites.len(),
                devices: self.devices.len(),
            });
        }
        Ok(())
    }

    fn validate_commands(&self) -> Result<(), ConfigError> {
        if self.emulator.command.is_empty() {
            return Err(ConfigError::invalid("emulator.command", "cannot be empty"));
        }
        if self.emulator.install_command.is_empty() {
            return Err(ConfigError::invalid("emulator.install_command", "cannot be empty"));
        }
        for (name, category) in &self.categories {
            if category.run_script.is_empty() {
                return Err(ConfigError::invalid(format!("category.{}.run_script", name), "cannot be empty"));
            }
        }
        Ok(())
    }

    /// Devices bound to the selected suites, in order.
    pub fn bound_devices(&self) -> &[DeviceConfig] {
        let n = self.test_suites.len().min(self.devices.len());
        &self.devices[..n]
    }

    /// Category directory, resolved against the work dir.
    pub fn category_dir(&self, category: &CategoryConfig) -> PathBuf {
        if category.test_dir.is_absolute() {
            category.test_dir.clone()
        } else {
            self.paths.work_dir.join(&category.test_dir)
        }
    }

    /// Resolve a path relative to the work dir.
    pub fn work_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.work_dir.join(path)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
test_suites = ["mochitest-1", "robocop-1"]

[paths]
work_dir = "/builds/work"
upload_dir = "/builds/upload"
installer_path = "fennec.apk"
xre_dir = "/builds/hostutils"
package_name = "org.mozilla.fennec"

[emulator]
process_name = "emulator64-arm"

[[device]]
name = "emulator-1"
console_port = 5554
agent_port1 = 20701
agent_port2 = 20700
http_port = 8854
ssl_port = 4454

[[device]]
name = "emulator-2"
console_port = 5556
agent_port1 = 20703
agent_port2 = 20702
http_port = 8856
ssl_port = 4456

[category.mochitest]
test_dir = "tests/mochitest"
run_script = "runtestsremote.py"
options = ["--deviceIP={device_ip}", "--devicePort={device_port}", "--http-port={http_port}"]

[category.robocop]
test_dir = "tests/mochitest"
run_script = "runtestsremote.py"
options = ["--robocop-ini={app}", "--deviceIP={device_ip}"]

[suite.mochitest-1]
category = "mochitest"
extra_args = ["--total-chunks=16", "--this-chunk=1"]

[suite.robocop-1]
category = "robocop"
requires = ["robocop"]

[package.robocop]
path = "robocop.apk"

[timing]
poll_interval_secs = 0.5

[classifier]
tests_failed_code = 10

[[classifier.rules.xpcshell]]
pattern = "LEAKED"
tally = "fail"
severity = "warning"
"#;

    #[test]
    fn test_parse_sample() {
        let config = HarnessConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].device_id(), "emulator-5554");
        assert_eq!(config.suites["mochitest-1"].run_limit(), 1);
        assert_eq!(config.timing.poll_interval_secs, 0.5);
        assert_eq!(config.timing.redirect_attempts, 5);
        assert_eq!(config.emulator.device_agent_port1, 20701);
        assert_eq!(config.classifier.policy.tests_failed_code, 10);
        assert_eq!(config.bound_devices().len(), 2);
        assert_eq!(
            config.category_dir(&config.categories["mochitest"]),
            PathBuf::from("/builds/work/tests/mochitest")
        );
    }

    #[test]
    fn test_port_conflict_rejected() {
        let content = SAMPLE.replace("agent_port1 = 20703", "agent_port1 = 20701");
        let err = HarnessConfig::parse(&content).unwrap_err();
        match err {
            ConfigError::PortConflict { port, first, second } => {
                assert_eq!(port, 20701);
                assert_eq!(first, "emulator-1.agent_port1");
                assert_eq!(second, "emulator-2.agent_port1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let content = SAMPLE.replace("name = \"emulator-2\"", "name = \"emulator-1\"");
        assert!(matches!(
            HarnessConfig::parse(&content),
            Err(ConfigError::DuplicateDevice(_))
        ));
    }

    #[test]
    fn test_more_suites_than_devices_rejected() {
        let mut config = HarnessConfig::parse(SAMPLE).unwrap();
        config.suites.insert(
            "mochitest-2".to_string(),
            SuiteConfig {
                category: "mochitest".to_string(),
                extra_args: vec![],
                env: BTreeMap::new(),
                requires: vec![],
                rerun_on: None,
                max_runs: None,
                timeout_secs: None,
                idle_timeout_secs: None,
            },
        );
        let err = config
            .select_suites(vec!["mochitest-1".into(), "mochitest-2".into(), "robocop-1".into()])
            .unwrap_err();
        assert!(matches!(err, ConfigError::TooManySuites { suites: 3, devices: 2 }));
    }

    #[test]
    fn test_marionette_suites_rerun_five_times_by_default() {
        let content = format!(
            "{}\n{}",
            SAMPLE,
            r#"
[category.marionette]
test_dir = "tests/marionette"
run_script = "runtests.py"

[suite.marionette-1]
category = "marionette"

[suite.marionette-2]
category = "marionette"
max_runs = 2
"#
        );
        let config = HarnessConfig::parse(&content).unwrap();
        assert_eq!(config.suites["marionette-1"].run_limit(), 5);
        assert_eq!(config.suites["marionette-2"].run_limit(), 2);
        assert_eq!(config.suites["mochitest-1"].max_runs, None);
        assert_eq!(config.suites["mochitest-1"].run_limit(), 1);

        let mut zero = HarnessConfig::parse(&content.replace("max_runs = 2", "max_runs = 0")).unwrap();
        assert!(matches!(
            zero.select_suites(vec!["marionette-2".into()]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_suite_and_category() {
        let mut config = HarnessConfig::parse(SAMPLE).unwrap();
        assert!(matches!(
            config.select_suites(vec!["reftest-1".into()]),
            Err(ConfigError::UnknownSuite(_))
        ));

        let content = SAMPLE.replace("category = \"robocop\"", "category = \"crashtest\"");
        assert!(matches!(
            HarnessConfig::parse(&content),
            Err(ConfigError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn test_unknown_package_rejected() {
        let content = SAMPLE.replace("requires = [\"robocop\"]", "requires = [\"robotium\"]");
        assert!(matches!(
            HarnessConfig::parse(&content),
            Err(ConfigError::UnknownPackage { .. })
        ));
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let content = SAMPLE.replace("pattern = \"LEAKED\"", "pattern = \"(\"\nregex = true");
        assert!(matches!(
            HarnessConfig::parse(&content),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_subset_selection_binds_first_devices() {
        let mut config = HarnessConfig::parse(SAMPLE).unwrap();
        config.select_suites(vec!["robocop-1".into()]).unwrap();
        assert_eq!(config.bound_devices().len(), 1);
        assert_eq!(config.bound_devices()[0].name, "emulator-1");
    }
}
