//! Failure injection for mock devices
//!
//! Scripts which backend step fails, how, and how many times.

use std::collections::HashMap;

/// Backend step a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Acquire,
    Launch,
    Redirect,
    Health,
    Install,
}

/// Failure configuration for a fault point
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Message carried by the injected error
    pub message: String,
    /// Device the failure applies to (None = every device)
    pub device: Option<String>,
    /// Package the failure applies to, for installs (None = every package)
    pub package: Option<String>,
    /// Matching calls that fail before the fault clears; `None` never clears.
    pub fail_count: Option<u32>,
    /// Fail launches by running a command that cannot be spawned
    pub fatal: bool,
}

impl FailureConfig {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            device: None,
            package: None,
            fail_count: None,
            fatal: false,
        }
    }

    /// Clear the fault after `count` matching calls.
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    pub fn for_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn for_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    fn applies_to(&self, device: &str, package: Option<&str>) -> bool {
        let device_ok = self.device.as_deref().map(|d| d == device).unwrap_or(true);
        let package_ok = match (&self.package, package) {
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
            (None, _) => true,
        };
        device_ok && package_ok
    }
}

/// Failure injector for the mock backend
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<FaultPoint, FailureConfig>,
    /// Matching calls per fault point (for fail_count tracking)
    call_counts: HashMap<FaultPoint, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, point: FaultPoint, config: FailureConfig) {
        self.configs.insert(point, config);
        self.call_counts.insert(point, 0);
    }

    pub fn inject_error(&mut self, point: FaultPoint, message: impl Into<String>) {
        self.inject(point, FailureConfig::error(message));
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    /// Check if a failure should occur at a fault point for a device
    /// (and package, for installs).
    pub fn check(&mut self, point: FaultPoint, device: &str, package: Option<&str>) -> Option<FailureConfig> {
        let config = self.configs.get(&point)?;
        if !config.applies_to(device, package) {
            return None;
        }
        let count = self.call_counts.entry(point).or_insert(0);
        *count += 1;

        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }
        Some(config.clone())
    }
}
