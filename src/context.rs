//! Values resolved once per run and read everywhere after.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::HarnessConfig;

/// Child environment: blob upload directory.
pub const ENV_UPLOAD_DIR: &str = "MOZ_UPLOAD_DIR";
/// Child environment: where crashing processes drop minidumps.
pub const ENV_MINIDUMP_SAVE_PATH: &str = "MINIDUMP_SAVE_PATH";
/// Child environment: stack walker used to symbolicate minidumps.
pub const ENV_MINIDUMP_STACKWALK: &str = "MINIDUMP_STACKWALK";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to read package name from {path}: {source}")]
    PackageName {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("package name file {0} is empty")]
    EmptyPackageName(PathBuf),
}

/// Resolved directories, package name and child environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub work_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub installer_path: PathBuf,
    /// `None` when neither configured nor found next to the artifact.
    pub package_name: Option<String>,
    pub symbols_path: Option<String>,
    pub xre_path: Option<PathBuf>,
    pub utility_path: Option<PathBuf>,
    pub certs_path: PathBuf,
    pub modules_dir: Option<PathBuf>,
    pub remote_webserver: String,
    pub device_ip: String,
    pub console_host: String,
    /// Variables added to every test process.
    pub child_env: BTreeMap<String, String>,
}

impl RunContext {
    pub fn resolve(config: &HarnessConfig) -> Result<Self, ContextError> {
        let paths = &config.paths;
        let work_dir = paths.work_dir.clone();
        let upload_dir = config.work_path(&paths.upload_dir);

        let package_name = match &paths.package_name {
            Some(name) => Some(name.clone()),
            None => {
                let file = paths
                    .package_name_file
                    .as_deref()
                    .map(|p| config.work_path(p))
                    .unwrap_or_else(|| work_dir.join("package-name.txt"));
                read_package_name(&file)?
            }
        };

        let mut child_env = BTreeMap::new();
        child_env.insert(ENV_UPLOAD_DIR.to_string(), path_string(&upload_dir));
        child_env.insert(ENV_MINIDUMP_SAVE_PATH.to_string(), path_string(&upload_dir));
        if let Some(stackwalk) = &paths.minidump_stackwalk {
            child_env.insert(ENV_MINIDUMP_STACKWALK.to_string(), path_string(&config.work_path(stackwalk)));
        }

        Ok(Self {
            installer_path: config.work_path(&paths.installer_path),
            package_name,
            symbols_path: paths.symbols_path.clone(),
            xre_path: paths.xre_dir.as_ref().map(|d| config.work_path(d).join("xre")),
            utility_path: paths.xre_dir.as_ref().map(|d| config.work_path(d).join("bin")),
            certs_path: work_dir.join("tests").join("certs"),
            modules_dir: paths.modules_dir.as_ref().map(|d| config.work_path(d)),
            remote_webserver: paths.remote_webserver.clone(),
            device_ip: paths.device_ip.clone(),
            console_host: paths.console_host.clone(),
            child_env,
            work_dir,
            upload_dir,
        })
    }

    /// Run-wide placeholder values; device values are added by the
    /// dispatcher. Optional values are absent rather than empty.
    pub fn placeholder_values(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                values.insert(key.to_string(), value);
            }
        };
        put("app", self.package_name.clone());
        put("remote_webserver", Some(self.remote_webserver.clone()));
        put("xre_path", self.xre_path.as_deref().map(path_string));
        put("utility_path", self.utility_path.as_deref().map(path_string));
        put("device_ip", Some(self.device_ip.clone()));
        put("certs_path", Some(path_string(&self.certs_path)));
        put("symbols_path", self.symbols_path.clone());
        put("modules_dir", self.modules_dir.as_deref().map(path_string));
        put("installer_path", Some(path_string(&self.installer_path)));
        values
    }
}

fn read_package_name(path: &Path) -> Result<Option<String>, ContextError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no package name file");
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| ContextError::PackageName {
        path: path.to_path_buf(),
        source,
    })?;
    let name = content.trim();
    if name.is_empty() {
        return Err(ContextError::EmptyPackageName(path.to_path_buf()));
    }
    Ok(Some(name.to_string()))
}

pub(crate) fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
