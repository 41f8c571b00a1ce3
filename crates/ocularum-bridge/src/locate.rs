//! Worker executable discovery.
//!
//! Search order:
//! 1. Explicit path (config / `OCULARUM_WORKER`)
//! 2. Bundled binary in each bundle directory
//! 3. Bundled `main.py` in each bundle directory, run with the Python interpreter
//! 4. System-installed binary on `PATH`
//!
//! Bundle directories are the configured extras followed by the ones derived
//! from the running executable (`backend/`, `resources/backend/`, and on macOS
//! `../Resources/backend/`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::BridgeError;

#[cfg(windows)]
const WORKER_BINARY: &str = "ocularum-backend.exe";
#[cfg(not(windows))]
const WORKER_BINARY: &str = "ocularum-backend";

const WORKER_SCRIPT: &str = "main.py";

#[cfg(windows)]
const PYTHON: &str = "python";
#[cfg(not(windows))]
const PYTHON: &str = "python3";

/// Resolved program plus any leading arguments (the script, for Python).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProgram {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerProgram {
    fn binary(path: PathBuf) -> Self {
        Self {
            program: path,
            args: Vec::new(),
        }
    }

    fn script(interpreter: &str, script: &Path) -> Self {
        Self {
            program: PathBuf::from(interpreter),
            args: vec![script.display().to_string()],
        }
    }

    /// The file that identifies this worker (script if interpreted).
    pub fn executable(&self) -> PathBuf {
        match self.args.first() {
            Some(script) => PathBuf::from(script),
            None => self.program.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerLocator {
    explicit: Option<PathBuf>,
    bundle_dirs: Vec<PathBuf>,
    search_path: Option<OsString>,
    python: Option<String>,
}

fn is_python_script(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "py")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Bundle directories relative to the running executable.
fn default_bundle_dirs() -> Vec<PathBuf> {
    let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    else {
        return Vec::new();
    };

    let mut dirs = vec![exe_dir.join("backend"), exe_dir.join("resources").join("backend")];
    if cfg!(target_os = "macos") {
        dirs.push(exe_dir.join("..").join("Resources").join("backend"));
    }
    dirs
}

impl WorkerLocator {
    /// Locator with the platform default bundle directories and `PATH`.
    pub fn new() -> Self {
        Self {
            bundle_dirs: default_bundle_dirs(),
            search_path: std::env::var_os("PATH"),
            ..Default::default()
        }
    }

    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    /// Search `dirs` ahead of the existing bundle directories.
    pub fn with_bundle_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut combined: Vec<PathBuf> = dirs.into_iter().collect();
        combined.append(&mut self.bundle_dirs);
        self.bundle_dirs = combined;
        self
    }

    /// Replace the bundle directories entirely.
    pub fn only_bundle_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.bundle_dirs = dirs.into_iter().collect();
        self
    }

    pub fn with_search_path(mut self, path: Option<OsString>) -> Self {
        self.search_path = path;
        self
    }

    pub fn with_python(mut self, interpreter: impl Into<String>) -> Self {
        self.python = Some(interpreter.into());
        self
    }

    fn python(&self) -> &str {
        self.python.as_deref().unwrap_or(PYTHON)
    }

    pub fn locate(&self) -> Result<WorkerProgram, BridgeError> {
        let mut searched = Vec::new();

        if let Some(path) = &self.explicit {
            if path.is_file() {
                let program = if is_python_script(path) {
                    WorkerProgram::script(self.python(), path)
                } else {
                    WorkerProgram::binary(path.clone())
                };
                return Ok(program);
            }
            // An explicit path that doesn't exist is a configuration error;
            // falling back would silently run a different worker.
            return Err(BridgeError::WorkerNotFound(path.display().to_string()));
        }

        for dir in &self.bundle_dirs {
            let candidate = dir.join(WORKER_BINARY);
            if is_executable(&candidate) {
                tracing::debug!(path = %candidate.display(), "Found bundled worker");
                return Ok(WorkerProgram::binary(candidate));
            }
            searched.push(candidate);
        }

        for dir in &self.bundle_dirs {
            let candidate = dir.join(WORKER_SCRIPT);
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "Found bundled worker script");
                return Ok(WorkerProgram::script(self.python(), &candidate));
            }
            searched.push(candidate);
        }

        if let Some(path_var) = &self.search_path {
            for dir in std::env::split_paths(path_var) {
                let candidate = dir.join(WORKER_BINARY);
                if is_executable(&candidate) {
                    tracing::debug!(path = %candidate.display(), "Found system-installed worker");
                    return Ok(WorkerProgram::binary(candidate));
                }
            }
            searched.push(PathBuf::from(format!("$PATH/{WORKER_BINARY}")));
        }

        let searched = searched
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(BridgeError::WorkerNotFound(searched))
    }
}
