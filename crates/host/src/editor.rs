//! The editor API boundary
//!
//! [`EditorHost`] is the surface the handlers are allowed to call, and only
//! from inside a dispatcher closure. Every method starts with
//! [`assert_main_thread`]. [`HeadlessEditor`] is an in-memory implementation
//! used by the `tether-host` binary and the tests.

use crate::dispatcher::assert_main_thread;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::error::RequestError;

/// Whether the editor can serve requests right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Mid-recompile, mid-import, entering play mode, ...
    Busy { reason: String },
}

/// Identity reported in `Welcome` and health responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorIdentity {
    pub editor_version: String,
    pub platform: String,
    pub runtime_version: String,
    pub project: String,
}

/// A player or bundle build as the editor sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildJob {
    Player {
        target: String,
        output_path: String,
        development: bool,
    },
    Bundles {
        target: String,
        output_path: String,
    },
}

impl BuildJob {
    pub fn target(&self) -> &str {
        match self {
            BuildJob::Player { target, .. } | BuildJob::Bundles { target, .. } => target,
        }
    }

    pub fn output_path(&self) -> &str {
        match self {
            BuildJob::Player { output_path, .. } | BuildJob::Bundles { output_path, .. } => {
                output_path
            }
        }
    }

    pub fn operation_name(&self) -> &'static str {
        match self {
            BuildJob::Player { .. } => "build.player",
            BuildJob::Bundles { .. } => "build.bundles",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub success: bool,
    pub size_bytes: u64,
    pub warnings: Vec<String>,
}

/// Build progress callback: fraction in `0.0..=1.0` and a short step label
pub type ProgressSink<'a> = &'a mut dyn FnMut(f32, &str);

/// Everything the handlers may ask of the editor. Main thread only.
pub trait EditorHost: Send + Sync + 'static {
    fn readiness(&self) -> Readiness;

    fn identity(&self) -> EditorIdentity;

    /// Rescan the project; returns the paths whose state changed
    fn refresh_assets(&self) -> Result<Vec<String>, RequestError>;

    fn import_asset(&self, path: &str) -> Result<Vec<String>, RequestError>;

    fn move_asset(&self, from: &str, to: &str) -> Result<Vec<String>, RequestError>;

    fn delete_asset(&self, path: &str) -> Result<Vec<String>, RequestError>;

    fn build(&self, job: &BuildJob, progress: ProgressSink<'_>) -> Result<BuildOutcome, RequestError>;
}

/// Build targets the headless editor knows how to produce
pub const KNOWN_TARGETS: [&str; 6] = ["linux64", "win64", "osx", "android", "ios", "webgl"];

#[derive(Debug)]
struct EditorState {
    assets: BTreeSet<String>,
    busy: Option<String>,
    /// Files that appeared on disk but are not imported yet
    pending_imports: BTreeSet<String>,
}

/// In-memory editor. Counts every API entry so tests can prove which paths
/// never reached the editor.
#[derive(Debug)]
pub struct HeadlessEditor {
    state: Mutex<EditorState>,
    identity: EditorIdentity,
    api_calls: AtomicU64,
}

impl HeadlessEditor {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(EditorState {
                assets: BTreeSet::new(),
                busy: None,
                pending_imports: BTreeSet::new(),
            }),
            identity: EditorIdentity {
                editor_version: format!("headless-{}", env!("CARGO_PKG_VERSION")),
                platform: std::env::consts::OS.to_string(),
                runtime_version: format!("rust/{}", std::env::consts::ARCH),
                project: project.into(),
            },
            api_calls: AtomicU64::new(0),
        }
    }

    /// Seed assets before the editor starts serving
    pub fn with_assets<I, S>(self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .assets
            .extend(assets.into_iter().map(Into::into));
        self
    }

    /// Simulate a file dropped into the project outside the editor
    pub fn add_untracked_file(&self, path: impl Into<String>) {
        assert_main_thread();
        self.enter();
        self.state.lock().pending_imports.insert(path.into());
    }

    /// Enter or leave a busy period (script recompile, domain reload)
    pub fn set_busy(&self, reason: Option<String>) {
        assert_main_thread();
        self.enter();
        self.state.lock().busy = reason;
    }

    /// Number of editor API entries so far
    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::SeqCst)
    }

    pub fn assets(&self) -> Vec<String> {
        self.state.lock().assets.iter().cloned().collect()
    }

    fn enter(&self) {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn check_asset_path(path: &str) -> Result<(), RequestError> {
    if !path.starts_with("Assets/") || path.len() == "Assets/".len() {
        return Err(RequestError::InvalidRequest {
            reason: format!("asset paths must live under Assets/, got '{}'", path),
        });
    }
    if path.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(RequestError::InvalidRequest {
            reason: format!("'{}' is not a normalized asset path", path),
        });
    }
    Ok(())
}

impl EditorHost for HeadlessEditor {
    fn readiness(&self) -> Readiness {
        assert_main_thread();
        self.enter();
        match &self.state.lock().busy {
            Some(reason) => Readiness::Busy {
                reason: reason.clone(),
            },
            None => Readiness::Ready,
        }
    }

    fn identity(&self) -> EditorIdentity {
        assert_main_thread();
        self.enter();
        self.identity.clone()
    }

    fn refresh_assets(&self) -> Result<Vec<String>, RequestError> {
        assert_main_thread();
        self.enter();
        let mut state = self.state.lock();
        let imported: Vec<String> = std::mem::take(&mut state.pending_imports)
            .into_iter()
            .collect();
        state.assets.extend(imported.iter().cloned());
        Ok(imported)
    }

    fn import_asset(&self, path: &str) -> Result<Vec<String>, RequestError> {
        assert_main_thread();
        self.enter();
        check_asset_path(path)?;
        let mut state = self.state.lock();
        state.pending_imports.remove(path);
        state.assets.insert(path.to_string());
        Ok(vec![path.to_string()])
    }

    fn move_asset(&self, from: &str, to: &str) -> Result<Vec<String>, RequestError> {
        assert_main_thread();
        self.enter();
        check_asset_path(from)?;
        check_asset_path(to)?;
        let mut state = self.state.lock();
        if !state.assets.contains(from) {
            return Err(RequestError::NotFound {
                what: from.to_string(),
            });
        }
        if state.assets.contains(to) {
            return Err(RequestError::InvalidRequest {
                reason: format!("destination '{}' already exists", to),
            });
        }
        state.assets.remove(from);
        state.assets.insert(to.to_string());
        Ok(vec![from.to_string(), to.to_string()])
    }

    fn delete_asset(&self, path: &str) -> Result<Vec<String>, RequestError> {
        assert_main_thread();
        self.enter();
        check_asset_path(path)?;
        if !self.state.lock().assets.remove(path) {
            return Err(RequestError::NotFound {
                what: path.to_string(),
            });
        }
        Ok(vec![path.to_string()])
    }

    fn build(&self, job: &BuildJob, progress: ProgressSink<'_>) -> Result<BuildOutcome, RequestError> {
        assert_main_thread();
        self.enter();

        if !KNOWN_TARGETS.contains(&job.target()) {
            return Err(RequestError::InvalidRequest {
                reason: format!("unknown build target '{}'", job.target()),
            });
        }
        if job.output_path().trim().is_empty() {
            return Err(RequestError::InvalidRequest {
                reason: "output path must not be empty".to_string(),
            });
        }

        let assets = self.assets();
        let mut warnings = Vec::new();
        if assets.is_empty() {
            warnings.push("project has no assets; the build is empty".to_string());
        }

        let steps: &[&str] = match job {
            BuildJob::Player { .. } => &["compiling scripts", "packing assets", "linking player"],
            BuildJob::Bundles { .. } => &["collecting dependencies", "writing bundles"],
        };
        for (i, step) in steps.iter().enumerate() {
            progress((i + 1) as f32 / steps.len() as f32, step);
        }

        let mut size_bytes: u64 = assets.iter().map(|a| a.len() as u64 * 1024).sum();
        if let BuildJob::Player { development, .. } = job {
            size_bytes += if *development { 48 << 20 } else { 32 << 20 };
        }

        Ok(BuildOutcome {
            success: true,
            size_bytes,
            warnings,
        })
    }
}
