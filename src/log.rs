//! Structured logging for conductor runs.
//!
//! Log levels:
//! - ERROR: Failures that stop a workflow or the CLI
//! - WARN: Recoverable surprises (lagged subscribers, rejected expansions)
//! - INFO: Workflow lifecycle (started, finished, cancelled)
//! - DEBUG: Dispatch, retry and stage decisions
//! - TRACE: Every progress event
//!
//! Records written inside a [`Scope`] carry the workflow and task they
//! belong to:
//!
//! ```text
//! [14:02:11.532] [DEBUG] wf=3f2a9c1e task=fetch Task fetch started
//! ```
//!
//! Nothing is written until [`init_with_debug`] has been called, so
//! embedding the library stays silent. Debug mode can be enabled with the
//! `--debug` flag or `CONDUCTOR_DEBUG=1`.

use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::core::TaskId;
use crate::workflow::WorkflowId;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

tokio::task_local! {
    static SCOPE: Scope;
}

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// The workflow (and task) a piece of async work is acting for.
///
/// Scopes live in a tokio task-local, so they follow a future across
/// `.await` points but not into `tokio::spawn`; capture
/// [`Scope::current`] before spawning and re-enter it inside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub workflow: Option<WorkflowId>,
    pub task: Option<TaskId>,
}

impl Scope {
    pub fn workflow(id: WorkflowId) -> Self {
        Self {
            workflow: Some(id),
            task: None,
        }
    }

    pub fn with_task(mut self, id: TaskId) -> Self {
        self.task = Some(id);
        self
    }

    /// The scope of the running future, if any.
    pub fn current() -> Option<Scope> {
        SCOPE.try_with(Clone::clone).ok()
    }

    /// Drive `fut` with this scope in effect.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        SCOPE.scope(self, fut).await
    }

    fn prefix(&self) -> String {
        let mut prefix = String::new();
        if let Some(id) = &self.workflow {
            prefix.push_str(&format!("wf={} ", id.short()));
        }
        if let Some(id) = &self.task {
            prefix.push_str(&format!("task={} ", id));
        }
        prefix
    }
}

/// Initialize logging to ~/.conductor/conductor.log with an explicit debug
/// mode setting.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let level = if debug_enabled {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("conductor.log");
        // Truncate file on startup
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// One record without its timestamp.
fn render(level: LogLevel, scope: Option<&Scope>, msg: &str) -> String {
    let prefix = scope.map(Scope::prefix).unwrap_or_default();
    format!("[{}] {}{}", level.as_str(), prefix, msg)
}

/// Log a message at the specified level, tagged with the current scope.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let line = render(level, Scope::current().as_ref(), msg);
            let _ = writeln!(file, "[{}] {}", timestamp, line);
        }
    }
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
