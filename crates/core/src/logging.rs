//! Tracing filter selection, the rolling log file and crash reports.
//!
//! Crash reports name the subcommand and noise seed of the run that panicked,
//! so a failed sampling run can be replayed with the same `--seed`.

use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";

/// ORT logs execution-provider registration at info.
const ORT_NOISE_FILTER: &str = "ort=warn";
const SAMPLER_TARGET: &str = "patchdiff_core::sampler";
const LOG_RETENTION_FILES: usize = 14;

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static RUN_CONTEXT: Mutex<RunContext> = Mutex::new(RunContext {
    command: None,
    seed: None,
});
static REPORTING: AtomicBool = AtomicBool::new(false);

/// Log verbosity as given on the command line and in the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogSettings {
    /// `--log-filter` wins over `-v`/`-vv`, which win over `RUST_LOG`.
    ///
    /// An explicit choice is used verbatim for both sinks. Otherwise ORT is
    /// quietened and the file additionally keeps the per-step sampler lines.
    pub fn filters(&self) -> LogFilters {
        let explicit = match (&self.cli_filter, self.verbose) {
            (Some(filter), _) => Some(filter.clone()),
            (None, 0) => None,
            (None, 1) => Some("debug".to_string()),
            (None, _) => Some("trace".to_string()),
        };
        if let Some(filter) = explicit {
            return LogFilters {
                console: filter.clone(),
                file: filter,
            };
        }

        let base = self
            .rust_log
            .as_deref()
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER);
        let console = format!("{ORT_NOISE_FILTER},{base}");
        let file = if base.contains(SAMPLER_TARGET) {
            console.clone()
        } else {
            format!("{console},{SAMPLER_TARGET}=debug")
        };
        LogFilters { console, file }
    }
}

/// Daily-rolling `patchdiff.<date>.log` files under `<data_dir>/logs`.
pub fn open_log_file(data_dir: &Path) -> Result<RollingFileAppender> {
    let log_dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("patchdiff")
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_FILES)
        .build(&log_dir)
        .with_context(|| format!("failed to open rolling log in {}", log_dir.display()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RunContext {
    command: Option<String>,
    seed: Option<u64>,
}

fn update_run_context(update: impl FnOnce(&mut RunContext)) {
    let mut context = RUN_CONTEXT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    update(&mut context);
}

/// Record the running subcommand for crash reports.
pub fn set_crash_command(command: &str) {
    update_run_context(|context| context.command = Some(command.to_string()));
}

/// Record the noise seed for crash reports.
pub fn set_crash_seed(seed: u64) {
    update_run_context(|context| context.seed = Some(seed));
}

/// Write a report under `<data_dir>/logs/crash` for every panic, then run the
/// previously installed hook. Returns the crash directory; repeated calls keep
/// the first one.
pub fn install_crash_reporter(data_dir: &Path) -> Result<PathBuf> {
    if let Some(dir) = CRASH_DIR.get() {
        return Ok(dir.clone());
    }

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    fs::create_dir_all(&crash_dir)
        .with_context(|| format!("failed to create crash directory {}", crash_dir.display()))?;

    let mut installed_here = false;
    let dir = CRASH_DIR.get_or_init(|| {
        installed_here = true;
        crash_dir
    });
    if installed_here {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            report_panic(info);
            previous(info);
        }));
    }
    Ok(dir.clone())
}

fn report_panic(info: &PanicHookInfo<'_>) {
    let Some(dir) = CRASH_DIR.get() else {
        return;
    };
    // A panic while writing the report must not recurse.
    if REPORTING.swap(true, Ordering::AcqRel) {
        return;
    }

    let context = RUN_CONTEXT
        .try_lock()
        .map(|context| (*context).clone())
        .unwrap_or_default();
    let report = CrashReport::capture(info, context);
    if let Err(error) = report.write_to(dir) {
        eprintln!("warning: no crash report written: {error:#}");
    }

    REPORTING.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    time: DateTime<Utc>,
    context: RunContext,
    thread: String,
    location: String,
    message: String,
    backtrace: Option<String>,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>, context: RunContext) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        let backtrace = Backtrace::capture();

        Self {
            time: Utc::now(),
            context,
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            message,
            backtrace: (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string()),
        }
    }

    fn file_name(&self) -> String {
        format!(
            "crash-{}-{}-{}.txt",
            self.context.command.as_deref().unwrap_or("startup"),
            self.time.format("%Y%m%dT%H%M%S%.6f"),
            std::process::id()
        )
    }

    fn render(&self) -> String {
        let seed = self
            .context
            .seed
            .map_or_else(|| "unset".to_string(), |seed| seed.to_string());
        let mut text = format!(
            "command: {}\nseed: {seed}\ntime: {}\nthread: {}\nlocation: {}\nmessage: {}\n",
            self.context.command.as_deref().unwrap_or("<none>"),
            self.time.to_rfc3339(),
            self.thread,
            self.location,
            self.message,
        );
        match &self.backtrace {
            Some(trace) => {
                text.push_str("\nbacktrace:\n");
                text.push_str(trace);
                text.push('\n');
            }
            None => text.push_str("\nbacktrace not captured (set RUST_BACKTRACE=1)\n"),
        }
        text
    }

    fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        fs::write(&path, self.render())
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}
