//! Log filter selection, the rolling file sink, and the crash-report panic hook.
//!
//! The subscriber itself is assembled by the binary; this module only decides
//! what it should be built from so the decisions stay testable.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_SERVER_LOG_FILTER: &str = "info";
pub const DEFAULT_CLI_LOG_FILTER: &str = "warn";
pub const DEFAULT_NOISE_FILTER: &str = "ort=warn";
/// Appended to the file filter so per-stage timings land on disk only.
pub const FILE_DETAIL_FILTER: &str = "dehaze_core::pipeline=debug";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "dehaze";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_REPORT_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `Server` runs the HTTP service; `Cli` dehazes a single file and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn default_filter(self) -> &'static str {
        match self {
            Self::Cli => DEFAULT_CLI_LOG_FILTER,
            Self::Server => DEFAULT_SERVER_LOG_FILTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub mode: RuntimeLogMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl LoggingInitOptions {
    pub fn for_mode(mode: RuntimeLogMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeLogMode::Server,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready(plan) => Some(plan.log_dir.as_path()),
            Self::Fallback(plan) => plan.attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Pick console and file filters.
///
/// Priority: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the mode
/// default. The ORT noise filter and the file detail filter only apply when
/// none of the three was given.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none()
        && options.verbose == 0
        && options.rust_log_env.is_none();

    if !implicit {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    let console_filter = join_directives(&[options.noise_filter.as_str(), user_filter.as_str()]);
    let file_filter = join_directives(&[
        options.noise_filter.as_str(),
        user_filter.as_str(),
        FILE_DETAIL_FILTER,
    ]);

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    compose_logging_filters(options).console_filter
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.mode.default_filter().to_string()
    }
}

fn join_directives(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Daily-rotated log files under `<data_dir>/logs`. Never fails: problems come
/// back as `Fallback` so the caller can log to the console only.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

// ─── Crash reports ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    version: &'static str,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: String,
    backtrace: String,
}

/// Install a process-wide panic hook that writes one report per panic to
/// `<data_dir>/logs/crash` and then chains to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash report directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not recurse into the hook.
    if CRASH_REPORT_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &CrashReport::capture(info))
    }));

    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash report under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash report under '{}'.",
            crash_dir.display()
        ),
    }

    CRASH_REPORT_IN_PROGRESS.store(false, Ordering::Release);
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let (backtrace_policy, backtrace) = capture_backtrace();
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown>".to_string());

        Self {
            timestamp: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location,
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }
}

fn capture_backtrace() -> (String, String) {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1 to enable)".to_string(),
            "<disabled>".to_string(),
        ),
        BacktraceStatus::Unsupported => (
            "unsupported".to_string(),
            "<unsupported on this platform>".to_string(),
        ),
        _ => ("unknown".to_string(), "<unknown>".to_string()),
    }
}

fn write_crash_report(crash_dir: &Path, report: &CrashReport) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = CRASH_REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "crash-{}-{sequence:04}.log",
        report.timestamp.format("%Y%m%dT%H%M%S%.3f")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "version={}", report.version)?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:\n{}", report.backtrace)?;
    file.flush()?;

    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
