use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use dehaze_core::backend::InferenceBackend;
use dehaze_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use dehaze_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
};
use dehaze_core::model::{DehazeModel, OnnxDehazeModel};
use dehaze_core::pipeline::DehazePipeline;
use dehaze_core::runtime;
use dehaze_core::server::{app_router, app_state_with_config};

const BACKEND_NAMES: [&str; 5] = ["cpu", "cuda", "gpu", "tensorrt", "trt"];

#[derive(Parser)]
#[command(
    name = "dehaze",
    about = "Single-image dehazing service",
    version,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArgs,

    #[arg(short, long, help = "Listen port (overrides PORT and config)")]
    port: Option<u16>,

    #[arg(long, help = "Listen address")]
    host: Option<String>,
}

#[derive(Args, Default)]
struct ModelArgs {
    #[arg(long = "model", value_name = "PATH", global = true, help = "ONNX model artifact")]
    path: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_parser = BACKEND_NAMES,
        help = "Inference backend"
    )]
    backend: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Dehaze one image file and exit.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Hazy input image")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output PNG (default: <input>_dehazed.png)")]
    output: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let lib_status = runtime::setup_runtime_libs(Some(resolved_data_dir.as_path()));
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime::log_runtime_lib_status(&lib_status);
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Run(run)) => {
            let config = load_config(&resolved_data_dir, &cli.model, false);
            run_file(run.input, run.output, config).await
        }
        None => {
            let config = load_config(&resolved_data_dir, &cli.model, true);
            run_server(cli.port, cli.host, config).await
        }
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: crash report hook unavailable (path: {attempted}; reason: {reason}). Panics will not be written to disk."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..LoggingInitOptions::for_mode(mode)
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter =
        parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console", mode);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let fallback = match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(ready.appender)
                .with_filter(parse_env_filter_with_fallback(
                    &init_plan.filters.file_filter,
                    "file",
                    mode,
                ));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            None
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            Some(fallback)
        }
    };

    if let Some(fallback) = fallback {
        warn!(
            attempted_log_dir = ?fallback.attempted_log_dir,
            reason = %fallback.reason,
            "File logging unavailable; logging to console only"
        );
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Crash report hook unavailable"
        );
    }
}

fn parse_env_filter_with_fallback(
    filter: &str,
    sink_name: &str,
    mode: RuntimeLogMode,
) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        let fallback = mode.default_filter();
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{fallback}'."
        );
        tracing_subscriber::EnvFilter::new(fallback)
    })
}

fn runtime_mode_name(mode: RuntimeLogMode) -> &'static str {
    match mode {
        RuntimeLogMode::Cli => "cli",
        RuntimeLogMode::Server => "server",
    }
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = runtime_mode_name(mode),
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Read `config.toml` from the data dir and apply CLI model overrides.
/// A broken config file is reported and replaced by defaults.
fn load_config(data_dir: &Path, overrides: &ModelArgs, initialize: bool) -> AppConfig {
    if initialize {
        if let Err(e) = initialize_data_dir(data_dir) {
            warn!(error = %e, "Failed to initialize data directory");
        }
    }

    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    apply_model_overrides(&mut config, overrides);
    config
}

fn apply_model_overrides(config: &mut AppConfig, overrides: &ModelArgs) {
    if let Some(path) = &overrides.path {
        config.model.path = path.clone();
    }
    if let Some(name) = overrides.backend.as_deref() {
        config.model.backend = InferenceBackend::from_str_lossy(name);
    }
}

fn resolve_listen_addr(
    port_override: Option<u16>,
    port_env: Option<&str>,
    host_override: Option<String>,
    config: &AppConfig,
) -> String {
    let port = port_override
        .or_else(|| port_env.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());
    format!("{host}:{port}")
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
) -> Result<()> {
    let addr = resolve_listen_addr(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        host_override,
        &config,
    );

    let state = app_state_with_config(&config).context("Failed to start dehaze model")?;
    let app = app_router(state);

    info!(
        %addr,
        max_upload_bytes = config.limits.max_upload_bytes,
        max_concurrent_requests = config.limits.max_concurrent_requests,
        "Starting dehaze server"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    input.with_file_name(format!("{stem}_dehazed.png"))
}

async fn run_file(input: PathBuf, output: Option<PathBuf>, config: AppConfig) -> Result<()> {
    if !input.is_file() {
        bail!("Input image does not exist: {}", input.display());
    }
    let output = output.unwrap_or_else(|| default_output_path(&input));

    let bytes = std::fs::read(&input)
        .with_context(|| format!("Failed to read input image: {}", input.display()))?;

    let model: Arc<dyn DehazeModel> =
        Arc::new(OnnxDehazeModel::load(&config.model).context("Failed to load dehaze model")?);
    let pipeline = DehazePipeline::new(model, config.model.input_size);

    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || pipeline.run(&bytes))
        .await
        .context("Dehaze task panicked")?
        .with_context(|| format!("Failed to dehaze {}", input.display()))?;

    std::fs::write(&output, &result.png)
        .with_context(|| format!("Failed to write output image: {}", output.display()))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        dimensions = %result.dimensions,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Wrote dehazed image"
    );
    println!("{}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_starts_server_with_overrides() {
        let cli = Cli::try_parse_from([
            "dehaze", "--port", "9000", "--host", "127.0.0.1", "--backend", "cuda",
        ])
        .expect("parse server args");

        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.model.backend.as_deref(), Some("cuda"));
    }

    #[test]
    fn run_subcommand_accepts_model_overrides() {
        let cli = Cli::try_parse_from([
            "dehaze", "run", "hazy.jpg", "-o", "clear.png", "--model", "m.onnx", "-v",
        ])
        .expect("parse run args");

        let Some(Commands::Run(run)) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.input, PathBuf::from("hazy.jpg"));
        assert_eq!(run.output, Some(PathBuf::from("clear.png")));
        assert_eq!(cli.model.path, Some(PathBuf::from("m.onnx")));
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["dehaze", "--backend", "metal"]).is_err());
    }

    #[test]
    fn invalid_filter_falls_back_to_mode_default() {
        use tracing_subscriber::filter::LevelFilter;

        let cli = parse_env_filter_with_fallback("dehaze_core=loud", "console", RuntimeLogMode::Cli);
        let server =
            parse_env_filter_with_fallback("dehaze_core=loud", "console", RuntimeLogMode::Server);

        assert_eq!(cli.max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(server.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn valid_filter_is_kept() {
        use tracing_subscriber::filter::LevelFilter;

        let filter = parse_env_filter_with_fallback("debug", "file", RuntimeLogMode::Cli);
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn default_output_sits_next_to_input() {
        assert_eq!(
            default_output_path(Path::new("/photos/foggy.jpg")),
            PathBuf::from("/photos/foggy_dehazed.png")
        );
        assert_eq!(
            default_output_path(Path::new("scan.tar.png")),
            PathBuf::from("scan.tar_dehazed.png")
        );
    }

    #[test]
    fn model_overrides_replace_config_values() {
        let mut config = AppConfig::default();
        let overrides = ModelArgs {
            path: Some(PathBuf::from("/models/aod.onnx")),
            backend: Some("trt".to_string()),
        };

        apply_model_overrides(&mut config, &overrides);
        assert_eq!(config.model.path, PathBuf::from("/models/aod.onnx"));
        assert_eq!(config.model.backend, InferenceBackend::Tensorrt);
    }

    #[test]
    fn empty_overrides_keep_config() {
        let mut config = AppConfig::default();
        apply_model_overrides(&mut config, &ModelArgs::default());
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn listen_addr_precedence() {
        let config = AppConfig::default();

        assert_eq!(resolve_listen_addr(None, None, None, &config), "0.0.0.0:8000");
        assert_eq!(resolve_listen_addr(None, Some("8080"), None, &config), "0.0.0.0:8080");
        assert_eq!(
            resolve_listen_addr(Some(9000), Some("8080"), Some("::1".into()), &config),
            "::1:9000"
        );
        assert_eq!(resolve_listen_addr(None, Some("nope"), None, &config), "0.0.0.0:8000");
    }

    #[test]
    fn load_config_initializes_data_dir_for_server() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data");

        let config = load_config(&data, &ModelArgs::default(), true);
        assert_eq!(config, AppConfig::default());
        assert!(config_path(&data).exists());
    }

    #[test]
    fn load_config_for_cli_does_not_write_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data");

        let _ = load_config(&data, &ModelArgs::default(), false);
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn run_file_rejects_missing_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run_file(dir.path().join("missing.png"), None, AppConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
