//! perftree
//!
//! Runs an instrumentation engine with the system probes and exposes its data
//! through a small JSON console over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                            perftree                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐  │
//! │  │    Probes    │───▶│    Engine    │───▶│      Sinks       │  │
//! │  │ load / disk  │    │  (sampler)   │    │ log / prometheus │  │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘  │
//! │                             │                                  │
//! │                             ▼                                  │
//! │                     JSON console (hyper)                       │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use perftree::dump::{CyclicScalarDumper, DumpSchedule};
use perftree::probe::{DiskStatsProbe, EnvVarProbe, SystemLoadProbe};
use perftree::sink::{LoggingDataSink, PrometheusDataSink, RunningMeasurementsSink};
use perftree::{Engine, EngineConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// perftree - in-process performance instrumentation engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(long, env = "PERFTREE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the sampling period of the timed scalar sampler
    #[arg(long, env = "SAMPLING_PERIOD_SECONDS")]
    sampling_period_seconds: Option<u64>,

    /// Console server bind address
    #[arg(long, env = "CONSOLE_ADDR", default_value = "127.0.0.1:8090")]
    console_addr: String,

    /// Log on-demand scalar measurements every N seconds
    #[arg(long, env = "DUMP_INTERVAL_SECONDS")]
    dump_interval_seconds: Option<u64>,

    /// Run a synthetic workload that produces measurement trees
    #[arg(long, env = "DEMO")]
    demo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(seconds) = args.sampling_period_seconds {
        config = config.with_sampling_period(seconds);
    }

    info!("Starting perftree");
    info!("  Sampling period: {} s", config.sampling_period_seconds);
    info!("  History per metric: {}", config.max_history_per_metric);
    info!("  Console address: {}", args.console_addr);
    info!("  Demo workload: {}", args.demo);

    let prometheus = Arc::new(PrometheusDataSink::new("perftree")?);
    let running = Arc::new(RunningMeasurementsSink::new());

    let engine = Engine::builder()
        .config(config)
        .scalar_probe(SystemLoadProbe::new())
        .scalar_probe(DiskStatsProbe::new())
        .timed_scalar_probe(SystemLoadProbe::new())
        .timed_scalar_probe(DiskStatsProbe::new())
        .environment_probe(EnvVarProbe::new())
        .data_sink(Arc::new(LoggingDataSink::debug_level()))
        .data_sink(prometheus.clone())
        .data_sink(running.clone())
        .build()?;

    let dumper = match args.dump_interval_seconds {
        Some(seconds) => Some(CyclicScalarDumper::start(
            &engine,
            DumpSchedule {
                initial_delay: Duration::from_secs(seconds),
                frequency: Duration::from_secs(seconds),
                averaging_delay: engine.config().averaging_delay(),
            },
        )?),
        None => None,
    };

    let token = CancellationToken::new();

    let demo = if args.demo {
        let engine = engine.clone();
        let token = token.clone();
        Some(tokio::task::spawn_blocking(move || run_demo(&engine, &token)))
    } else {
        None
    };

    let console = Arc::new(Console {
        engine: engine.clone(),
        prometheus,
        running,
    });
    let console_addr = args.console_addr.clone();
    let console_token = token.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_console(&console_addr, console, console_token).await {
            error!("Console server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    token.cancel();
    if let Some(demo) = demo {
        if let Err(e) = demo.await {
            error!("Demo workload failed: {}", e);
        }
    }
    if let Err(e) = server.await {
        error!("Console server task failed: {}", e);
    }
    drop(dumper);
    engine.shutdown();

    info!("perftree shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("tokio=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Demo Workload
// =============================================================================

fn run_demo(engine: &Engine, token: &CancellationToken) {
    info!("Demo workload started");
    let mut iteration: u64 = 0;

    while !token.is_cancelled() {
        iteration += 1;
        engine.measure("demo-request", |request| {
            request.add_parameter("iteration", &iteration.to_string());

            engine.measure("parse", |_| thread::sleep(Duration::from_millis(2)));

            let cursor = engine.start_collecting("db-cursor");
            for _ in 0..5 {
                cursor.detail("next", |_| thread::sleep(Duration::from_millis(1)));
            }
            cursor.finish();

            let refresh = engine.start_parallel("cache-refresh");
            thread::sleep(Duration::from_millis(3));
            refresh.finish();
        });
        thread::sleep(Duration::from_millis(500));
    }

    info!(iterations = iteration, "Demo workload stopped");
}

// =============================================================================
// Console Server
// =============================================================================

struct Console {
    engine: Arc<Engine>,
    prometheus: Arc<PrometheusDataSink>,
    running: Arc<RunningMeasurementsSink>,
}

#[derive(Serialize)]
struct Status {
    diagnostics: perftree::diagnostics::DiagnosticsSnapshot,
    collaborators: Vec<perftree::engine::CollaboratorStatus>,
}

impl Console {
    async fn handle(&self, path: &str) -> Response<Full<Bytes>> {
        match path {
            "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
            "/scalars" => {
                // sampling blocks for the averaging delay
                let engine = self.engine.clone();
                match tokio::task::spawn_blocking(move || engine.get_scalar_measurements()).await {
                    Ok(measurements) => json(&measurements),
                    Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
                }
            }
            "/timed-scalars" => json(&self.engine.timed_scalar_measurements()),
            "/environment" => json(&self.engine.environment_measurements()),
            "/running" => json(&self.running.running()),
            "/status" => json(&Status {
                diagnostics: self.engine.diagnostics(),
                collaborators: self.engine.collaborators(),
            }),
            "/metrics" => match self.prometheus.encode_text() {
                Ok(body) => with_content_type(
                    StatusCode::OK,
                    "text/plain; version=0.0.4",
                    Bytes::from(body),
                ),
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn with_content_type(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    with_content_type(status, "text/plain", Bytes::from(body.to_string()))
}

fn json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => with_content_type(StatusCode::OK, "application/json", Bytes::from(body)),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn run_console(
    addr: &str,
    console: Arc<Console>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid console address: {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind console server to {}", addr))?;

    info!("Console server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted.context("console server accept error")?,
            _ = token.cancelled() => break,
        };

        let io = TokioIo::new(stream);
        let console = console.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let console = console.clone();
                let path = req.uri().path().to_string();
                async move { Ok::<_, Infallible>(console.handle(&path).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Console server connection error: {}", e);
            }
        });
    }

    info!("Console server stopped");
    Ok(())
}
