// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use clap::Parser;
use dropshot::{ConfigDropshot, HandlerTaskMode, HttpServerStarter};
use slog::{info, o};

use configdrive_server::persist::StateDir;
use configdrive_server::server::{self, ServiceContext};
use configdrive_server::service::{ConfigDriveService, LocalPlatform};
use configdrive_server::config::{self, Config};

/// Threads to spawn for the tokio runtime handling the API.
const API_RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// An HTTP server managing per-instance config drives.
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the config-drive server.
    Run {
        /// Path to a TOML config file.
        #[clap(long, action)]
        config: Option<Utf8PathBuf>,

        #[clap(name = "CONFIGDRIVE_IP:PORT", action)]
        listen_addr: SocketAddr,

        /// Logging level for the server.
        #[clap(long, default_value_t = slog::Level::Info,
               value_parser = parse_log_level)]
        log_level: slog::Level,
    },
}

fn run_openapi() -> Result<(), String> {
    server::api()
        .openapi("Config Drive Server API", semver::Version::new(0, 1, 0))
        .description(
            "API for managing per-instance configuration drives.",
        )
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("configdrive-server", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered = slog::LevelFilter::new(main_drain, level).fuse();
    slog::Logger::root(filtered, o!())
}

fn run_server(
    config: Config,
    listen_addr: SocketAddr,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let config_dropshot = ConfigDropshot {
        bind_address: listen_addr,
        // Room for base64 userdata payloads and drive reads.
        default_request_body_max_bytes: 1024 * 1024,
        default_handler_task_mode: HandlerTaskMode::Detached,
        log_headers: vec![],
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(API_RT_THREADS)
        .thread_name("tokio-rt-api")
        .build()?;

    runtime.block_on(async move {
        let state_dir = match &config.main.data_dir {
            Some(dir) => Some(
                StateDir::new(
                    dir.clone(),
                    log.new(o!("component" => "persist")),
                )
                .with_context(|| {
                    format!("unable to set up data dir {dir}")
                })?,
            ),
            None => None,
        };

        let service = ConfigDriveService::new(
            log.new(o!("component" => "service")),
            Arc::new(LocalPlatform::new(config.main.password_length)),
            state_dir,
        )
        .context("unable to initialize config-drive service")?;
        let context =
            Arc::new(ServiceContext { service, log: log.clone() });

        info!(log, "starting server"; "listen" => %listen_addr);
        let server = HttpServerStarter::new(
            &config_dropshot,
            server::api(),
            context,
            &log,
        )
        .map_err(|e| anyhow!("failed to start server: {}", e))?
        .start();

        server
            .await
            .map_err(|e| anyhow!("server exited with an error: {}", e))
    })
}

fn main() -> anyhow::Result<()> {
    match Args::parse() {
        Args::OpenApi => run_openapi()
            .map_err(|e| anyhow!("failed to generate OpenAPI spec: {}", e)),
        Args::Run { config, listen_addr, log_level } => {
            let config = match config {
                Some(path) => config::parse(&path)?,
                None => Config::default(),
            };
            let log = build_logger(log_level);
            run_server(config, listen_addr, log)
        }
    }
}
