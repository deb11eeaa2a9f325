//! `dohbridged` — daemon entry point.
//!
//! Parses CLI flags (optionally merged with a TOML file), wires up the
//! shared `ServerContext`, starts whichever front-ends are enabled, and
//! blocks until a shutdown signal drains in-flight requests.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use dohbridge::config::{Cli, Config};
use dohbridge::dns::cache::Cache;
use dohbridge::dns::context::{FrontendConfig, ServerContext};
use dohbridge::dns::doh_server::DohHttpServer;
use dohbridge::dns::monitor::MonitorServer;
use dohbridge::dns::override_table::OverrideTable;
use dohbridge::dns::server::{DnsServer, DnsTcpServer, DnsUdpServer};

fn main() -> ExitCode {
    simple_logger::init().expect("failed to initialize logger");

    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!("dohbridge starting");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cache = config.cache_enabled.then(|| Cache::new(config.cache_capacity, config.cache_ttl_cap));
    let overrides = OverrideTable::new(config.overrides.clone());

    let frontend = FrontendConfig {
        dns_enabled: config.enable_dns_frontend,
        dns_listen: config.dns_listen.clone(),
        doh_enabled: config.enable_doh_frontend,
        doh_listen: config.doh_listen.clone(),
        wire_path: config.wire_path.clone(),
        json_path: config.json_path.clone(),
        monitor_listen: config.monitor_listen.clone(),
    };

    let context = match ServerContext::new(
        cache,
        overrides,
        config.upstream_doh_url.clone(),
        config.doh_dialect,
        config.upstream_dns.clone(),
        frontend,
        config.request_timeout,
        runtime.handle().clone(),
    ) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            log::error!("failed to initialize server context: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = context.run() {
        log::error!("failed to start classic DNS client: {}", e);
        return ExitCode::FAILURE;
    }

    if config.enable_dns_frontend {
        let udp = DnsUdpServer::new(context.clone(), config.worker_threads, config.dns_listen.clone());
        if let Err(e) = udp.run_server() {
            log::error!("failed to bind DNS UDP listener on {}: {}", config.dns_listen, e);
            return ExitCode::FAILURE;
        }

        let tcp = DnsTcpServer::new(context.clone(), config.worker_threads, config.dns_listen.clone());
        if let Err(e) = tcp.run_server() {
            log::error!("failed to bind DNS TCP listener on {}: {}", config.dns_listen, e);
            return ExitCode::FAILURE;
        }

        log::info!("DNS front-end listening on {}", config.dns_listen);
    }

    if config.enable_doh_frontend {
        let doh = DohHttpServer::new(context.clone(), config.worker_threads);
        if let Err(e) = doh.run_server() {
            log::error!("failed to bind DoH listener on {}: {}", config.doh_listen, e);
            return ExitCode::FAILURE;
        }

        log::info!(
            "HTTPS front-end listening on {} ({} wire, {} json, insecure_http={})",
            config.doh_listen,
            config.wire_path,
            config.json_path,
            config.insecure_http
        );
    }

    if let Some(monitor_listen) = config.monitor_listen.clone() {
        let monitor_context = context.clone();
        std::thread::Builder::new()
            .name("monitor".into())
            .spawn(move || {
                let monitor = MonitorServer::new(monitor_context, monitor_listen.clone());
                if let Err(e) = monitor.run_server() {
                    log::error!("monitoring listener on {} failed: {}", monitor_listen, e);
                }
            })
            .expect("failed to spawn monitoring listener thread");

        log::info!("monitoring listener on {}", monitor_listen);
    }

    runtime.block_on(async {
        if tokio::signal::ctrl_c().await.is_err() {
            log::warn!("failed to install ctrl-c handler; running without graceful shutdown");
            std::future::pending::<()>().await;
        }
    });

    log::info!("shutdown requested, draining in-flight requests");
    context.shutdown.begin_shutdown();
    if !context.shutdown.wait_for_drain(Duration::from_secs(10)) {
        log::warn!(
            "shutdown timed out with {} requests still in flight",
            context.shutdown.in_flight_count()
        );
    }

    ExitCode::SUCCESS
}
