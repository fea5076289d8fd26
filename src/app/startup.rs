//! Daemon startup
//!
//! Parses arguments, loads configuration, installs logging and then runs the
//! stream engine until a shutdown signal arrives.

use crate::app::cli::Args;
use crate::app::heartbeat::Heartbeat;
use crate::app::tap::{tap_registry, TapCounter};
use crate::core::config::DaemonConfig;
use crate::core::error_handling::log_error_with_context;
use crate::core::logging::init_logging;
use crate::core::version::version_banner;
use crate::streams::api::{InMemoryBroker, StreamEngine};
use clap::Parser;
use std::sync::Arc;

/// Initialize application startup
pub fn startup() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("FATAL: could not start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(args));
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    let config = match DaemonConfig::load(args.config_file.clone()).await {
        Ok(mut config) => {
            args.apply_to(&mut config);
            config
        }
        Err(e) => {
            // Report through a CLI-only logger so the failure still reaches the user
            let fallback = args.log_settings();
            if let Err(log_err) = init_logging(&fallback, args.use_color(&fallback)) {
                eprintln!("FATAL: {log_err}");
            }
            log_error_with_context(&e, "Configuration loading");
            return 1;
        }
    };

    if let Err(e) = init_logging(&config.logging, args.use_color(&config.logging)) {
        eprintln!("FATAL: {e}");
        return 1;
    }
    log::info!("{}", version_banner());

    if args.print_config {
        return match toml::to_string(&config) {
            Ok(text) => {
                println!("{text}");
                0
            }
            Err(e) => {
                log::error!("FATAL: could not render configuration: {}", e);
                1
            }
        };
    }

    let counter = TapCounter::default();
    let registry = match tap_registry(&config.tap, &counter) {
        Ok(registry) => registry,
        Err(e) => {
            log_error_with_context(&e, "Handler registration");
            return 1;
        }
    };

    if args.check {
        log::info!(
            "Configuration OK: {} tap binding(s), heartbeat {}",
            registry.binding_count(),
            if config.heartbeat.is_some() { "enabled" } else { "disabled" }
        );
        return 0;
    }

    if registry.is_empty() && config.heartbeat.is_none() {
        log::warn!("No taps or heartbeat configured; the daemon will idle until stopped");
    }

    let engine = StreamEngine::new(config.engine.clone(), Arc::new(InMemoryBroker::new()), registry);
    let publisher = engine.publisher();
    let running = engine.start().await;
    let shutdown = running.shutdown_coordinator();
    shutdown.install_signal_handlers();

    let heartbeat = config.heartbeat.as_ref().map(|settings| {
        tokio::spawn(Heartbeat::new(publisher, settings).run(shutdown.subscribe()))
    });

    running.run_until_shutdown().await;
    if let Some(task) = heartbeat {
        if let Err(e) = task.await {
            log::warn!("Heartbeat task ended abnormally: {}", e);
        }
    }

    log::info!("Daemon stopped after tapping {} event(s)", counter.get());
    0
}
