use clap::Parser;
use flowwatch::configuration::config::{Args, Config};
use flowwatch::configuration::types::OutputFormat;
use flowwatch::error_handling::types::MonitorError;
use flowwatch::flow_tracking::ConnectionManager;
use flowwatch::geolocation::TableResolver;
use flowwatch::monitor::{
    capture_source_from_settings, EngineTiming, JsonLinesSink, LogSink, Monitor, ProcFsProbe,
    ProcessPresence, ProcessWatcher,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    // RUST_LOG overrides the default level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    println!(
        "
==============================================================================
     flowwatch v{} - live per-peer UDP traffic of a monitored process
==============================================================================
",
        env!("CARGO_PKG_VERSION")
    );

    let args = Args::parse();

    info!("Importing configuration");
    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Configuration imported: {:?} backend, source {}, port {}",
        config.capture.backend,
        config.capture.source.as_deref().unwrap_or("-"),
        config.capture.monitored_port
    );

    let resolver = Arc::new(TableResolver::new());
    if let Some(database) = &config.geolocation.database {
        if resolver.open(database).is_err() {
            warn!("Continuing without geolocation");
        }
    }

    let manager = Arc::new(ConnectionManager::new(
        config.engine.min_bytes_threshold,
        config.engine.eviction,
        resolver.clone(),
    ));
    let mut monitor = Monitor::new(manager, EngineTiming::from_config(&config));
    match config.output.format {
        OutputFormat::Log => monitor.add_sink(Box::new(LogSink)),
        OutputFormat::Json => monitor.add_sink(Box::new(JsonLinesSink::stdout())),
    }

    let result = match config.process.name.clone() {
        Some(name) => follow_process(&mut monitor, &config, name).await,
        None => run_until_interrupted(&mut monitor, &config).await,
    };

    if let Err(e) = monitor.stop_monitoring().await {
        warn!("Teardown incomplete: {}", e);
    }
    resolver.close();

    if let Err(e) = result {
        error!("{}, exiting...", e);
        std::process::exit(1);
    }
    info!("Bye");
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {}", e);
    }
}

async fn start_session(
    monitor: &mut Monitor,
    config: &Config,
    process_id: Option<u32>,
) -> Result<(), MonitorError> {
    monitor.select_source(capture_source_from_settings(&config.capture, process_id)?)?;
    monitor.start_monitoring().await?;
    Ok(())
}

async fn run_until_interrupted(monitor: &mut Monitor, config: &Config) -> Result<(), MonitorError> {
    start_session(monitor, config, None).await?;
    info!("Monitoring until Ctrl-C");
    wait_for_interrupt().await;
    Ok(())
}

/// Starts monitoring whenever the process appears and stops when it goes away.
async fn follow_process(
    monitor: &mut Monitor,
    config: &Config,
    name: String,
) -> Result<(), MonitorError> {
    let (presence_tx, mut presence) = mpsc::channel(4);
    info!("Waiting for process '{}'", name);
    let watcher =
        ProcessWatcher::new(ProcFsProbe::new(), name, config.process_poll_interval()).spawn(presence_tx);

    let result = loop {
        tokio::select! {
            _ = wait_for_interrupt() => break Ok(()),
            event = presence.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };

                // a new pid restarts the session with the new process filter
                if let Err(e) = monitor.stop_monitoring().await {
                    warn!("Teardown incomplete: {}", e);
                }
                if let ProcessPresence::Present(pid) = event {
                    match start_session(monitor, config, Some(pid)).await {
                        Ok(()) => {}
                        Err(MonitorError::CaptureError(e)) if !e.is_retryable() => {
                            break Err(MonitorError::CaptureError(e));
                        }
                        Err(e) => error!("Unable to start monitoring pid {}: {}", pid, e),
                    }
                }
            }
        }
    };

    watcher.abort();
    result
}
