//! OPC UA → Hub telemetry bridge binary
//!
//! Wires the configuration, credential vault, telemetry shaper, stack
//! adapter, hub sender and reconciler together, then runs until SIGINT or
//! SIGTERM.
//!
//! Exit codes: 0 clean shutdown, 1 fatal configuration error, 2
//! unrecoverable runtime error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opcua_telemetry_bridge::config::Settings;
use opcua_telemetry_bridge::hub::mqtt::{LoggingHubSink, MqttHubSink, MqttSinkConfig};
use opcua_telemetry_bridge::hub::{HubSender, HubSenderConfig, HubSink};
use opcua_telemetry_bridge::metrics;
use opcua_telemetry_bridge::node_config::{NodeConfigStore, NodeDefaults};
use opcua_telemetry_bridge::reconciler::{Bridge, BridgeConfig};
use opcua_telemetry_bridge::shaping::TelemetryShaper;
use opcua_telemetry_bridge::stack::opcua::OpcUaSessionFactory;
use opcua_telemetry_bridge::stack::SessionFactory;
use opcua_telemetry_bridge::vault::CredentialVault;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("fatal configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let _log_guard = match init_logging(&settings) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("fatal configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        site = settings.site.as_deref().unwrap_or(""),
        edge_mode = settings.edge_mode,
        "starting OPC UA telemetry bridge"
    );

    match run(settings).await {
        Ok(()) => {
            info!("bridge stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.downcast_ref::<opcua_telemetry_bridge::errors::BridgeError>()
                .map(|err| {
                    matches!(
                        err,
                        opcua_telemetry_bridge::errors::BridgeError::Configuration(_)
                    )
                })
                .unwrap_or(false)
            {
                error!(error = %e, "fatal configuration error");
                ExitCode::from(1)
            } else {
                error!(error = %e, "unrecoverable runtime error");
                ExitCode::from(2)
            }
        }
    }
}

fn init_logging(
    settings: &Settings,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| settings.log_level.filter_directive().into());

    match &settings.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .context("LogFileName has no file component")?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            Ok(None)
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();

    // credential vault from the application key, ephemeral otherwise
    let vault = match &settings.application_key_file {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Arc::new(CredentialVault::from_private_key_pem(&pem)?)
        }
        None => {
            info!("no application key configured, using an ephemeral keypair");
            Arc::new(CredentialVault::ephemeral())
        }
    };

    // telemetry shaping rules
    let shaper = match &settings.telemetry_config_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Arc::new(TelemetryShaper::from_json(&json)?)
        }
        None => Arc::new(TelemetryShaper::default()),
    };

    // desired-state store from the published-nodes file
    let defaults = NodeDefaults {
        sampling_interval_ms: settings.default_sampling_interval_ms,
        publishing_interval_ms: settings.default_publishing_interval_ms,
        heartbeat_interval_secs: settings.heartbeat_interval_default,
        skip_first: settings.skip_first_default,
    };
    let store = NodeConfigStore::load_from_file(&settings.node_config_file, &defaults)?;

    // hub transport
    let sink: Arc<dyn HubSink> = match &settings.hub_broker_url {
        Some(broker) => Arc::new(MqttHubSink::connect(
            &MqttSinkConfig {
                broker_url: broker.clone(),
                client_id: settings
                    .site
                    .clone()
                    .unwrap_or_else(|| "opcua-telemetry-bridge".to_string()),
                topic: settings.hub_topic.clone(),
                username: None,
                password: None,
            },
            cancel.child_token(),
        )?),
        None => {
            info!("no hub broker configured, payloads go to the log");
            Arc::new(LoggingHubSink)
        }
    };

    let (hub_handle, hub_task) = HubSender::spawn(
        sink,
        HubSenderConfig {
            queue_capacity: settings.queue_capacity,
            message_size: settings.hub_message_size,
            send_interval: settings.send_interval,
            shutdown_wait: settings.shutdown_wait,
        },
        cancel.child_token(),
    );

    // OPC UA stack adapter
    let factory: Arc<dyn SessionFactory> = Arc::new(OpcUaSessionFactory {
        application_name: "OPC UA Telemetry Bridge".to_string(),
        application_uri: "urn:opcua-telemetry-bridge".to_string(),
        product_uri: "urn:opcua-telemetry-bridge".to_string(),
        pki_dir: std::path::PathBuf::from("./pki"),
        auto_accept_certs: settings.auto_accept_certs,
        session_timeout_ms: 30_000,
    });

    let bridge = Bridge::new(
        BridgeConfig {
            session_connect_wait: settings.session_connect_wait,
            keep_alive_disconnect_threshold: settings.keep_alive_disconnect_threshold,
            fetch_display_names: settings.fetch_display_names,
            operation_timeout: settings.operation_timeout,
            reconcile_period: std::time::Duration::from_secs(1),
            defaults,
        },
        factory,
        vault,
        shaper,
        Arc::new(settings.suppressed_status_codes.clone()),
        hub_handle,
        store,
        cancel.child_token(),
    );
    bridge.start().await;

    let _diagnostics = metrics::spawn_diagnostics(
        settings.diagnostics_interval,
        settings.site.clone(),
        cancel.child_token(),
    );

    // periodic persistence of the running configuration
    let persist_bridge = bridge.clone();
    let persist_path = settings.node_config_file.clone();
    let persist_cancel = cancel.child_token();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = persist_cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = persist_bridge.save_if_changed(&persist_path).await {
                error!(error = %e, "persisting published-nodes configuration failed");
            }
        }
    });

    info!("bridge running, waiting for shutdown signal");
    wait_for_shutdown().await;
    info!("shutdown signal received, stopping");

    // stop accepting work, close sessions, then drain the hub sender
    bridge.shutdown().await;
    cancel.cancel();
    let _ = hub_task.await;

    let _ = bridge.save_if_changed(&settings.node_config_file).await;

    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received");
        }
    }
}
