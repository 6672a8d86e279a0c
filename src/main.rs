use kamstrup2mqtt::kamstrup::transport::SerialConnector;
use kamstrup2mqtt::{Config, Integration, PollCoordinator, PollEvent, SetupError};
use log::{error, info, warn};
use std::{process, sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;

/* How long to wait before trying again when the meter did not answer at startup */
const SETUP_RETRY: Duration = Duration::from_secs(60);

fn spawn_event_logger(coordinator: &Arc<PollCoordinator<SerialConnector>>) {
    let mut events = coordinator.subscribe();
    let registers = coordinator.registers().to_vec();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PollEvent::Updated(snapshot)) => {
                    for register in registers.iter() {
                        if let Some(reading) = snapshot.get(register.command) {
                            info!("{}: {} {}", register.name, reading.value, reading.unit);
                        }
                    }
                }
                Ok(PollEvent::UpdateFailed) => warn!("Poll cycle failed, keeping the last readings"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    });
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("K2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let coordinator = match PollCoordinator::from_config(&config.meter) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Invalid meter configuration: {e}");
            process::exit(1);
        }
    };

    /* Consumers subscribe before the first refresh so they see its result, too */
    spawn_event_logger(&coordinator);

    #[cfg(feature = "mqtt")]
    {
        if let Some(mqtt_config) = &config.mqtt {
            let mqtt = kamstrup2mqtt::MqttManager::new(mqtt_config, &config.meter.name, coordinator.registers());
            let events = coordinator.subscribe();
            tokio::spawn(async move {
                mqtt.start_thread(events).await;
            });
        } else {
            info!("No MQTT broker configured, readings are only logged");
        }
    }

    let integration = loop {
        let setup = Integration::setup(coordinator.clone());
        tokio::pin!(setup);

        /* an interrupted initial refresh still finishes the register on the wire */
        let result = tokio::select! {
            result = &mut setup => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted during the initial refresh");
                coordinator.cancel();
                setup.await
            }
        };

        if coordinator.is_cancelled() {
            if let Ok(integration) = result {
                integration.unload().await;
            }
            return;
        }

        match result {
            Ok(integration) => break integration,
            Err(SetupError::NotReady(name)) => {
                warn!("Meter {name} is not ready, trying again in {:?}", SETUP_RETRY);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted while waiting for the meter");
                        return;
                    }
                    _ = tokio::time::sleep(SETUP_RETRY) => {}
                }
            }
            Err(e) => {
                error!("Setup failed: {e}");
                process::exit(1);
            }
        }
    };

    info!("Meter {} is polled every {:?}, waiting for a signal to exit", config.meter.name, coordinator.scan_interval());
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for the shutdown signal: {e}");
    }

    integration.unload().await;
}
