use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::broadcast::{error::RecvError, Receiver};

use crate::config::MqttConfig;
use crate::coordinator::{PollEvent, Snapshot};
use crate::kamstrup::registers::Register;

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

/// Republishes every poll result of one meter to MQTT.
pub struct MqttManager {
    client: AsyncClient,
    registers: Vec<Register>,
    state_topic: String,
    availability_topic: String,
}

impl MqttManager {
    pub fn new(config: &MqttConfig, meter_name: &str, registers: &[Register]) -> Self {
        info!("MQTT connection starting up");

        let state_topic = format!("{}/{}/state", config.base_topic, meter_name);
        let availability_topic = format!("{}/{}/availability", config.base_topic, meter_name);

        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            mqttoptions.set_credentials(user.clone(), pass.clone());
        }
        /* the broker marks us offline if we vanish */
        mqttoptions.set_last_will(LastWill::new(availability_topic.clone(), OFFLINE, QoS::AtLeastOnce, true));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return MqttManager {
            client,
            registers: registers.to_vec(),
            state_topic,
            availability_topic,
        };
    }

    pub async fn start_thread(&self, mut events: Receiver<PollEvent>) {
        loop {
            match events.recv().await {
                Ok(PollEvent::Updated(snapshot)) => {
                    let payload = Value::Object(state_payload(&self.registers, &snapshot));
                    match self.client.publish(self.state_topic.clone(), QoS::AtLeastOnce, false, payload.to_string()).await {
                        Err(e) => error!("Error sending: {}", e),
                        Ok(_) => debug!("Published {} readings to {}", snapshot.len(), self.state_topic),
                    }
                    self.publish_availability(true).await;
                }
                Ok(PollEvent::UpdateFailed) => {
                    self.publish_availability(false).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("MQTT publisher fell behind, {skipped} poll results skipped");
                }
                Err(RecvError::Closed) => {
                    info!("Coordinator is gone, MQTT thread exits");
                    return;
                }
            }
        }
    }

    async fn publish_availability(&self, online: bool) {
        let payload = if online { ONLINE } else { OFFLINE };
        if let Err(e) = self.client.publish(self.availability_topic.clone(), QoS::AtLeastOnce, true, payload).await {
            error!("Error publishing availability: {}", e);
        }
    }
}

/// Flat JSON state: `{key: value, key_unit: unit, ..., timestamp}` for every
/// register contained in the snapshot.
pub fn state_payload(registers: &[Register], snapshot: &Snapshot) -> Map<String, Value> {
    let mut values = Map::new();

    for register in registers {
        if let Some(reading) = snapshot.get(register.command) {
            values.insert(register.key.clone(), Value::from(reading.value));
            values.insert(format!("{}_unit", register.key), Value::from(reading.unit.clone()));
        }
    }

    values.insert("timestamp".to_string(), Value::from(snapshot.taken_at.to_rfc3339()));
    values
}
