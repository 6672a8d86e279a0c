use lazy_static::lazy_static;
use serde::Serialize;

/// One addressable quantity of the meter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Register {
    /// Stable key used in configuration and in published payloads
    pub key: String,
    pub command: u16,
    pub name: String,
    pub unit: String,
}

impl Register {
    pub fn new(key: &str, command: u16, name: &str, unit: &str) -> Self {
        return Register {
            key: key.to_string(),
            command,
            name: name.to_string(),
            unit: unit.to_string(),
        };
    }
}

lazy_static! {
    /// Registers of the Kamstrup 403 in the order they are polled.
    pub static ref KAMSTRUP_403: Vec<Register> = vec![
        Register::new("heat_energy", 0x003c, "Heat Energy (E1)", "GJ"),
        Register::new("power", 0x0050, "Power", "kW"),
        Register::new("temp1", 0x0056, "Temperature t1", "°C"),
        Register::new("temp2", 0x0057, "Temperature t2", "°C"),
        Register::new("temp_diff", 0x0059, "Temperature difference", "K"),
        Register::new("flow", 0x004a, "Water flow", "l/h"),
        Register::new("volume", 0x0044, "Volume", "m³"),
        Register::new("min_flow_month", 0x008d, "Minimum flow this month", "l/h"),
        Register::new("max_flow_month", 0x008b, "Maximum flow this month", "l/h"),
        Register::new("min_power_month", 0x0091, "Minimum power this month", "kW"),
        Register::new("max_power_month", 0x008f, "Maximum power this month", "kW"),
        Register::new("avg_temp1_month", 0x0095, "Average temperature t1 this month", "°C"),
        Register::new("avg_temp2_month", 0x0096, "Average temperature t2 this month", "°C"),
        Register::new("hour_counter", 0x03ec, "Operating hours", "h"),
    ];
}

pub fn find_register(key: &str) -> Option<&'static Register> {
    KAMSTRUP_403.iter().find(|r| r.key == key)
}
