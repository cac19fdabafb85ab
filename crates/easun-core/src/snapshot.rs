use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub captured_at: DateTime<Utc>,
    pub model: String,
    pub battery: Battery,
    pub pv: Pv,
    pub grid: Grid,
    pub output: Output,
    pub system: SystemStatus,
}

mod hz {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(centi_hz: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(f64::from(*centi_hz) / 100.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let hz = f64::deserialize(deserializer)?;
        Ok((hz * 100.0).round().max(0.0) as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub voltage: f64,
    pub current: f64,
    pub power: i32,
    pub state_of_charge: u32,
    pub temperature: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvString {
    pub voltage: f64,
    pub current: f64,
    pub power: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pv {
    pub total_power: i32,
    pub charging_power: i32,
    pub charging_current: f64,
    pub temperature: f64,
    pub strings: Vec<PvString>,
    /// kWh
    pub energy_today: f64,
    /// kWh
    pub energy_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub voltage: f64,
    pub power: i32,
    /// Centi-Hz internally, Hz once serialized.
    #[serde(rename = "frequency_hz", with = "hz")]
    pub frequency: u32,
}

impl Grid {
    pub fn frequency_hz(&self) -> f64 {
        f64::from(self.frequency) / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub voltage: f64,
    pub current: f64,
    pub power: i32,
    pub apparent_power: i32,
    pub load_percent: u32,
    #[serde(rename = "frequency_hz", with = "hz")]
    pub frequency: u32,
}

impl Output {
    pub fn frequency_hz(&self) -> f64 {
        f64::from(self.frequency) / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub mode_code: String,
    pub mode_name: String,
    pub device_time: DateTime<Utc>,
    /// Rating table, only reported by the textual protocol.
    pub info: Option<RatingInfo>,
    /// Active warnings, only reported by the textual protocol.
    pub warnings: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingInfo {
    Table(BTreeMap<String, String>),
    Invalid { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotParts {
    pub battery: Option<Battery>,
    pub pv: Option<Pv>,
    pub grid: Option<Grid>,
    pub output: Option<Output>,
    pub system: Option<SystemStatus>,
}

impl SnapshotParts {
    pub fn is_void(&self) -> bool {
        self.battery.is_none()
            && self.pv.is_none()
            && self.grid.is_none()
            && self.output.is_none()
            && self.system.is_none()
    }

    /// A partial set is `Incomplete`, never a snapshot.
    pub fn into_snapshot(self, model: &str, captured_at: DateTime<Utc>) -> Result<TelemetrySnapshot> {
        if self.is_void() {
            return Err(ClientError::NoData);
        }

        let missing: Vec<&str> = [
            ("battery", self.battery.is_none()),
            ("pv", self.pv.is_none()),
            ("grid", self.grid.is_none()),
            ("output", self.output.is_none()),
            ("system", self.system.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (self.battery, self.pv, self.grid, self.output, self.system) {
            (Some(battery), Some(pv), Some(grid), Some(output), Some(system)) => {
                Ok(TelemetrySnapshot {
                    captured_at,
                    model: model.to_string(),
                    battery,
                    pv,
                    grid,
                    output,
                    system,
                })
            }
            _ => Err(ClientError::Incomplete(missing.join(", "))),
        }
    }
}
