use std::time::Duration;

use serde::Serialize;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeviceProfile {
    pub key: &'static str,
    pub name: &'static str,
    pub protocol: Protocol,
    #[serde(skip)]
    pub default_poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum Protocol {
    Register(&'static RegisterMap),
    Textual,
}

#[derive(Debug, Serialize)]
pub struct RegisterMap {
    pub unit_id: u8,
    pub groups: &'static [RegisterGroup],
}

#[derive(Debug, Serialize)]
pub struct RegisterGroup {
    pub name: &'static str,
    pub address: u16,
    pub count: u16,
    pub fields: &'static [RegisterField],
}

#[derive(Debug, Serialize)]
pub struct RegisterField {
    pub key: &'static str,
    /// Offset from the group's start address.
    pub offset: u16,
    pub scale: f64,
    pub decoder: Decoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decoder {
    Unsigned,
    Signed,
}

impl RegisterField {
    pub fn decode(&self, raw: u16) -> f64 {
        let value = match self.decoder {
            Decoder::Unsigned => raw as f64,
            Decoder::Signed => raw as i16 as f64,
        };
        value * self.scale
    }
}

const fn field(key: &'static str, offset: u16, scale: f64, decoder: Decoder) -> RegisterField {
    RegisterField {
        key,
        offset,
        scale,
        decoder,
    }
}

const fn raw(key: &'static str, offset: u16) -> RegisterField {
    field(key, offset, 1.0, Decoder::Unsigned)
}

const fn tenths(key: &'static str, offset: u16) -> RegisterField {
    field(key, offset, 0.1, Decoder::Unsigned)
}

static ISOLAR_SMG_II: RegisterMap = RegisterMap {
    unit_id: 1,
    groups: &[
        RegisterGroup {
            name: "status",
            address: 201,
            count: 1,
            fields: &[raw("operating_mode", 0)],
        },
        RegisterGroup {
            name: "battery",
            address: 277,
            count: 5,
            fields: &[
                tenths("battery_voltage", 0),
                field("battery_current", 1, 0.1, Decoder::Signed),
                field("battery_power", 2, 1.0, Decoder::Signed),
                raw("battery_soc", 3),
                field("battery_temperature", 4, 1.0, Decoder::Signed),
            ],
        },
        RegisterGroup {
            name: "pv",
            address: 302,
            count: 4,
            fields: &[
                raw("pv_total_power", 0),
                raw("pv_charging_power", 1),
                tenths("pv_charging_current", 2),
                raw("pv_temperature", 3),
            ],
        },
        RegisterGroup {
            name: "grid",
            address: 338,
            count: 3,
            fields: &[
                tenths("grid_voltage", 0),
                field("grid_current", 1, 0.1, Decoder::Signed),
                field("grid_power", 2, 1.0, Decoder::Signed),
            ],
        },
        RegisterGroup {
            name: "output",
            address: 346,
            count: 5,
            fields: &[
                tenths("output_voltage", 0),
                tenths("output_current", 1),
                raw("output_power", 2),
                raw("output_apparent_power", 3),
                raw("output_load_percent", 4),
            ],
        },
        RegisterGroup {
            name: "pv1",
            address: 351,
            count: 3,
            fields: &[
                tenths("pv1_voltage", 0),
                tenths("pv1_current", 1),
                raw("pv1_power", 2),
            ],
        },
        RegisterGroup {
            name: "pv2",
            address: 389,
            count: 3,
            fields: &[
                tenths("pv2_voltage", 0),
                tenths("pv2_current", 1),
                raw("pv2_power", 2),
            ],
        },
        RegisterGroup {
            name: "frequency",
            address: 607,
            count: 1,
            fields: &[raw("frequency", 0)],
        },
        RegisterGroup {
            name: "clock",
            address: 696,
            count: 6,
            fields: &[
                raw("clock_year", 0),
                raw("clock_month", 1),
                raw("clock_day", 2),
                raw("clock_hour", 3),
                raw("clock_minute", 4),
                raw("clock_second", 5),
            ],
        },
        RegisterGroup {
            name: "energy",
            address: 702,
            count: 2,
            fields: &[
                field("pv_energy_today", 0, 0.01, Decoder::Unsigned),
                field("pv_energy_total", 1, 0.01, Decoder::Unsigned),
            ],
        },
    ],
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

static PROFILES: [DeviceProfile; 4] = [
    DeviceProfile {
        key: "ISOLAR_SMG_II_11K",
        name: "iSolar SMG II 11K",
        protocol: Protocol::Register(&ISOLAR_SMG_II),
        default_poll_interval: DEFAULT_POLL_INTERVAL,
    },
    DeviceProfile {
        key: "ISOLAR_SMG_II_8K",
        name: "iSolar SMG II 8K",
        protocol: Protocol::Register(&ISOLAR_SMG_II),
        default_poll_interval: DEFAULT_POLL_INTERVAL,
    },
    DeviceProfile {
        key: "EASUN_SMW_8K",
        name: "EASUN SMW 8K",
        protocol: Protocol::Textual,
        default_poll_interval: DEFAULT_POLL_INTERVAL,
    },
    DeviceProfile {
        key: "EASUN_SMW_11K",
        name: "EASUN SMW 11K",
        protocol: Protocol::Textual,
        default_poll_interval: DEFAULT_POLL_INTERVAL,
    },
];

impl DeviceProfile {
    pub fn all() -> &'static [DeviceProfile] {
        &PROFILES
    }

    pub fn lookup(model: &str) -> Result<&'static DeviceProfile> {
        PROFILES.iter().find(|p| p.key == model).ok_or_else(|| {
            let known = PROFILES.iter().map(|p| p.key).collect::<Vec<_>>().join(", ");
            ClientError::Config(format!("unknown model {model:?}, expected one of: {known}"))
        })
    }
}
