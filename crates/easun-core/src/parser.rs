use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::dispatcher::Command;
use crate::error::{ClientError, Result};
use crate::snapshot::{
    Battery, Grid, Output, Pv, PvString, RatingInfo, SnapshotParts, SystemStatus,
};

type EnumTable = &'static [(&'static str, &'static str)];

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Float,
    Integer,
    Text,
    Enum(EnumTable),
}

#[derive(Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub unit: Option<&'static str>,
}

#[derive(Debug)]
pub struct Schema {
    pub command: Command,
    pub version: u8,
    /// Fields a reply must carry; trailing fields past this are optional.
    pub required: usize,
    pub fields: &'static [FieldSpec],
}

const fn f(name: &'static str, kind: FieldKind, unit: Option<&'static str>) -> FieldSpec {
    FieldSpec { name, kind, unit }
}

const FLOAT: FieldKind = FieldKind::Float;
const INT: FieldKind = FieldKind::Integer;
const TEXT: FieldKind = FieldKind::Text;

pub static LIVE_METRICS: Schema = Schema {
    command: Command::LiveMetrics,
    version: 1,
    required: 20,
    fields: &[
        f("grid_voltage", FLOAT, Some("V")),
        f("grid_frequency", FLOAT, Some("Hz")),
        f("output_voltage", FLOAT, Some("V")),
        f("output_frequency", FLOAT, Some("Hz")),
        f("apparent_power", INT, Some("VA")),
        f("active_power", INT, Some("W")),
        f("load_percent", INT, Some("%")),
        f("bus_voltage", FLOAT, Some("V")),
        f("battery_voltage", FLOAT, Some("V")),
        f("battery_current", FLOAT, Some("A")),
        f("battery_soc", INT, Some("%")),
        f("battery_temperature", INT, Some("°C")),
        f("pv_current", FLOAT, Some("A")),
        f("pv_voltage", FLOAT, Some("V")),
        f("scc_battery_voltage", FLOAT, Some("V")),
        f("battery_discharge_current", FLOAT, Some("A")),
        f("device_status", TEXT, None),
        f("fan_voltage_offset", INT, None),
        f("eeprom_version", TEXT, None),
        f("pv_charge_power", INT, Some("W")),
        f("device_status_2", TEXT, None),
    ],
};

pub static SECONDARY_PV: Schema = Schema {
    command: Command::SecondaryPv,
    version: 1,
    required: 3,
    fields: &[
        f("pv2_current", FLOAT, Some("A")),
        f("pv2_voltage", FLOAT, Some("V")),
        f("pv2_power", INT, Some("W")),
    ],
};

const BATTERY_TYPES: EnumTable = &[("0", "AGM"), ("1", "Flooded"), ("2", "User")];
const INPUT_VOLTAGE_RANGES: EnumTable = &[("0", "Appliance"), ("1", "UPS")];
const OUTPUT_SOURCE_PRIORITIES: EnumTable = &[
    ("0", "UtilitySolarBat"),
    ("1", "SolarUtilityBat"),
    ("2", "SolarBatUtility"),
];
const CHARGER_SOURCE_PRIORITIES: EnumTable = &[
    ("1", "Solar first"),
    ("2", "Solar + Utility"),
    ("3", "Only solar charging permitted"),
];
const MACHINE_TYPES: EnumTable = &[("00", "Grid tie"), ("01", "Off Grid"), ("10", "Hybrid")];
const TOPOLOGIES: EnumTable = &[("0", "transformerless"), ("1", "transformer")];
const OUTPUT_MODES: EnumTable = &[
    ("00", "single machine output"),
    ("01", "parallel output"),
    ("02", "Phase 1 of 3 Phase output"),
    ("03", "Phase 2 of 3 Phase output"),
    ("04", "Phase 3 of 3 Phase output"),
    ("05", "Phase 1 of 2 Phase output"),
    ("06", "Phase 2 of 2 Phase output (120°)"),
    ("07", "Phase 2 of 2 Phase output (180°)"),
];

pub static DEVICE_RATING: Schema = Schema {
    command: Command::DeviceRating,
    version: 1,
    required: 27,
    fields: &[
        f("Grid Rating Voltage", FLOAT, Some("V")),
        f("Grid Rating Current", FLOAT, Some("A")),
        f("AC Output Rating Voltage", FLOAT, Some("V")),
        f("AC Output Rating Frequency", FLOAT, Some("Hz")),
        f("AC Output Rating Current", FLOAT, Some("A")),
        f("AC Output Rating Apparent Power", INT, Some("VA")),
        f("AC Output Rating Active Power", INT, Some("W")),
        f("Battery Rating Voltage", FLOAT, Some("V")),
        f("Battery Re-Charge Voltage", FLOAT, Some("V")),
        f("Battery Under Voltage", FLOAT, Some("V")),
        f("Battery Bulk Voltage", FLOAT, Some("V")),
        f("Battery Float Voltage", FLOAT, Some("V")),
        f("Battery Type", FieldKind::Enum(BATTERY_TYPES), None),
        f("Max AC Charging Current", INT, Some("A")),
        f("Max Charging Current", INT, Some("A")),
        f("Input Voltage Range", FieldKind::Enum(INPUT_VOLTAGE_RANGES), None),
        f("Output Source Priority", FieldKind::Enum(OUTPUT_SOURCE_PRIORITIES), None),
        f("Charger Source Priority", FieldKind::Enum(CHARGER_SOURCE_PRIORITIES), None),
        f("Parallel Max Num", INT, None),
        f("Machine Type", FieldKind::Enum(MACHINE_TYPES), None),
        f("Topology", FieldKind::Enum(TOPOLOGIES), None),
        f("Output Mode", FieldKind::Enum(OUTPUT_MODES), None),
        f("Battery Re-Discharge Voltage", FLOAT, Some("V")),
        f("PV OK Condition", TEXT, None),
        f("PV Power Balance", TEXT, None),
        f("Max Charging Time at CV Stage", INT, Some("min")),
        f("Max Discharging Current", INT, Some("A")),
    ],
};

pub struct Fields<'a> {
    schema: &'static Schema,
    values: Vec<&'a str>,
}

fn strip_parens(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '(' || c == ')')
}

impl Schema {
    pub fn split<'a>(&'static self, raw: &'a str) -> Result<Fields<'a>> {
        let values: Vec<&str> = strip_parens(raw).split_whitespace().collect();
        if values.len() < self.required {
            return Err(ClientError::parse(format!(
                "{} reply has {} fields, schema v{} requires {}",
                self.command,
                values.len(),
                self.version,
                self.required
            )));
        }
        Ok(Fields {
            schema: self,
            values,
        })
    }
}

impl<'a> Fields<'a> {
    pub fn text(&self, name: &str) -> Result<&'a str> {
        let position = self
            .schema
            .fields
            .iter()
            .position(|spec| spec.name == name)
            .ok_or_else(|| {
                ClientError::parse(format!("{} schema has no field {name}", self.schema.command))
            })?;
        self.values.get(position).copied().ok_or_else(|| {
            ClientError::parse(format!("{} reply lacks field {name}", self.schema.command))
        })
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        let text = self.text(name)?;
        text.parse::<f64>().map_err(|_| {
            ClientError::parse(format!(
                "{} field {name} is not numeric: {text:?}",
                self.schema.command
            ))
        })
    }

    /// Integers are reported with or without decimals; the fraction is dropped.
    pub fn int(&self, name: &str) -> Result<i64> {
        Ok(self.float(name)?.trunc() as i64)
    }

    pub fn formatted(&self) -> BTreeMap<String, String> {
        self.schema
            .fields
            .iter()
            .zip(self.values.iter().copied())
            .map(|(spec, value)| {
                let rendered = match (spec.kind, spec.unit) {
                    (FieldKind::Enum(table), _) => lookup(table, value).unwrap_or(value).to_string(),
                    (_, Some(unit)) => format!("{value} {unit}"),
                    (_, None) => value.to_string(),
                };
                (spec.name.to_string(), rendered)
            })
            .collect()
    }
}

fn lookup(table: EnumTable, key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveMetrics {
    pub grid_voltage: f64,
    pub grid_frequency: f64,
    pub output_voltage: f64,
    pub output_frequency: f64,
    pub apparent_power: i32,
    pub active_power: i32,
    pub load_percent: u32,
    pub bus_voltage: f64,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub battery_soc: u32,
    pub battery_temperature: i32,
    pub pv_current: f64,
    pub pv_voltage: f64,
    pub pv_charge_power: i32,
}

pub fn parse_live_metrics(raw: &str) -> Result<LiveMetrics> {
    let fields = LIVE_METRICS.split(raw)?;
    Ok(LiveMetrics {
        grid_voltage: fields.float("grid_voltage")?,
        grid_frequency: fields.float("grid_frequency")?,
        output_voltage: fields.float("output_voltage")?,
        output_frequency: fields.float("output_frequency")?,
        apparent_power: fields.int("apparent_power")? as i32,
        active_power: fields.int("active_power")? as i32,
        load_percent: fields.int("load_percent")?.max(0) as u32,
        bus_voltage: fields.float("bus_voltage")?,
        battery_voltage: fields.float("battery_voltage")?,
        battery_current: fields.float("battery_current")?,
        battery_soc: fields.int("battery_soc")?.max(0) as u32,
        battery_temperature: fields.int("battery_temperature")? as i32,
        pv_current: fields.float("pv_current")?,
        pv_voltage: fields.float("pv_voltage")?,
        pv_charge_power: fields.int("pv_charge_power")? as i32,
    })
}

pub fn parse_secondary_pv(raw: &str) -> Result<PvString> {
    let fields = SECONDARY_PV.split(raw)?;
    Ok(PvString {
        current: fields.float("pv2_current")?,
        voltage: fields.float("pv2_voltage")?,
        power: fields.int("pv2_power")? as i32,
    })
}

const MODE_NAMES: EnumTable = &[
    ("P", "Power On Mode"),
    ("S", "Standby Mode"),
    ("L", "Line Mode"),
    ("B", "Battery Mode"),
    ("F", "Fault Mode"),
    ("H", "Power Saving Mode"),
];

pub fn parse_mode(raw: &str) -> (String, String) {
    let code = strip_parens(raw).trim();
    let name = match lookup(MODE_NAMES, code) {
        Some(name) => name.to_string(),
        None => format!("Unknown ({code})"),
    };
    (code.to_string(), name)
}

pub fn parse_device_rating(raw: &str) -> RatingInfo {
    match DEVICE_RATING.split(raw) {
        Ok(fields) => RatingInfo::Table(fields.formatted()),
        Err(_) => RatingInfo::Invalid {
            reason: "Invalid QPIRI response".to_string(),
        },
    }
}

pub const MIN_WARNING_BITS: usize = 32;
pub const NO_WARNINGS: &str = "No warnings";

const WARNING_BITS: &[(usize, &str)] = &[
    (0, "Reserved"),
    (1, "Inverter fault"),
    (2, "Bus over"),
    (3, "Bus under"),
    (4, "Bus soft fail"),
    (5, "Line fail"),
    (6, "OPV short"),
    (7, "Inverter voltage low"),
    (8, "Inverter voltage high"),
    (9, "Inverter soft fail"),
    (10, "Inverter over current"),
    (11, "Inverter over load"),
    (12, "Inverter over temperature"),
    (13, "Fan locked"),
    (14, "Battery voltage high"),
    (15, "Battery low alarm"),
    (17, "Battery under shutdown"),
    (19, "Over load"),
    (20, "EEPROM fault"),
    (21, "Inverter over current"),
    (22, "Inverter soft fail"),
    (23, "Self test fail"),
    (24, "OP DC voltage over"),
    (25, "Battery open"),
    (26, "Current sensor fail"),
    (27, "Battery short"),
    (28, "Power limit"),
    (29, "PV voltage high"),
    (30, "MPPT overload fault"),
    (31, "MPPT overload warning"),
    (32, "Battery too low to charge"),
];

/// Active warning names in bit order; never empty.
pub fn parse_warnings(raw: &str) -> Vec<String> {
    let bits = strip_parens(raw).as_bytes();
    if bits.len() < MIN_WARNING_BITS {
        return vec!["Invalid QPIWS response".to_string()];
    }

    let active: Vec<String> = WARNING_BITS
        .iter()
        .filter(|(idx, _)| bits.get(*idx) == Some(&b'1'))
        .map(|(_, name)| name.to_string())
        .collect();

    if active.is_empty() {
        vec![NO_WARNINGS.to_string()]
    } else {
        active
    }
}

fn centi_hz(hz: f64) -> u32 {
    (hz * 100.0).round().max(0.0) as u32
}

pub fn assemble(
    live: &str,
    secondary_pv: &str,
    mode: &str,
    rating: &str,
    warnings: &str,
    now: DateTime<Utc>,
) -> Result<SnapshotParts> {
    let live = parse_live_metrics(live)?;
    let pv2 = parse_secondary_pv(secondary_pv)?;
    let (mode_code, mode_name) = parse_mode(mode);

    let battery = Battery {
        voltage: live.battery_voltage,
        current: live.battery_current,
        power: (live.battery_voltage * live.battery_current).round() as i32,
        state_of_charge: live.battery_soc,
        temperature: live.battery_temperature,
    };

    let pv1 = PvString {
        voltage: live.pv_voltage,
        current: live.pv_current,
        power: (live.pv_voltage * live.pv_current).round() as i32,
    };
    let pv = Pv {
        total_power: live.pv_charge_power,
        charging_power: live.pv_charge_power,
        charging_current: live.pv_current,
        temperature: 0.0,
        strings: vec![pv1, pv2],
        energy_today: 0.0,
        energy_total: 0.0,
    };

    let grid = Grid {
        voltage: live.grid_voltage,
        power: live.active_power,
        frequency: centi_hz(live.grid_frequency),
    };

    let output_current = if live.output_voltage != 0.0 {
        live.active_power as f64 / live.output_voltage
    } else {
        0.0
    };
    let output = Output {
        voltage: live.output_voltage,
        current: output_current,
        power: live.active_power,
        apparent_power: live.apparent_power,
        load_percent: live.load_percent,
        frequency: centi_hz(live.output_frequency),
    };

    let system = SystemStatus {
        mode_code,
        mode_name,
        device_time: now,
        info: Some(parse_device_rating(rating)),
        warnings: Some(parse_warnings(warnings)),
    };

    Ok(SnapshotParts {
        battery: Some(battery),
        pv: Some(pv),
        grid: Some(grid),
        output: Some(output),
        system: Some(system),
    })
}
