use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::client::InverterClient;
use crate::codec::{framed, parse_read_response, round_trip, FrameTransport, Request};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::profile::{RegisterGroup, RegisterMap};
use crate::snapshot::{Battery, Grid, Output, Pv, PvString, SnapshotParts, SystemStatus};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterValues(BTreeMap<&'static str, f64>);

impl RegisterValues {
    pub fn insert_group(&mut self, group: &RegisterGroup, words: &[u16]) {
        for field in group.fields {
            if let Some(&raw) = words.get(field.offset as usize) {
                self.0.insert(field.key, field.decode(raw));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }
}

pub struct RegisterClient {
    model: String,
    target: SocketAddrV4,
    map: &'static RegisterMap,
    connect_timeout: Duration,
    reply_timeout: Duration,
    transport: Option<FrameTransport>,
    next_transaction: u16,
}

impl RegisterClient {
    pub fn new(config: &ClientConfig, map: &'static RegisterMap) -> Self {
        Self {
            model: config.model.clone(),
            target: SocketAddrV4::new(config.inverter, config.register_port),
            map,
            connect_timeout: config.connect_timeout,
            reply_timeout: config.reply_timeout,
            transport: None,
            next_transaction: 0,
        }
    }

    async fn transport(&mut self) -> Result<&mut FrameTransport> {
        if self.transport.is_none() {
            let stream = match timeout(self.connect_timeout, TcpStream::connect(self.target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    return Err(ClientError::connection(format!(
                        "connect to {} failed: {err}",
                        self.target
                    )))
                }
                Err(_) => {
                    return Err(ClientError::connection(format!(
                        "connect to {} timed out after {:?}",
                        self.target, self.connect_timeout
                    )))
                }
            };
            debug!(target = %self.target, "register connection established");
            self.transport = Some(framed(stream));
        }
        self.transport
            .as_mut()
            .ok_or_else(|| ClientError::connection("register connection missing"))
    }

    pub async fn read_group(&mut self, group: &RegisterGroup) -> Result<Vec<u16>> {
        let transaction_id = self.next_transaction;
        self.next_transaction = transaction_id.wrapping_add(1);
        let unit_id = self.map.unit_id;
        let request = Request::ReadRegisters {
            transaction_id,
            unit_id,
            address: group.address,
            count: group.count,
        };
        let reply_timeout = self.reply_timeout;

        let transport = self.transport().await?;
        let frame = round_trip(transport, request, reply_timeout).await?;
        let words =
            parse_read_response(&frame.header, &frame.body, transaction_id, unit_id, group.count)?;
        debug!(group = group.name, address = group.address, ?words, "registers");
        Ok(words)
    }

    pub async fn read_all(&mut self) -> Result<RegisterValues> {
        let mut values = RegisterValues::default();
        for group in self.map.groups {
            let words = self.read_group(group).await?;
            values.insert_group(group, &words);
        }
        Ok(values)
    }

    async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = SinkExt::<Request>::close(&mut transport).await {
                debug!(%err, "register connection shutdown");
            }
        }
    }
}

#[async_trait]
impl InverterClient for RegisterClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn fetch(&mut self) -> Result<SnapshotParts> {
        let values = self.read_all().await;
        self.disconnect().await;
        let parts = build_parts(&values?, Utc::now());
        info!(model = %self.model, "register poll complete");
        Ok(parts)
    }

    async fn close(&mut self) {
        self.disconnect().await;
    }
}

const MODE_NAMES: &[(u16, &str)] = &[(2, "SUB"), (3, "SBU")];

fn device_time(values: &RegisterValues) -> Option<DateTime<Utc>> {
    let part = |key: &str| values.get(key).map(|v| v as u32);
    let year = part("clock_year")?;
    let year = if year < 100 { 2000 + year } else { year };
    let naive = NaiveDate::from_ymd_opt(year as i32, part("clock_month")?, part("clock_day")?)?
        .and_hms_opt(part("clock_hour")?, part("clock_minute")?, part("clock_second")?)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Maps decoded registers onto the snapshot shape. A sub-record is left out
/// when any of its registers is missing.
pub fn build_parts(values: &RegisterValues, now: DateTime<Utc>) -> SnapshotParts {
    let v = |key: &str| values.get(key);

    let battery = (|| {
        Some(Battery {
            voltage: v("battery_voltage")?,
            current: v("battery_current")?,
            power: v("battery_power")?.round() as i32,
            state_of_charge: v("battery_soc")? as u32,
            temperature: v("battery_temperature")?.round() as i32,
        })
    })();

    let pv_string = |prefix: &str| {
        Some(PvString {
            voltage: v(format!("{prefix}_voltage").as_str())?,
            current: v(format!("{prefix}_current").as_str())?,
            power: v(format!("{prefix}_power").as_str())?.round() as i32,
        })
    };
    let pv = (|| {
        Some(Pv {
            total_power: v("pv_total_power")?.round() as i32,
            charging_power: v("pv_charging_power")?.round() as i32,
            charging_current: v("pv_charging_current")?,
            temperature: v("pv_temperature")?,
            strings: vec![pv_string("pv1")?, pv_string("pv2")?],
            energy_today: v("pv_energy_today")?,
            energy_total: v("pv_energy_total")?,
        })
    })();

    let frequency = v("frequency").map(|hz| hz.round() as u32);
    let grid = (|| {
        Some(Grid {
            voltage: v("grid_voltage")?,
            power: v("grid_power")?.round() as i32,
            frequency: frequency?,
        })
    })();
    let output = (|| {
        Some(Output {
            voltage: v("output_voltage")?,
            current: v("output_current")?,
            power: v("output_power")?.round() as i32,
            apparent_power: v("output_apparent_power")?.round() as i32,
            load_percent: v("output_load_percent")? as u32,
            frequency: frequency?,
        })
    })();

    let system = v("operating_mode").map(|raw| {
        let code = raw as u16;
        let mode_name = MODE_NAMES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| format!("Unknown ({code})"));
        SystemStatus {
            mode_code: code.to_string(),
            mode_name,
            device_time: device_time(values).unwrap_or(now),
            info: None,
            warnings: None,
        }
    });

    SnapshotParts {
        battery,
        pv,
        grid,
        output,
        system,
    }
}
