use async_trait::async_trait;
use tracing::info;

use crate::config::ClientConfig;
use crate::dispatcher::TextualClient;
use crate::error::Result;
use crate::profile::{DeviceProfile, Protocol};
use crate::register::RegisterClient;
use crate::snapshot::SnapshotParts;

#[async_trait]
pub trait InverterClient: Send {
    fn model(&self) -> &str;
    /// Runs one full poll cycle. Connections opened for the cycle are closed
    /// before returning, whatever the outcome.
    async fn fetch(&mut self) -> Result<SnapshotParts>;
    async fn close(&mut self);
}

pub enum Inverter {
    Register(RegisterClient),
    Textual(TextualClient),
}

impl Inverter {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let profile = DeviceProfile::lookup(&config.model)?;
        info!(
            model = profile.key,
            name = profile.name,
            inverter = %config.inverter,
            local = %config.local,
            "inverter client initialized"
        );
        Ok(match profile.protocol {
            Protocol::Register(map) => Self::Register(RegisterClient::new(config, map)),
            Protocol::Textual => Self::Textual(TextualClient::new(config)),
        })
    }
}

#[async_trait]
impl InverterClient for Inverter {
    fn model(&self) -> &str {
        match self {
            Self::Register(client) => client.model(),
            Self::Textual(client) => client.model(),
        }
    }

    async fn fetch(&mut self) -> Result<SnapshotParts> {
        match self {
            Self::Register(client) => client.fetch().await,
            Self::Textual(client) => client.fetch().await,
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Register(client) => client.close().await,
            Self::Textual(client) => client.close().await,
        }
    }
}
