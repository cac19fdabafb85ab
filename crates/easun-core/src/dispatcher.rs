use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::client::InverterClient;
use crate::codec::{decode_textual_reply, round_trip, FrameTransport, Request};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, SessionState};
use crate::error::{ClientError, Result};
use crate::parser;
use crate::snapshot::SnapshotParts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Command {
    DeviceRating,
    LiveMetrics,
    Mode,
    Warnings,
    SecondaryPv,
}

/// Issued in this order on every poll.
pub const POLL_SEQUENCE: [Command; 5] = [
    Command::DeviceRating,
    Command::LiveMetrics,
    Command::Mode,
    Command::Warnings,
    Command::SecondaryPv,
];

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::DeviceRating => "QPIRI",
            Command::LiveMetrics => "QPIGS",
            Command::Mode => "QMOD",
            Command::Warnings => "QPIWS",
            Command::SecondaryPv => "QPIGS2",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub async fn exchange(
    transport: &mut FrameTransport,
    command: Command,
    transaction_id: u16,
    reply_timeout: Duration,
) -> Result<String> {
    let request = Request::Textual {
        command: command.as_str(),
        transaction_id,
    };
    let frame = round_trip(transport, request, reply_timeout).await?;
    let reply = decode_textual_reply(&frame.body)?;
    debug!(%command, transaction_id, %reply, "reply");
    Ok(reply)
}

pub struct TextualClient {
    model: String,
    connection: ConnectionManager,
    command_spacing: Duration,
    reply_timeout: Duration,
}

impl TextualClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            model: config.model.clone(),
            connection: ConnectionManager::new(config),
            command_spacing: config.command_spacing,
            reply_timeout: config.reply_timeout,
        }
    }

    pub async fn session_state(&self) -> SessionState {
        self.connection.state().await
    }

    pub async fn send(&self, command: Command) -> Result<String> {
        let mut session = self.connection.connected().await?;
        let transaction_id = session.next_transaction_id();
        let transport = session.transport()?;
        exchange(transport, command, transaction_id, self.reply_timeout).await
    }

    async fn run_sequence(&self) -> Result<BTreeMap<Command, String>> {
        let mut replies = BTreeMap::new();
        for (idx, command) in POLL_SEQUENCE.into_iter().enumerate() {
            if idx > 0 {
                // Device turnaround; back-to-back commands get dropped or interleaved.
                sleep(self.command_spacing).await;
            }
            let reply = self.send(command).await?;
            replies.insert(command, reply);
        }
        Ok(replies)
    }
}

#[async_trait]
impl InverterClient for TextualClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn fetch(&mut self) -> Result<SnapshotParts> {
        let replies = self.run_sequence().await;
        self.connection.close().await;
        let replies = replies?;

        let reply = |command: Command| {
            replies
                .get(&command)
                .map(String::as_str)
                .ok_or_else(|| ClientError::protocol(format!("no reply to {command}")))
        };

        let parts = parser::assemble(
            reply(Command::LiveMetrics)?,
            reply(Command::SecondaryPv)?,
            reply(Command::Mode)?,
            reply(Command::DeviceRating)?,
            reply(Command::Warnings)?,
            Utc::now(),
        )?;
        info!(model = %self.model, "textual poll complete");
        Ok(parts)
    }

    async fn close(&mut self) {
        self.connection.close().await;
    }
}
