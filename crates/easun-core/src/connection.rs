use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use futures::SinkExt;
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{framed, FrameTransport, Request};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Negotiating,
    Connected,
    Closing,
}

pub fn connect_back_request(local: SocketAddrV4) -> String {
    format!("set>server={}:{};", local.ip(), local.port())
}

pub struct Session {
    state: SessionState,
    listener: Option<TcpListener>,
    transport: Option<FrameTransport>,
    /// Holds the listener once connected and turns away further inbound
    /// connections.
    gatekeeper: Option<JoinHandle<()>>,
    next_transaction: u16,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            listener: None,
            transport: None,
            gatekeeper: None,
            next_transaction: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Wraps at 2^16 and survives reconnects.
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction;
        self.next_transaction = id.wrapping_add(1);
        id
    }

    pub async fn listen(&mut self, bind: SocketAddrV4) -> Result<SocketAddrV4> {
        if self.state != SessionState::Disconnected {
            return Err(ClientError::connection(format!(
                "cannot listen while {:?}",
                self.state
            )));
        }

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|err| ClientError::connection(format!("listen on {bind} failed: {err}")))?;
        let bound = match listener.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(ClientError::connection(format!(
                    "listener bound to non-IPv4 address {addr}"
                )))
            }
        };

        debug!(%bound, "listening for inverter connect-back");
        self.listener = Some(listener);
        self.state = SessionState::Negotiating;
        Ok(bound)
    }

    pub async fn accept(&mut self, wait: Duration) -> Result<SocketAddr> {
        let Some(listener) = self.listener.take() else {
            return Err(ClientError::connection(format!(
                "cannot accept while {:?}",
                self.state
            )));
        };

        let (stream, peer) = match timeout(wait, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(err)) => {
                self.state = SessionState::Disconnected;
                return Err(ClientError::connection(format!("accept failed: {err}")));
            }
            Err(_) => {
                self.state = SessionState::Disconnected;
                return Err(ClientError::connection(format!(
                    "inverter did not connect back within {wait:?}"
                )));
            }
        };

        info!(%peer, "inverter connected back");
        self.transport = Some(framed(stream));
        self.gatekeeper = Some(tokio::spawn(reject_extra_connections(listener)));
        self.state = SessionState::Connected;
        Ok(peer)
    }

    pub fn transport(&mut self) -> Result<&mut FrameTransport> {
        match (self.state, self.transport.as_mut()) {
            (SessionState::Connected, Some(transport)) => Ok(transport),
            (state, _) => Err(ClientError::connection(format!(
                "no active session ({state:?})"
            ))),
        }
    }

    pub async fn close(&mut self) {
        if self.state == SessionState::Disconnected && self.listener.is_none() {
            return;
        }

        self.state = SessionState::Closing;
        if let Some(gatekeeper) = self.gatekeeper.take() {
            gatekeeper.abort();
        }
        self.listener = None;
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = SinkExt::<Request>::close(&mut transport).await {
                debug!(%err, "session shutdown");
            }
        }
        self.state = SessionState::Disconnected;
        debug!("session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(gatekeeper) = self.gatekeeper.take() {
            gatekeeper.abort();
        }
    }
}

async fn reject_extra_connections(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                warn!(%peer, "rejecting extra inbound connection");
                drop(stream);
            }
            Err(err) => {
                debug!(%err, "connect-back listener stopped");
                return;
            }
        }
    }
}

pub struct ConnectionManager {
    inverter: SocketAddrV4,
    bind: SocketAddrV4,
    connect_timeout: Duration,
    session: Mutex<Session>,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            inverter: SocketAddrV4::new(config.inverter, config.discovery_port),
            bind: SocketAddrV4::new(config.local, config.server_port),
            connect_timeout: config.connect_timeout,
            session: Mutex::new(Session::new()),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    /// Locks the session, negotiating a new one first if needed.
    pub async fn connected(&self) -> Result<MutexGuard<'_, Session>> {
        let mut session = self.session.lock().await;
        if session.state() != SessionState::Connected {
            if let Err(err) = self.negotiate(&mut session).await {
                session.close().await;
                return Err(err);
            }
        }
        Ok(session)
    }

    async fn negotiate(&self, session: &mut Session) -> Result<()> {
        session.close().await;
        let advertised = session.listen(self.bind).await?;

        let request = connect_back_request(advertised);
        let udp = UdpSocket::bind(SocketAddrV4::new(*self.bind.ip(), 0))
            .await
            .map_err(|err| ClientError::connection(format!("udp bind failed: {err}")))?;
        let inverter = self.inverter;
        udp.send_to(request.as_bytes(), inverter)
            .await
            .map_err(|err| {
                ClientError::connection(format!("connect-back request to {inverter} failed: {err}"))
            })?;
        debug!(inverter = %self.inverter, %request, "sent connect-back request");

        session.accept(self.connect_timeout).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.session.lock().await.close().await;
    }
}
