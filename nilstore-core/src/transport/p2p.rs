//! Peer-to-peer retrieval over libp2p
//!
//! TCP transport, Noise encryption and Yamux multiplexing, with a single
//! request-response behaviour speaking [`FETCH_PROTOCOL`]. The swarm runs on
//! its own task; callers talk to it through [`P2pClient`].

use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId, ProtocolSupport};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{FetchCodec, FetchRequest, FetchResponse, FramingError, FETCH_PROTOCOL};
use super::error::{ErrorClass, TransportError};
use crate::ids::ValidationError;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub fetch: request_response::Behaviour<FetchCodec>,
}

/// Build a swarm speaking the fetch protocol with the given role.
pub fn create_swarm(
    support: ProtocolSupport,
    request_timeout: Duration,
) -> Result<Swarm<Behaviour>, P2PError> {
    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|_| Behaviour {
            fetch: request_response::Behaviour::new(
                [(StreamProtocol::new(FETCH_PROTOCOL), support)],
                request_response::Config::default().with_request_timeout(request_timeout),
            ),
        })
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

/// Split `/ip4/../tcp/../p2p/<peer>` into the peer id and dialable address.
pub fn parse_peer_addr(addr: &str) -> Result<(PeerId, Multiaddr), ValidationError> {
    let mut multiaddr: Multiaddr = addr
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidAddress(addr.to_string()))?;
    match multiaddr.pop() {
        Some(Protocol::P2p(peer)) => Ok((peer, multiaddr)),
        _ => Err(ValidationError::InvalidAddress(format!(
            "{} (missing /p2p/<peer id>)",
            addr
        ))),
    }
}

fn classify_outbound(error: OutboundFailure) -> TransportError {
    match error {
        OutboundFailure::DialFailure => {
            TransportError::new(ErrorClass::ConnectionRefused, "failed to dial peer")
        }
        OutboundFailure::Timeout => TransportError::new(ErrorClass::Timeout, "peer request timed out"),
        OutboundFailure::ConnectionClosed => {
            TransportError::new(ErrorClass::ConnectionRefused, "connection closed before response")
        }
        OutboundFailure::UnsupportedProtocols => TransportError::new(
            ErrorClass::Unknown,
            format!("peer does not support {}", FETCH_PROTOCOL),
        ),
        OutboundFailure::Io(e) => {
            let framing = e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<FramingError>())
                .is_some();
            if framing {
                TransportError::new(ErrorClass::InvalidResponse, e.to_string())
            } else {
                TransportError::new(ErrorClass::Unknown, e.to_string())
            }
        }
        #[allow(unreachable_patterns)]
        other => TransportError::new(ErrorClass::Unknown, other.to_string()),
    }
}

fn into_result(response: FetchResponse) -> Result<FetchResponse, TransportError> {
    if response.is_success() {
        return Ok(response);
    }
    Err(TransportError::http(
        response.status,
        response.error.unwrap_or_default(),
    ))
}

type Reply = oneshot::Sender<Result<FetchResponse, TransportError>>;

enum Command {
    Fetch {
        peer: PeerId,
        addr: Multiaddr,
        request: FetchRequest,
        reply: Reply,
    },
}

/// Handle to the client swarm task. Dropping it stops the swarm.
pub struct P2pClient {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    local_peer_id: PeerId,
}

impl P2pClient {
    pub fn spawn(request_timeout: Duration) -> Result<Self, P2PError> {
        let swarm = create_swarm(ProtocolSupport::Outbound, request_timeout)?;
        let local_peer_id = *swarm.local_peer_id();
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        tokio::spawn(run_swarm(swarm, rx, cancel.clone()));
        info!("P2P client started with peer ID: {}", local_peer_id);

        Ok(Self {
            commands: tx,
            cancel,
            local_peer_id,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Send one fetch request; non-2xx envelopes become transport errors.
    pub async fn fetch(
        &self,
        peer: PeerId,
        addr: Multiaddr,
        request: FetchRequest,
    ) -> Result<FetchResponse, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Fetch {
                peer,
                addr,
                request,
                reply,
            })
            .await
            .map_err(|_| TransportError::new(ErrorClass::Unknown, "p2p client stopped"))?;
        rx.await
            .map_err(|_| TransportError::new(ErrorClass::Unknown, "p2p client stopped"))?
    }
}

impl Drop for P2pClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_swarm(
    mut swarm: Swarm<Behaviour>,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<OutboundRequestId, Reply> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Fetch { peer, addr, request, reply }) => {
                    debug!(%peer, %addr, file = %request.file_path, "Sending fetch request");
                    swarm.add_peer_address(peer, addr);
                    let id = swarm.behaviour_mut().fetch.send_request(&peer, request);
                    pending.insert(id, reply);
                }
                None => break,
            },
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(BehaviourEvent::Fetch(event)) => match event {
                    request_response::Event::Message {
                        message: request_response::Message::Response { request_id, response },
                        ..
                    } => {
                        if let Some(reply) = pending.remove(&request_id) {
                            let _ = reply.send(into_result(response));
                        }
                    }
                    request_response::Event::OutboundFailure { request_id, error, peer, .. } => {
                        warn!(%peer, "Fetch request failed: {}", error);
                        if let Some(reply) = pending.remove(&request_id) {
                            let _ = reply.send(Err(classify_outbound(error)));
                        }
                    }
                    _ => {}
                },
                SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                    debug!("Connected to peer: {} at {}", peer_id, endpoint.get_remote_address());
                }
                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    debug!("Outgoing connection error to {:?}: {}", peer_id, error);
                }
                _ => {}
            }
        }
    }

    debug!("P2P client stopped");
}
