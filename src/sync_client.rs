//! Synchronous shell for schedulerless environments.
//!
//! A REQ socket with a receive timeout, blocking on each call in turn. It
//! speaks the four-frame REQ form of the protocol and forgoes heartbeats
//! and the deferred outbox; transport security still applies, configured
//! directly from the peer configuration.

use tracing::debug;

use crate::errors::{RpcError, reconstruct_remote};
use crate::packer::{Packer, TranslationTable, Value};
use crate::peer::PeerConfig;
use crate::protocol::{Inbound, Kind, Message, classify};

/// Blocking single-call client.
pub struct SyncClient {
    socket: zmq::Socket,
    packer: Packer,
    // kept alive for the socket's lifetime
    _context: zmq::Context,
}

impl SyncClient {
    /// Create the REQ socket and apply the timeout and any transport
    /// security present in the configuration.
    ///
    /// # Errors
    /// Fails on socket creation or option application.
    pub fn new(config: &PeerConfig) -> Result<Self, RpcError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::REQ)?;
        let timeout_ms = i32::try_from(config.timeout.as_millis()).unwrap_or(i32::MAX);
        socket.set_rcvtimeo(timeout_ms)?;
        socket.set_sndtimeo(timeout_ms)?;
        socket.set_linger(0)?;
        Self::apply_security(&socket, config)?;
        Ok(Self {
            socket,
            packer: Packer::new(
                config
                    .translation_table
                    .clone()
                    .unwrap_or_else(TranslationTable::default),
            ),
            _context: context,
        })
    }

    fn apply_security(socket: &zmq::Socket, config: &PeerConfig) -> Result<(), RpcError> {
        if let (Some(server_key), Some(public), Some(secret)) = (
            config.peer_public_key.as_deref(),
            config.public_key.as_deref(),
            config.secret_key.as_deref(),
        ) {
            socket.set_curve_serverkey(&crate::auth::curve::binary_key(server_key)?)?;
            socket.set_curve_publickey(&crate::auth::curve::binary_key(public)?)?;
            socket.set_curve_secretkey(&crate::auth::curve::binary_key(secret)?)?;
        } else if let Some(password) = config.password.as_deref() {
            let username = String::from_utf8(config.user_id.clone())
                .map_err(|_| RpcError::Config("PLAIN user id must be UTF-8".to_owned()))?;
            let password = String::from_utf8(password.to_vec())
                .map_err(|_| RpcError::Config("PLAIN password must be UTF-8".to_owned()))?;
            socket.set_plain_username(Some(&username))?;
            socket.set_plain_password(Some(&password))?;
        }
        Ok(())
    }

    /// Connect to the responder.
    ///
    /// # Errors
    /// Fails when the endpoint is invalid.
    pub fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.socket.connect(endpoint).map_err(RpcError::from)
    }

    /// Call a named operation and block until its reply or the timeout.
    ///
    /// # Errors
    /// Fails with [`RpcError::Timeout`] when the receive window elapses,
    /// with the reconstructed remote exception on an ERROR reply, or with
    /// a codec or transport error.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_with(name, args, Vec::new())
    }

    /// [`SyncClient::call`] with keyword arguments.
    ///
    /// # Errors
    /// As [`SyncClient::call`].
    pub fn call_with(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, RpcError> {
        let payload = self.packer.pack_work(name, &args, &kwargs)?;
        let request = Message::new(None, Kind::Work, payload);
        let correlation_id = request.correlation_id.clone();
        self.socket
            .send_multipart(request.into_frames(), 0)
            .map_err(RpcError::from)?;

        let frames = match self.socket.recv_multipart(0) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Err(RpcError::Timeout),
            Err(e) => return Err(e.into()),
        };
        let Inbound::Message(reply) = classify(frames)? else {
            return Err(RpcError::Protocol(
                crate::protocol::ProtocolError::FrameCount(2),
            ));
        };
        if reply.correlation_id != correlation_id {
            debug!("reply correlates to a different request");
        }
        match reply.kind {
            Kind::Ok => self.packer.unpack(&reply.payload).map_err(RpcError::from),
            Kind::Error => {
                let (kind, message, trace) = self.packer.unpack_triple(&reply.payload)?;
                Err(reconstruct_remote(&kind, &message, &trace))
            }
            Kind::Unauthorized => Err(RpcError::Unauthorized(
                String::from_utf8_lossy(&reply.payload).into_owned(),
            )),
            other => Err(RpcError::Protocol(
                crate::protocol::ProtocolError::UnknownKind(other.to_u8()),
            )),
        }
    }

    /// Close the socket. Dropping the client does the same.
    pub fn stop(self) {
        drop(self);
    }
}
