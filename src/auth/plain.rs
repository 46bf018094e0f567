//! PLAIN-mechanism backends.
//!
//! The initiator asserts its user id as the PLAIN username; the responder
//! verifies it through ZAP, either against a credential table (`plain`) or
//! by trusting the assertion outright (`trusted_peer`). Because ROUTER
//! assigns transport identities itself, the responder keeps an explicit
//! `user_id -> routing_id` map fed by the dispatch loop.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::errors::RpcError;
use crate::peer::PeerLink;

use super::AuthBackend;
use super::zap::{ZapListener, ZapReply, ZapRequest};

/// Initiator side of the PLAIN backends.
///
/// Sets the socket's PLAIN username to the peer's user id and the password
/// from the configuration; everything else is the permissive default.
#[derive(Default)]
pub struct PlainClient;

impl AuthBackend for PlainClient {
    fn configure(&self, socket: &zmq::Socket, link: PeerLink) -> Result<(), RpcError> {
        let config = link.config();
        let username = String::from_utf8(config.user_id.clone())
            .map_err(|_| RpcError::Config("PLAIN user id must be UTF-8".to_owned()))?;
        let password = match &config.password {
            Some(bytes) => String::from_utf8(bytes.clone())
                .map_err(|_| RpcError::Config("PLAIN password must be UTF-8".to_owned()))?,
            None => String::new(),
        };
        socket.set_plain_username(Some(&username))?;
        socket.set_plain_password(Some(&password))?;
        Ok(())
    }
}

/// Responder side of the PLAIN backends.
pub struct PlainServer {
    credentials: Option<HashMap<Vec<u8>, Vec<u8>>>,
    routing: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    listener: Mutex<Option<ZapListener>>,
}

impl PlainServer {
    /// Verify presented credentials against a `user_id -> password` table.
    #[must_use]
    pub fn checking(credentials: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        Self {
            credentials: Some(credentials),
            routing: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Trust whatever identity the peer asserts; no password control.
    #[must_use]
    pub fn trusting() -> Self {
        Self {
            credentials: None,
            routing: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    fn evaluate(credentials: Option<&HashMap<Vec<u8>, Vec<u8>>>, request: &ZapRequest) -> ZapReply {
        if request.mechanism != b"PLAIN" {
            return ZapReply::unauthorized();
        }
        let [login, password] = request.credentials.as_slice() else {
            return ZapReply::unauthorized();
        };
        match credentials {
            None => ZapReply::ok(login.clone()),
            Some(table) if table.get(login) == Some(password) => ZapReply::ok(login.clone()),
            Some(_) => ZapReply::unauthorized(),
        }
    }
}

#[async_trait]
impl AuthBackend for PlainServer {
    fn configure(&self, socket: &zmq::Socket, link: PeerLink) -> Result<(), RpcError> {
        socket.set_plain_server(true)?;
        let credentials = self.credentials.clone();
        let listener = ZapListener::spawn(link.context(), move |request| {
            Self::evaluate(credentials.as_ref(), request)
        })?;
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(())
    }

    async fn stop(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
    }

    fn get_routing_id(&self, user_id: &[u8]) -> Option<Vec<u8>> {
        self.routing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn register_routing_id(&self, user_id: &[u8], routing_id: &[u8]) {
        self.routing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_vec(), routing_id.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mechanism: &[u8], credentials: &[&[u8]]) -> ZapRequest {
        ZapRequest::test_fixture(mechanism, credentials)
    }

    #[test]
    fn checking_server_verifies_the_table() {
        let table = HashMap::from([(b"john".to_vec(), b"s3cret!".to_vec())]);

        let ok = PlainServer::evaluate(Some(&table), &request(b"PLAIN", &[b"john", b"s3cret!"]));
        assert!(ok.accepted());
        assert_eq!(ok.user_id, b"john");

        let bad = PlainServer::evaluate(Some(&table), &request(b"PLAIN", &[b"john", b"wrong"]));
        assert!(!bad.accepted());

        let unknown = PlainServer::evaluate(Some(&table), &request(b"PLAIN", &[b"jane", b"x"]));
        assert!(!unknown.accepted());
    }

    #[test]
    fn trusting_server_accepts_any_login() {
        let reply = PlainServer::evaluate(None, &request(b"PLAIN", &[b"anyone", b""]));
        assert!(reply.accepted());
        assert_eq!(reply.user_id, b"anyone");
    }

    #[test]
    fn wrong_mechanism_is_rejected() {
        let reply = PlainServer::evaluate(None, &request(b"CURVE", &[&[0u8; 32]]));
        assert!(!reply.accepted());
    }

    #[test]
    fn routing_map_round_trips() {
        let server = PlainServer::trusting();
        assert_eq!(server.get_routing_id(b"john"), None);
        server.register_routing_id(b"john", b"\x00\x01");
        assert_eq!(server.get_routing_id(b"john"), Some(b"\x00\x01".to_vec()));
    }
}
