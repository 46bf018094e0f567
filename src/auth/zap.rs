//! ZAP listener answering the transport's authentication requests.
//!
//! libzmq delivers one request per connection attempt to the ROUTER socket
//! bound at `inproc://zeromq.zap.01` (RFC 27). The listener thread parses
//! the request, asks its policy for a verdict, and replies with the fixed
//! `[zid, '', "1.0", sequence, status, text, user_id, '']` shape. Whatever
//! user id the policy returns becomes the `User-Id` metadata on every later
//! message from that connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::errors::RpcError;

/// Well-known inproc endpoint the transport sends ZAP requests to.
pub const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";

/// ZAP protocol version.
const ZAP_VERSION: &[u8] = b"1.0";
/// Poll granularity of the listener thread.
const POLL_INTERVAL_MS: i64 = 50;
/// Frames preceding the credential frames: zid, delimiter, version,
/// sequence, domain, address, identity, mechanism.
const FIXED_FRAMES: usize = 8;

/// A parsed ZAP request.
pub struct ZapRequest {
    zid: Vec<u8>,
    sequence: Vec<u8>,
    /// Security mechanism name (`PLAIN`, `CURVE`, ...).
    pub mechanism: Vec<u8>,
    /// Mechanism-specific credential frames: `[username, password]` for
    /// PLAIN, `[public_key]` for CURVE.
    pub credentials: Vec<Vec<u8>>,
}

/// Verdict returned by a ZAP policy.
pub struct ZapReply {
    status_code: &'static [u8],
    status_text: &'static [u8],
    /// Verified identity attached to the connection on success.
    pub user_id: Vec<u8>,
}

impl ZapReply {
    /// Accept the connection under the given identity.
    #[must_use]
    pub fn ok(user_id: Vec<u8>) -> Self {
        Self {
            status_code: b"200",
            status_text: b"OK",
            user_id,
        }
    }

    /// Reject the connection.
    #[must_use]
    pub fn unauthorized() -> Self {
        Self {
            status_code: b"400",
            status_text: b"Unauthorized",
            user_id: Vec::new(),
        }
    }

    /// Whether the verdict accepts the connection.
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.status_code == b"200"
    }
}

#[cfg(test)]
impl ZapRequest {
    /// A request as libzmq would deliver it, for policy unit tests.
    pub(crate) fn test_fixture(mechanism: &[u8], credentials: &[&[u8]]) -> Self {
        Self {
            zid: b"zid".to_vec(),
            sequence: b"1".to_vec(),
            mechanism: mechanism.to_vec(),
            credentials: credentials.iter().map(|c| c.to_vec()).collect(),
        }
    }
}

fn parse_request(mut frames: Vec<Vec<u8>>) -> Option<ZapRequest> {
    if frames.len() < FIXED_FRAMES {
        warn!(count = frames.len(), "short ZAP request dropped");
        return None;
    }
    let credentials = frames.split_off(FIXED_FRAMES);
    let mechanism = frames.pop()?;
    // identity, address, domain are not consulted by any built-in policy
    frames.truncate(4);
    let sequence = frames.pop()?;
    let version = frames.pop()?;
    if version != ZAP_VERSION {
        warn!(?version, "unsupported ZAP version");
        return None;
    }
    let _ = frames.pop(); // delimiter
    let zid = frames.pop()?;
    Some(ZapRequest {
        zid,
        sequence,
        mechanism,
        credentials,
    })
}

fn reply_frames(request: &ZapRequest, reply: &ZapReply) -> Vec<Vec<u8>> {
    vec![
        request.zid.clone(),
        Vec::new(),
        ZAP_VERSION.to_vec(),
        request.sequence.clone(),
        reply.status_code.to_vec(),
        reply.status_text.to_vec(),
        reply.user_id.clone(),
        Vec::new(),
    ]
}

/// Background thread owning the ZAP ROUTER socket.
pub struct ZapListener {
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ZapListener {
    /// Bind the ZAP endpoint and start answering with `policy`.
    ///
    /// # Errors
    /// Fails when the socket cannot be created or the endpoint is already
    /// bound within this context.
    pub fn spawn<F>(context: &zmq::Context, mut policy: F) -> Result<Self, RpcError>
    where
        F: FnMut(&ZapRequest) -> ZapReply + Send + 'static,
    {
        let socket = context.socket(zmq::ROUTER)?;
        socket.set_linger(0)?;
        socket.bind(ZAP_ENDPOINT)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("dyad-zap".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    while !stop.load(Ordering::Relaxed) {
                        match socket.poll(zmq::POLLIN, POLL_INTERVAL_MS) {
                            Ok(0) => continue,
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "ZAP poll failure");
                                break;
                            }
                        }
                        let frames = match socket.recv_multipart(0) {
                            Ok(frames) => frames,
                            Err(e) => {
                                warn!(error = %e, "ZAP receive failure");
                                break;
                            }
                        };
                        let Some(request) = parse_request(frames) else {
                            continue;
                        };
                        let reply = policy(&request);
                        debug!(
                            mechanism = %String::from_utf8_lossy(&request.mechanism),
                            status = %String::from_utf8_lossy(reply.status_code),
                            "answered ZAP request"
                        );
                        if let Err(e) = socket.send_multipart(reply_frames(&request, &reply), 0) {
                            warn!(error = %e, "ZAP reply failure");
                        }
                    }
                }
            })
            .map_err(|e| RpcError::Config(format!("cannot spawn ZAP thread: {e}")))?;

        Ok(Self {
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop the listener and wait for its thread to exit.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_frames(mechanism: &[u8], credentials: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut frames = vec![
            b"zid".to_vec(),
            Vec::new(),
            ZAP_VERSION.to_vec(),
            b"1".to_vec(),
            b"global".to_vec(),
            b"127.0.0.1".to_vec(),
            Vec::new(),
            mechanism.to_vec(),
        ];
        frames.extend(credentials.iter().map(|c| c.to_vec()));
        frames
    }

    #[test]
    fn plain_request_parses_both_credentials() {
        let req = parse_request(request_frames(b"PLAIN", &[b"john", b"s3cret!"])).unwrap();
        assert_eq!(req.mechanism, b"PLAIN");
        assert_eq!(req.credentials, vec![b"john".to_vec(), b"s3cret!".to_vec()]);
    }

    #[test]
    fn curve_request_parses_the_key() {
        let key = [7u8; 32];
        let req = parse_request(request_frames(b"CURVE", &[&key])).unwrap();
        assert_eq!(req.credentials, vec![key.to_vec()]);
    }

    #[test]
    fn reply_shape_matches_rfc27() {
        let req = parse_request(request_frames(b"PLAIN", &[b"u", b"p"])).unwrap();
        let frames = reply_frames(&req, &ZapReply::ok(b"u".to_vec()));
        assert_eq!(frames.len(), 8);
        assert_eq!(frames[0], b"zid");
        assert_eq!(frames[2], ZAP_VERSION);
        assert_eq!(frames[3], b"1");
        assert_eq!(frames[4], b"200");
        assert_eq!(frames[6], b"u");
        assert!(frames[7].is_empty());

        let frames = reply_frames(&req, &ZapReply::unauthorized());
        assert_eq!(frames[4], b"400");
        assert!(frames[6].is_empty());
    }

    #[test]
    fn short_or_wrong_version_requests_are_dropped() {
        assert!(parse_request(vec![b"zid".to_vec()]).is_none());
        let mut frames = request_frames(b"PLAIN", &[b"u", b"p"]);
        frames[2] = b"2.0".to_vec();
        assert!(parse_request(frames).is_none());
    }
}
