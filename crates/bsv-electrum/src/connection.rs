//! A single JSON-RPC connection to one index server.
//!
//! `ElectrumConnection` splits its stream: a reader task routes responses
//! to waiting callers by request id and fans server pushes out on a
//! broadcast channel, while callers serialise writes through a mutex.
//! When the stream ends every pending call fails with `Closed` and the
//! `closed` watch flips to `true`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::config::{PoolConfig, ServerEndpoint, Transport};
use crate::protocol::{parse_line, Incoming, Notification, Request};
use crate::ElectrumError;

/// A live request/notification channel to one server.
///
/// The pool and the address monitor only see this trait, which lets tests
/// substitute scripted fakes for real sockets.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// `host:port` of the server behind this channel.
    fn server_id(&self) -> &str;

    /// Issue one request and wait for its response. No deadline is applied
    /// here; callers bound it.
    async fn call(&self, method: &str, params: Value) -> Result<Value, ElectrumError>;

    /// A receiver for pushes sent after this call.
    fn notifications(&self) -> broadcast::Receiver<Notification>;

    /// Flips to `true` once the channel is unusable.
    fn closed(&self) -> watch::Receiver<bool>;

    fn is_closed(&self) -> bool {
        *self.closed().borrow()
    }

    /// Close the channel. Never fails; errors during teardown are logged.
    async fn close(&self);
}

/// Opens channels to endpoints. Handshaking is left to the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<dyn RpcChannel>, ElectrumError>;
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, ElectrumError>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, ElectrumError>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending entry if its caller gives up (timeout or drop).
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

pub struct ElectrumConnection {
    server_id: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    notifications: broadcast::Sender<Notification>,
    closed_tx: Arc<watch::Sender<bool>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ElectrumConnection {
    /// Take ownership of a connected stream and start its reader task.
    pub fn spawn<S>(server_id: impl Into<String>, stream: S, notification_buffer: usize) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let server_id = server_id.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let (notifications, _) = broadcast::channel(notification_buffer.max(1));
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let reader = tokio::spawn(read_loop(
            server_id.clone(),
            read_half,
            pending.clone(),
            notifications.clone(),
            closed_tx.clone(),
        ));

        Arc::new(ElectrumConnection {
            server_id,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            pending,
            next_id: AtomicU64::new(0),
            notifications,
            closed_tx,
            reader: Mutex::new(Some(reader)),
        })
    }

    fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
        fail_pending(&self.pending, &self.server_id);
    }
}

#[async_trait]
impl RpcChannel for ElectrumConnection {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ElectrumError> {
        if self.is_closed() {
            return Err(ElectrumError::Closed(self.server_id.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Request::new(id, method, &params).to_line()?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &*self.pending,
            id,
        };
        // The reader flags closure before draining, so a close racing this
        // insert is caught here.
        if self.is_closed() {
            return Err(ElectrumError::Closed(self.server_id.clone()));
        }

        trace!(server = %self.server_id, id, method, "sending request");
        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.mark_closed();
            return Err(ElectrumError::Connection {
                server: self.server_id.clone(),
                message: e.to_string(),
            });
        }

        rx.await
            .map_err(|_| ElectrumError::Closed(self.server_id.clone()))?
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.mark_closed();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(server = %self.server_id, error = %e, "error shutting down stream");
        }
    }
}

impl Drop for ElectrumConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

fn fail_pending(pending: &PendingMap, server_id: &str) {
    let drained: Vec<_> = lock(pending).drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(ElectrumError::Closed(server_id.to_string())));
    }
}

async fn read_loop<R>(
    server_id: String,
    reader: R,
    pending: Arc<PendingMap>,
    notifications: broadcast::Sender<Notification>,
    closed_tx: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(Incoming::Response { id, result }) => {
                        let waiter = lock(&pending).remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(result.map_err(|e| ElectrumError::Rpc {
                                    code: e.code,
                                    message: e.message,
                                }));
                            }
                            None => debug!(server = %server_id, id, "response for abandoned request"),
                        }
                    }
                    Ok(Incoming::Notification(n)) => {
                        trace!(server = %server_id, method = %n.method, "notification");
                        // No receivers is fine: nobody is subscribed yet.
                        let _ = notifications.send(n);
                    }
                    Err(e) => warn!(server = %server_id, error = %e, "skipping malformed line"),
                }
            }
            Ok(None) => break "server closed the stream".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    debug!(server = %server_id, reason = %reason, "connection reader stopped");
    closed_tx.send_replace(true);
    fail_pending(&pending, &server_id);
}

/// Opens plain TCP or TLS connections with `tokio-rustls`.
pub struct TcpConnector {
    tls: TlsConnector,
    notification_buffer: usize,
}

impl TcpConnector {
    pub fn new(config: &PoolConfig) -> Result<Self, ElectrumError> {
        let provider = Arc::new(crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ElectrumError::Tls(e.to_string()))?;

        let tls_config = if config.accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(TcpConnector {
            tls: TlsConnector::from(Arc::new(tls_config)),
            notification_buffer: config.notification_buffer,
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<dyn RpcChannel>, ElectrumError> {
        let server_id = endpoint.server_id();
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ElectrumError::Connection {
                server: server_id.clone(),
                message: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(server = %server_id, error = %e, "failed to set TCP_NODELAY");
        }

        let channel: Arc<dyn RpcChannel> = match endpoint.transport {
            Transport::Tcp => ElectrumConnection::spawn(server_id, stream, self.notification_buffer),
            Transport::Tls => {
                let name = ServerName::try_from(endpoint.host.clone())
                    .map_err(|e| ElectrumError::Tls(format!("invalid server name: {}", e)))?;
                let tls_stream = self
                    .tls
                    .connect(name, stream)
                    .await
                    .map_err(|e| ElectrumError::Tls(format!("{}: {}", server_id, e)))?;
                ElectrumConnection::spawn(server_id, tls_stream, self.notification_buffer)
            }
        };
        Ok(channel)
    }
}

/// Certificate verifier for self-signed ElectrumX servers: any certificate
/// is accepted, but handshake signatures are still checked against it.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    //! Exercises `ElectrumConnection` against an in-process line server.

    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    /// Accept one connection and answer each request with `respond`.
    async fn line_server<F>(respond: F) -> std::net::SocketAddr
    where
        F: Fn(Value) -> Vec<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).expect("request json");
                for reply in respond(request) {
                    if write.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        addr
    }

    async fn connect(addr: std::net::SocketAddr) -> Arc<ElectrumConnection> {
        let stream = TcpStream::connect(addr).await.expect("connect");
        ElectrumConnection::spawn(addr.to_string(), stream, 16)
    }

    #[tokio::test]
    async fn test_call_routes_response_by_id() {
        let addr = line_server(|req| {
            vec![json!({"jsonrpc": "2.0", "id": req["id"], "result": req["params"][0]}).to_string()]
        })
        .await;
        let conn = connect(addr).await;

        let a = conn.call("echo", json!(["first"])).await.expect("first");
        let b = conn.call("echo", json!(["second"])).await.expect("second");
        assert_eq!(a, json!("first"));
        assert_eq!(b, json!("second"));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_rpc_error_is_surfaced() {
        let addr = line_server(|req| {
            vec![json!({"id": req["id"], "error": {"code": 1, "message": "bad tx"}}).to_string()]
        })
        .await;
        let conn = connect(addr).await;
        let err = conn.call("blockchain.transaction.broadcast", json!(["00"])).await;
        assert!(matches!(err, Err(ElectrumError::Rpc { code: 1, ref message }) if message == "bad tx"));
    }

    #[tokio::test]
    async fn test_notifications_are_broadcast() {
        let addr = line_server(|req| {
            vec![
                json!({"method": "blockchain.scripthash.subscribe", "params": ["aa", "bb"]}).to_string(),
                json!({"id": req["id"], "result": null}).to_string(),
            ]
        })
        .await;
        let conn = connect(addr).await;
        let mut pushes = conn.notifications();
        conn.call("blockchain.scripthash.subscribe", json!(["aa"]))
            .await
            .expect("subscribe");
        let push = tokio::time::timeout(Duration::from_secs(2), pushes.recv())
            .await
            .expect("in time")
            .expect("push");
        assert_eq!(push.params, json!(["aa", "bb"]));
    }

    #[tokio::test]
    async fn test_server_hangup_fails_pending_and_flags_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut lines = BufReader::new(socket).lines();
            // Read one request, then hang up without answering.
            let _ = lines.next_line().await;
        });
        let conn = connect(addr).await;
        let mut closed = conn.closed();

        let err = conn.call("server.ping", json!([])).await;
        assert!(matches!(err, Err(ElectrumError::Closed(_))));
        tokio::time::timeout(Duration::from_secs(2), closed.wait_for(|c| *c))
            .await
            .expect("in time")
            .expect("watch alive");
        assert!(matches!(
            conn.call("server.ping", json!([])).await,
            Err(ElectrumError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let addr = line_server(|_| Vec::new()).await;
        let conn = connect(addr).await;
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_timed_out_call_leaves_no_pending_entry() {
        let addr = line_server(|_| Vec::new()).await;
        let conn = connect(addr).await;
        let result = tokio::time::timeout(Duration::from_millis(50), conn.call("slow", json!([]))).await;
        assert!(result.is_err());
        assert!(lock(&conn.pending).is_empty());
    }

    #[test]
    fn test_tls_connector_builds() {
        TcpConnector::new(&PoolConfig::default()).expect("verified");
        let insecure = PoolConfig {
            accept_invalid_certs: true,
            ..PoolConfig::default()
        };
        TcpConnector::new(&insecure).expect("self-signed");
    }
}
