//! Request/reply endpoints.
//!
//! The serving side ([`RepEndpoint`]) binds every configured state URL and
//! merges the requests arriving on all of them into one bounded queue, so a
//! single owner task can serve TCP, IPC and in-process peers without sharing
//! any socket. The calling side ([`ReqEndpoint`]) holds at most one lazily
//! created connection; a connection that fails or times out mid-call is
//! discarded and rebuilt on the next call, because a half-used exchange on a
//! stream cannot be resumed.

use crate::endpoint::{canonical_hostname, EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::wire::frames::{read_message, write_message};
use crate::wire::inproc::{self, IncomingRequest};
use bytes::Bytes;
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Bound on a single send, receive or connect in a request round-trip.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct RepEndpoint {
    /// The URLs peers can actually reach, placeholders resolved and wildcard
    /// TCP hosts rewritten to the canonical host name.
    pub resolved: Vec<String>,
    /// The merged request queue. Dropping the receiver makes every
    /// connection task wind down on its next request.
    pub rx: mpsc::Receiver<IncomingRequest>,
    _inproc: Vec<inproc::RepBinding>,
    accept_tasks: Vec<JoinHandle<()>>,
    ipc_paths: Vec<String>,
}

impl RepEndpoint {
    /// Binds every URL, spawning one accept loop per listener onto the
    /// current runtime. Failure to bind any endpoint fails the whole call.
    pub async fn bind(urls: &[EndpointUrl], queue_depth: usize) -> Result<RepEndpoint> {
        let (tx, rx) = mpsc::channel(queue_depth);
        let mut parts = BindParts::default();

        let mut failure = None;
        for url in urls {
            if let Err(e) = bind_one(url, &tx, &mut parts).await {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            for task in &parts.accept_tasks {
                task.abort();
            }
            for path in &parts.ipc_paths {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }

        debug!("request endpoint serving at {:?}", parts.resolved);
        Ok(RepEndpoint {
            resolved: parts.resolved,
            rx,
            _inproc: parts.inproc_bindings,
            accept_tasks: parts.accept_tasks,
            ipc_paths: parts.ipc_paths,
        })
    }
}

#[derive(Default)]
struct BindParts {
    resolved: Vec<String>,
    inproc_bindings: Vec<inproc::RepBinding>,
    accept_tasks: Vec<JoinHandle<()>>,
    ipc_paths: Vec<String>,
}

async fn bind_one(
    url: &EndpointUrl,
    tx: &mpsc::Sender<IncomingRequest>,
    parts: &mut BindParts,
) -> Result<()> {
    match url.scheme {
        TransportScheme::Tcp => {
            let (host, _) = url.host_port()?;
            let bind_host = if host == "*" { "0.0.0.0" } else { host };
            let port = if url.ephemeral_port() { 0 } else { url.port()? };
            let listener = TcpListener::bind((bind_host, port))
                .await
                .map_err(|e| Error::Creation(format!("cannot bind {url}: {e}")))?;
            let port = listener
                .local_addr()
                .map_err(|e| Error::Creation(e.to_string()))?
                .port();
            let advertised = if host == "*" {
                canonical_hostname()
            } else {
                host.to_string()
            };
            parts.resolved.push(format!("tcp://{advertised}:{port}"));
            parts.accept_tasks.push(spawn_tcp_accept(listener, tx.clone()));
        }
        TransportScheme::Ipc => {
            let expanded = url.expand_placeholders();
            let listener = UnixListener::bind(&expanded.rest)
                .map_err(|e| Error::Creation(format!("cannot bind {expanded}: {e}")))?;
            parts.resolved.push(expanded.to_string());
            parts.ipc_paths.push(expanded.rest.clone());
            parts.accept_tasks.push(spawn_unix_accept(listener, tx.clone()));
        }
        TransportScheme::Inproc => {
            let expanded = url.expand_placeholders();
            let full = expanded.to_string();
            parts.inproc_bindings.push(inproc::bind_rep(&full, tx.clone())?);
            parts.resolved.push(full);
        }
        TransportScheme::RtInproc => {
            return Err(Error::Creation(format!(
                "'{url}': the real-time transport cannot carry request traffic"
            )));
        }
    }
    Ok(())
}

impl Drop for RepEndpoint {
    fn drop(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
        for path in &self.ipc_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn spawn_tcp_accept(
    listener: TcpListener,
    tx: mpsc::Sender<IncomingRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(stream, tx.clone()));
                }
                Err(e) => {
                    warn!("request accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    })
}

fn spawn_unix_accept(
    listener: UnixListener,
    tx: mpsc::Sender<IncomingRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, tx.clone()));
                }
                Err(e) => {
                    warn!("request accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    })
}

/// One connection's strict request/reply lockstep: read a message, queue it
/// for the owner, wait for the reply, write it back. Any failure ends the
/// connection; the peer rebuilds on its side.
async fn serve_connection<S>(mut stream: S, tx: mpsc::Sender<IncomingRequest>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frames = match read_message(&mut stream).await {
            Ok(frames) => frames,
            Err(_) => break,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(IncomingRequest {
                frames,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            break;
        }
        let reply = match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => break,
        };
        if write_message(&mut stream, &[reply]).await.is_err() {
            break;
        }
    }
}

enum ReqStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// The calling half of a request/reply pair. Not shareable; the owner is
/// expected to serialize use (the keymaster client holds one behind its
/// per-client lock).
pub(crate) struct ReqEndpoint {
    url: EndpointUrl,
    conn: Option<ReqStream>,
}

impl ReqEndpoint {
    pub fn new(url: EndpointUrl) -> Self {
        ReqEndpoint { url, conn: None }
    }

    pub fn url(&self) -> &EndpointUrl {
        &self.url
    }

    /// One full round-trip: the request frames out, the single reply frame
    /// back, each leg bounded by [`REQUEST_TIMEOUT`]. On any failure the
    /// connection is discarded so the next call starts clean.
    pub async fn request(&mut self, frames: Vec<Bytes>) -> Result<Bytes> {
        match self.url.scheme {
            TransportScheme::Inproc => self.request_inproc(frames).await,
            TransportScheme::Tcp | TransportScheme::Ipc => {
                match self.request_stream(frames).await {
                    Ok(reply) => Ok(reply),
                    Err(e) => {
                        self.conn = None;
                        Err(e)
                    }
                }
            }
            TransportScheme::RtInproc => Err(Error::Transport(
                "the real-time transport carries no request traffic".into(),
            )),
        }
    }

    async fn request_inproc(&mut self, frames: Vec<Bytes>) -> Result<Bytes> {
        let full = self.url.to_string();
        let tx = inproc::lookup_rep(&full)
            .ok_or_else(|| Error::Transport(format!("nothing bound at {full}")))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        timeout(
            REQUEST_TIMEOUT,
            tx.send(IncomingRequest {
                frames,
                reply: reply_tx,
            }),
        )
        .await
        .map_err(|_| Error::Transport(format!("send to {full} timed out")))?
        .map_err(|_| Error::Transport(format!("{full} has gone away")))?;
        timeout(REQUEST_TIMEOUT, reply_rx)
            .await
            .map_err(|_| Error::Transport(format!("reply from {full} timed out")))?
            .map_err(|_| Error::Transport(format!("{full} dropped the request")))
    }

    async fn request_stream(&mut self, frames: Vec<Bytes>) -> Result<Bytes> {
        if self.conn.is_none() {
            self.conn = Some(self.connect().await?);
        }
        let conn = self.conn.as_mut().unwrap();
        let reply = match conn {
            ReqStream::Tcp(stream) => Self::exchange(stream, frames).await?,
            ReqStream::Unix(stream) => Self::exchange(stream, frames).await?,
        };
        Ok(reply)
    }

    async fn connect(&self) -> Result<ReqStream> {
        match self.url.scheme {
            TransportScheme::Tcp => {
                let stream = timeout(REQUEST_TIMEOUT, TcpStream::connect(self.url.rest.as_str()))
                    .await
                    .map_err(|_| Error::Transport(format!("connect to {} timed out", self.url)))?
                    .map_err(|e| Error::Transport(format!("cannot connect to {}: {e}", self.url)))?;
                let _ = stream.set_nodelay(true);
                Ok(ReqStream::Tcp(stream))
            }
            TransportScheme::Ipc => {
                let stream =
                    timeout(REQUEST_TIMEOUT, UnixStream::connect(self.url.rest.as_str()))
                        .await
                        .map_err(|_| Error::Transport(format!("connect to {} timed out", self.url)))?
                        .map_err(|e| {
                            Error::Transport(format!("cannot connect to {}: {e}", self.url))
                        })?;
                Ok(ReqStream::Unix(stream))
            }
            _ => unreachable!("stream connect on a non-stream scheme"),
        }
    }

    async fn exchange<S>(stream: &mut S, frames: Vec<Bytes>) -> Result<Bytes>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        timeout(REQUEST_TIMEOUT, write_message(stream, &frames))
            .await
            .map_err(|_| Error::Transport("request send timed out".into()))?
            .map_err(|e| Error::Transport(format!("request send failed: {e}")))?;
        let mut reply = timeout(REQUEST_TIMEOUT, read_message(stream))
            .await
            .map_err(|_| Error::Transport("reply receive timed out".into()))?
            .map_err(|e| Error::Transport(format!("reply receive failed: {e}")))?;
        if reply.len() != 1 {
            return Err(Error::Protocol(format!(
                "expected a single reply frame, got {}",
                reply.len()
            )));
        }
        Ok(reply.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::{RepEndpoint, ReqEndpoint};
    use crate::endpoint::EndpointUrl;
    use crate::wire::frames::text_frame;
    use bytes::Bytes;

    async fn echo_server(mut endpoint: RepEndpoint) {
        while let Some(req) = endpoint.rx.recv().await {
            let mut echoed = Vec::new();
            for frame in &req.frames {
                echoed.extend_from_slice(frame);
                echoed.push(b'|');
            }
            let _ = req.reply.send(Bytes::from(echoed));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_trip_over_inproc() {
        let urls = vec![EndpointUrl::parse("inproc://reqrep.unit").unwrap()];
        let endpoint = RepEndpoint::bind(&urls, 8).await.unwrap();
        assert_eq!(endpoint.resolved, vec!["inproc://reqrep.unit"]);
        tokio::spawn(echo_server(endpoint));

        let mut req = ReqEndpoint::new(EndpointUrl::parse("inproc://reqrep.unit").unwrap());
        let reply = req
            .request(vec![text_frame("GET"), text_frame("a.b")])
            .await
            .unwrap();
        assert_eq!(&reply[..], b"GET|a.b|");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_trip_over_tcp_with_ephemeral_port() {
        let urls = vec![EndpointUrl::parse("tcp://127.0.0.1:XXXXX").unwrap()];
        let endpoint = RepEndpoint::bind(&urls, 8).await.unwrap();
        let resolved = endpoint.resolved[0].clone();
        assert!(resolved.starts_with("tcp://127.0.0.1:"));
        tokio::spawn(echo_server(endpoint));

        let mut req = ReqEndpoint::new(EndpointUrl::parse(&resolved).unwrap());
        let reply = req.request(vec![text_frame("ping")]).await.unwrap();
        assert_eq!(&reply[..], b"ping|");

        // A second call reuses the connection.
        let reply = req.request(vec![text_frame("again")]).await.unwrap();
        assert_eq!(&reply[..], b"again|");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_peer_reports_transport_error() {
        let mut req = ReqEndpoint::new(EndpointUrl::parse("inproc://reqrep.nobody").unwrap());
        assert!(req.request(vec![text_frame("ping")]).await.is_err());
    }
}
