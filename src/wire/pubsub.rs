//! Publish/subscribe endpoints.
//!
//! The serving side ([`PubEndpoint`]) binds the publish URLs and fans each
//! (topic, payload) pair out to every connection whose filter set matches.
//! Filters are byte prefixes, installed by the subscriber sending a small
//! control message up the same connection. Fanout never blocks: a connection
//! that cannot keep up loses messages, not the publisher.
//!
//! The subscribing side ([`SubLink`]) owns one connection. A dedicated
//! reader pumps inbound publications into a queue so the owning worker can
//! wait on that queue and its control channel at the same time without
//! tearing a half-read message.

use crate::endpoint::{canonical_hostname, EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::wire::frames::{frame_text, read_message, text_frame, write_message};
use crate::wire::inproc::{self, PubHub};
use bytes::Bytes;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SUBSCRIBE_CMD: &str = "SUB";
const UNSUBSCRIBE_CMD: &str = "UNSUB";

/// Per-connection buffering before messages are dropped, akin to a
/// high-water mark.
const CONN_QUEUE_DEPTH: usize = 1000;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

struct PubConn {
    filters: HashSet<Vec<u8>>,
    tx: mpsc::Sender<(Bytes, Bytes)>,
    reader: JoinHandle<()>,
}

type ConnMap = Arc<Mutex<HashMap<u64, PubConn>>>;

/// The publishing side of the fabric: one socket set, many subscribers.
pub(crate) struct PubEndpoint {
    pub resolved: Vec<String>,
    conns: ConnMap,
    hubs: Vec<inproc::PubBinding>,
    accept_tasks: Vec<JoinHandle<()>>,
    ipc_paths: Vec<String>,
}

impl PubEndpoint {
    pub async fn bind(urls: &[EndpointUrl]) -> Result<PubEndpoint> {
        let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));
        let mut resolved = Vec::new();
        let mut hubs = Vec::new();
        let mut accept_tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut ipc_paths = Vec::new();

        let mut failure = None;
        for url in urls {
            let outcome = match url.scheme {
                TransportScheme::Tcp => match bind_tcp(url, &conns).await {
                    Ok((url, task)) => {
                        resolved.push(url);
                        accept_tasks.push(task);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                TransportScheme::Ipc => {
                    let expanded = url.expand_placeholders();
                    match UnixListener::bind(&expanded.rest) {
                        Ok(listener) => {
                            resolved.push(expanded.to_string());
                            ipc_paths.push(expanded.rest.clone());
                            accept_tasks.push(spawn_accept_unix(listener, conns.clone()));
                            Ok(())
                        }
                        Err(e) => Err(Error::Creation(format!("cannot bind {expanded}: {e}"))),
                    }
                }
                TransportScheme::Inproc => {
                    let expanded = url.expand_placeholders();
                    let full = expanded.to_string();
                    match inproc::bind_pub(&full) {
                        Ok(binding) => {
                            hubs.push(binding);
                            resolved.push(full);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                TransportScheme::RtInproc => Err(Error::Creation(format!(
                    "'{url}': the real-time transport binds through its own registry"
                ))),
            };
            if let Err(e) = outcome {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            for task in &accept_tasks {
                task.abort();
            }
            for path in &ipc_paths {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }

        debug!("publish endpoint serving at {resolved:?}");
        Ok(PubEndpoint {
            resolved,
            conns,
            hubs,
            accept_tasks,
            ipc_paths,
        })
    }

    /// Fans one publication out. Returns false when at least one matching
    /// subscriber's queue was full and the message was dropped for it.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        let topic_frame = text_frame(topic);
        let payload_frame = Bytes::copy_from_slice(payload);
        let mut delivered_everywhere = true;

        {
            let conns = self.conns.lock().expect("connection map poisoned");
            for conn in conns.values() {
                if conn
                    .filters
                    .iter()
                    .any(|f| topic.as_bytes().starts_with(f.as_slice()))
                {
                    match conn.tx.try_send((topic_frame.clone(), payload_frame.clone())) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            delivered_everywhere = false;
                        }
                        // A closed queue means the writer is already winding
                        // down; the reader will reap the entry.
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
        }

        for binding in &self.hubs {
            binding.hub.publish(topic, &payload_frame);
        }
        delivered_everywhere
    }

    /// Drops every connection and unbinds every name. Queued but unsent
    /// messages are discarded, the zero-linger close.
    pub fn close(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
        self.accept_tasks.clear();
        let mut conns = self.conns.lock().expect("connection map poisoned");
        for (_, conn) in conns.drain() {
            conn.reader.abort();
        }
        drop(conns);
        self.hubs.clear();
        for path in &self.ipc_paths {
            let _ = std::fs::remove_file(path);
        }
        self.ipc_paths.clear();
    }
}

impl Drop for PubEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

async fn bind_tcp(url: &EndpointUrl, conns: &ConnMap) -> Result<(String, JoinHandle<()>)> {
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
    let task = tokio::spawn({
        let conns = conns.clone();
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        let (read, write) = tokio::io::split(stream);
                        adopt_subscriber(Box::new(read), Box::new(write), &conns);
                    }
                    Err(e) => {
                        warn!("publish accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    });
    Ok((format!("tcp://{advertised}:{port}"), task))
}

fn spawn_accept_unix(listener: UnixListener, conns: ConnMap) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let (read, write) = tokio::io::split(stream);
                    adopt_subscriber(Box::new(read), Box::new(write), &conns);
                }
                Err(e) => {
                    warn!("publish accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    })
}

/// Registers a freshly accepted subscriber connection: a writer task drains
/// its queue onto the socket, a reader task applies its filter updates.
fn adopt_subscriber(
    mut read: Box<dyn AsyncRead + Send + Unpin>,
    mut write: Box<dyn AsyncWrite + Send + Unpin>,
    conns: &ConnMap,
) {
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<(Bytes, Bytes)>(CONN_QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some((topic, payload)) = rx.recv().await {
            if write_message(&mut write, &[topic, payload]).await.is_err() {
                break;
            }
        }
    });

    let reader = tokio::spawn({
        let conns = conns.clone();
        async move {
            loop {
                let frames = match read_message(&mut read).await {
                    Ok(frames) => frames,
                    Err(_) => break,
                };
                if frames.len() != 2 {
                    continue;
                }
                let Ok(cmd) = frame_text(&frames[0]) else {
                    continue;
                };
                let on = match cmd {
                    SUBSCRIBE_CMD => true,
                    UNSUBSCRIBE_CMD => false,
                    _ => continue,
                };
                let mut conns = conns.lock().expect("connection map poisoned");
                if let Some(conn) = conns.get_mut(&id) {
                    if on {
                        conn.filters.insert(frames[1].to_vec());
                    } else {
                        conn.filters.remove(&frames[1].to_vec());
                    }
                }
            }
            conns.lock().expect("connection map poisoned").remove(&id);
        }
    });

    conns.lock().expect("connection map poisoned").insert(
        id,
        PubConn {
            filters: HashSet::new(),
            tx,
            reader,
        },
    );
}

enum LinkKind {
    Stream {
        write: Box<dyn AsyncWrite + Send + Unpin>,
        reader: JoinHandle<()>,
    },
    Inproc {
        hub: Arc<PubHub>,
        id: u64,
    },
}

/// The subscribing side: one connection, one inbound queue, filters managed
/// through [`SubLink::set_subscribed`].
pub(crate) struct SubLink {
    kind: LinkKind,
    rx: mpsc::Receiver<(String, Bytes)>,
}

impl SubLink {
    pub async fn connect(url: &EndpointUrl, queue_depth: usize) -> Result<SubLink> {
        match url.scheme {
            TransportScheme::Tcp => {
                let stream = tokio::net::TcpStream::connect(url.rest.as_str())
                    .await
                    .map_err(|e| Error::Transport(format!("cannot connect to {url}: {e}")))?;
                let _ = stream.set_nodelay(true);
                let (read, write) = tokio::io::split(stream);
                Ok(Self::from_stream(Box::new(read), Box::new(write), queue_depth))
            }
            TransportScheme::Ipc => {
                let stream = tokio::net::UnixStream::connect(url.rest.as_str())
                    .await
                    .map_err(|e| Error::Transport(format!("cannot connect to {url}: {e}")))?;
                let (read, write) = tokio::io::split(stream);
                Ok(Self::from_stream(Box::new(read), Box::new(write), queue_depth))
            }
            TransportScheme::Inproc => {
                let full = url.to_string();
                let hub = inproc::lookup_pub(&full)
                    .ok_or_else(|| Error::Transport(format!("nothing bound at {full}")))?;
                let (tx, rx) = mpsc::channel(queue_depth);
                let id = hub.attach(tx);
                Ok(SubLink {
                    kind: LinkKind::Inproc { hub, id },
                    rx,
                })
            }
            TransportScheme::RtInproc => Err(Error::Transport(
                "the real-time transport attaches through its own registry".into(),
            )),
        }
    }

    fn from_stream(
        mut read: Box<dyn AsyncRead + Send + Unpin>,
        write: Box<dyn AsyncWrite + Send + Unpin>,
        queue_depth: usize,
    ) -> SubLink {
        let (tx, rx) = mpsc::channel(queue_depth);
        let reader = tokio::spawn(async move {
            loop {
                let frames = match read_message(&mut read).await {
                    Ok(frames) => frames,
                    Err(_) => break,
                };
                if frames.len() != 2 {
                    continue;
                }
                let Ok(topic) = frame_text(&frames[0]).map(str::to_string) else {
                    continue;
                };
                if tx.send((topic, frames[1].clone())).await.is_err() {
                    break;
                }
            }
        });
        SubLink {
            kind: LinkKind::Stream { write, reader },
            rx,
        }
    }

    /// Installs or removes one topic filter at the publisher.
    pub async fn set_subscribed(&mut self, topic: &str, on: bool) -> Result<()> {
        match &mut self.kind {
            LinkKind::Stream { write, .. } => {
                let cmd = if on { SUBSCRIBE_CMD } else { UNSUBSCRIBE_CMD };
                write_message(write, &[text_frame(cmd), text_frame(topic)])
                    .await
                    .map_err(|e| Error::Transport(format!("filter update failed: {e}")))
            }
            LinkKind::Inproc { hub, id } => {
                hub.set_filter(*id, topic, on);
                Ok(())
            }
        }
    }

    /// The next inbound publication, or `None` once the link is gone.
    /// Cancel-safe, so workers may race it against their control channel.
    pub async fn next(&mut self) -> Option<(String, Bytes)> {
        self.rx.recv().await
    }
}

impl Drop for SubLink {
    fn drop(&mut self) {
        match &self.kind {
            LinkKind::Stream { reader, .. } => reader.abort(),
            LinkKind::Inproc { hub, id } => hub.detach(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PubEndpoint, SubLink};
    use crate::endpoint::EndpointUrl;

    #[tokio::test(flavor = "multi_thread")]
    async fn inproc_fanout_honours_filters() {
        let urls = vec![EndpointUrl::parse("inproc://pubsub.unit").unwrap()];
        let endpoint = PubEndpoint::bind(&urls).await.unwrap();

        let mut link = SubLink::connect(&EndpointUrl::parse("inproc://pubsub.unit").unwrap(), 8)
            .await
            .unwrap();
        link.set_subscribed("a", true).await.unwrap();

        endpoint.publish("a.b", b"payload");
        endpoint.publish("unrelated", b"noise");

        let (topic, payload) = link.next().await.unwrap();
        assert_eq!(topic, "a.b");
        assert_eq!(&payload[..], b"payload");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_subscriber_receives_in_publish_order() {
        let urls = vec![EndpointUrl::parse("tcp://127.0.0.1:XXXXX").unwrap()];
        let endpoint = PubEndpoint::bind(&urls).await.unwrap();
        let resolved = EndpointUrl::parse(&endpoint.resolved[0]).unwrap();

        let mut link = SubLink::connect(&resolved, 32).await.unwrap();
        link.set_subscribed("stream", true).await.unwrap();
        // Filter installation crosses the wire; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        for i in 0..10u8 {
            endpoint.publish("stream", &[i]);
        }
        for i in 0..10u8 {
            let (topic, payload) = link.next().await.unwrap();
            assert_eq!(topic, "stream");
            assert_eq!(payload[0], i);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsubscribed_topics_are_not_delivered() {
        let urls = vec![EndpointUrl::parse("inproc://pubsub.unsub").unwrap()];
        let endpoint = PubEndpoint::bind(&urls).await.unwrap();

        let mut link = SubLink::connect(&EndpointUrl::parse("inproc://pubsub.unsub").unwrap(), 8)
            .await
            .unwrap();
        link.set_subscribed("x", true).await.unwrap();
        link.set_subscribed("x", false).await.unwrap();

        endpoint.publish("x", b"one");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(100), link.next())
                .await
                .is_err()
        );
    }
}
