use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    runtime::Handle,
    sync::mpsc,
    time,
};
use tracing::*;

use crate::{config::Endpoint, error::TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Receives the lifecycle of a pool connection. Calls may arrive from any
/// thread and are not serialized with each other.
pub trait TransportEvents: Send + Sync {
    fn on_connected(&self);

    fn on_data(&self, data: Bytes);

    /// the pool closed the connection cleanly
    fn on_disconnected(&self);

    fn on_error(&self, err: TransportError);
}

/// Byte pipe to the pool.
///
/// Every `connect` ends in exactly one of `on_error` or `on_disconnected`,
/// unless `close` (or a newer `connect`) ends it first, which is silent.
pub trait Transport: Send + Sync {
    fn connect(&self, endpoint: &Endpoint, events: Arc<dyn TransportEvents>);

    fn send(&self, data: Bytes);

    fn close(&self);
}

struct Connection {
    id: u64,
    writer: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    current: Mutex<Option<Connection>>,
}

impl Inner {
    fn is_current(&self, id: u64) -> bool {
        matches!(self.current.lock().unwrap().as_ref(), Some(conn) if conn.id == id)
    }

    /// Forgets the connection if it is still the current one.
    fn release(&self, id: u64) -> bool {
        let mut guard = self.current.lock().unwrap();
        match guard.as_ref() {
            Some(conn) if conn.id == id => {
                guard.take();
                true
            }
            _ => false,
        }
    }
}

/// Plain TCP transport running on tokio.
pub struct TcpTransport {
    runtime: Handle,
    inner: Arc<Inner>,
}

impl TcpTransport {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime, inner: Arc::new(Inner::default()) }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, endpoint: &Endpoint, events: Arc<dyn TransportEvents>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (writer, writer_rx) = mpsc::unbounded_channel();

        // dropping the previous writer ends its session task
        let previous = self.inner.current.lock().unwrap().replace(Connection { id, writer });
        if previous.is_some() {
            debug!("replacing pool connection");
        }

        let inner = self.inner.clone();
        let addr = endpoint.to_string();
        self.runtime.spawn(session(inner, id, addr, events, writer_rx));
    }

    fn send(&self, data: Bytes) {
        let guard = self.inner.current.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => {
                if conn.writer.send(data).is_err() {
                    debug!("pool connection gone, dropping outbound data");
                }
            }
            None => debug!("not connected, dropping {} bytes", data.len()),
        }
    }

    fn close(&self) {
        self.inner.current.lock().unwrap().take();
    }
}

async fn session(
    inner: Arc<Inner>,
    id: u64,
    addr: String,
    events: Arc<dyn TransportEvents>,
    mut writer_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let stream = match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            if inner.release(id) {
                events.on_error(TransportError::Connect { endpoint: addr, source });
            }
            return;
        }
        Err(_) => {
            if inner.release(id) {
                events.on_error(TransportError::ConnectTimeout(addr));
            }
            return;
        }
    };

    if !inner.is_current(id) {
        debug!("connection to {addr} was closed before it was established");
        return;
    }
    if let Err(err) = stream.set_nodelay(true) {
        debug!("fail to set nodelay: {err}");
    }
    events.on_connected();

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            res = reader.read(&mut buf) => {
                match res {
                    Ok(0) => {
                        if inner.release(id) {
                            events.on_disconnected();
                        }
                        break;
                    }
                    Ok(n) => {
                        if inner.is_current(id) {
                            events.on_data(Bytes::copy_from_slice(&buf[..n]));
                        }
                    }
                    Err(err) => {
                        if inner.release(id) {
                            events.on_error(err.into());
                        }
                        break;
                    }
                }
            },
            data = writer_rx.recv() => {
                match data {
                    Some(data) => {
                        if let Err(err) = writer.write_all(&data).await {
                            if inner.release(id) {
                                events.on_error(err.into());
                            }
                            break;
                        }
                    }
                    None => {
                        debug!("closing connection to {addr}");
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            },
        }
    }
    trace!("pool session {id} done");
}
