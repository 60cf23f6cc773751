//! Listener binding and accept loops

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ConnectionPool, ProxyBody};
use crate::{Result, StenoError};

/// The listeners Steno binds, each configured by its own CLI option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// Receives requests from the external service
    Incoming,
    /// Receives requests from the application
    Outgoing,
    /// Serves the control API
    Control,
}

impl Listener {
    /// The CLI option that sets this listener's port
    #[must_use]
    pub fn cli_option(self) -> &'static str {
        match self {
            Listener::Incoming => "--in-port",
            Listener::Outgoing => "--out-port",
            Listener::Control => "--control-port",
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Incoming => f.write_str("incoming"),
            Listener::Outgoing => f.write_str("outgoing"),
            Listener::Control => f.write_str("control"),
        }
    }
}

/// Bind a listener's port on all interfaces
///
/// # Errors
///
/// Returns [`StenoError::PortInUse`] if the port is taken, or the I/O error otherwise
pub async fn bind(listener: Listener, port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == io::ErrorKind::AddrInUse {
            StenoError::PortInUse { listener, port }
        } else {
            StenoError::Io(e)
        }
    })
}

/// A running accept loop; dropping it stops accepting connections
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serve HTTP/1.1 on a bound listener, one task per connection
///
/// An `Err` from `handler` drops that connection without a response.
///
/// # Errors
///
/// Returns error if the listener's local address cannot be read
pub fn serve<F, Fut>(
    tcp: TcpListener,
    listener: Listener,
    pool: ConnectionPool,
    handler: F,
) -> Result<ServerHandle>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<ProxyBody>>> + Send + 'static,
{
    let local_addr = tcp.local_addr()?;
    info!("{} listener on {}", listener, local_addr);

    let task = tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match tcp.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("{} accept error: {}", listener, e);
                    continue;
                }
            };

            let Some(guard) = pool.try_acquire() else {
                warn!("Connection limit reached, rejecting {}", peer_addr);
                drop(stream);
                continue;
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let service = service_fn(move |req| handler(req));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("{} connection from {} ended: {}", listener, peer_addr, e);
                }
            });
        }
    });

    Ok(ServerHandle { local_addr, task })
}
