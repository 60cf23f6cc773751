//! Recorder: two forwarders feeding one serializer

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::HttpSerializer;
use crate::config::{Config, LimitsConfig, Target};
use crate::hooks::Hooks;
use crate::interaction::Direction;
use crate::network::{bind, ConnectionPool, Listener, ServerHandle};
use crate::proxy::{Forwarder, ForwarderEvent};
use crate::storage::recording_label;
use crate::{Result, StenoError};

struct Running {
    outgoing: ServerHandle,
    incoming: ServerHandle,
    pumps: Vec<JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Captures traffic in both directions into the active scenario
pub struct Recorder {
    outgoing_target: Target,
    outgoing_port: u16,
    incoming_target: Target,
    incoming_port: u16,
    hooks: Hooks,
    limits: LimitsConfig,
    serializer: Arc<HttpSerializer>,
    running: OnceLock<Running>,
}

impl Recorder {
    /// Create a recorder writing into `storage_path`
    ///
    /// # Errors
    ///
    /// Returns error if either target URL is missing or invalid
    pub fn new(config: &Config, hooks: Hooks, storage_path: PathBuf) -> Result<Self> {
        let serializer = HttpSerializer::new(storage_path, hooks.raw_request_transform());
        Ok(Self {
            outgoing_target: config.outgoing_target()?,
            outgoing_port: config.outgoing_port,
            incoming_target: config.incoming_target()?,
            incoming_port: config.incoming_port,
            hooks,
            limits: config.limits.clone(),
            serializer: Arc::new(serializer),
            running: OnceLock::new(),
        })
    }

    /// Bind both listeners and prepare the storage directory
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::PortInUse`] naming the conflicting listener, or
    /// the error from creating the storage directory
    pub async fn start(&self) -> Result<()> {
        if self.running.get().is_some() {
            return Err(StenoError::Other("Recorder already started".to_string()));
        }

        let (outgoing_tcp, incoming_tcp, ()) = tokio::try_join!(
            bind(Listener::Outgoing, self.outgoing_port),
            bind(Listener::Incoming, self.incoming_port),
            self.serializer.initialize(),
        )?;

        let (outgoing, outgoing_events) = Forwarder::new(
            self.outgoing_target.clone(),
            self.hooks.request_shaping(),
            self.limits.max_body_size,
        )?;
        let (incoming, incoming_events) =
            Forwarder::new(self.incoming_target.clone(), None, self.limits.max_body_size)?;

        let running = Running {
            outgoing: outgoing.serve(
                outgoing_tcp,
                Listener::Outgoing,
                ConnectionPool::new(self.limits.max_connections),
            )?,
            incoming: incoming.serve(
                incoming_tcp,
                Listener::Incoming,
                ConnectionPool::new(self.limits.max_connections),
            )?,
            pumps: vec![
                spawn_pump(outgoing_events, Direction::Outgoing, Arc::clone(&self.serializer)),
                spawn_pump(incoming_events, Direction::Incoming, Arc::clone(&self.serializer)),
            ],
        };

        info!(
            "Recording: outgoing :{} -> {}, incoming :{} -> {}",
            running.outgoing.local_addr().port(),
            outgoing.target(),
            running.incoming.local_addr().port(),
            incoming.target()
        );

        self.running
            .set(running)
            .map_err(|_| StenoError::Other("Recorder already started".to_string()))
    }

    /// Record into a different scenario directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub async fn set_storage_path(&self, path: PathBuf) -> Result<()> {
        self.serializer.set_storage_path(path).await
    }

    /// Address of the listener receiving the application's requests
    #[must_use]
    pub fn outgoing_addr(&self) -> Option<SocketAddr> {
        self.running.get().map(|r| r.outgoing.local_addr())
    }

    /// Address of the listener receiving the external service's requests
    #[must_use]
    pub fn incoming_addr(&self) -> Option<SocketAddr> {
        self.running.get().map(|r| r.incoming.local_addr())
    }
}

/// Feed one forwarder's events to the serializer, in order
fn spawn_pump(
    mut events: UnboundedReceiver<ForwarderEvent>,
    direction: Direction,
    serializer: Arc<HttpSerializer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ForwarderEvent::Request {
                    request,
                    observed_at,
                } => {
                    let label = recording_label(observed_at, direction);
                    if let Err(e) = serializer.on_request(request, &label).await {
                        warn!("Failed to record {} request: {}", direction, e);
                    }
                }
                ForwarderEvent::Response(response) => {
                    if let Err(e) = serializer.on_response(response).await {
                        warn!("Failed to record {} response: {}", direction, e);
                    }
                }
                ForwarderEvent::Failure {
                    request_id,
                    message,
                } => {
                    error!("{} forwarder failed: {}", direction, message);
                    if let Err(e) = serializer.abandon(request_id).await {
                        warn!("Failed to discard {} cassette: {}", direction, e);
                    }
                }
            }
        }
    })
}
