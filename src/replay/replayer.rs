//! Replayer: answers the application from the catalog and plays back the
//! external service's own requests

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{History, InteractionCatalog, Trigger};
use crate::config::{Config, LimitsConfig, Target};
use crate::hooks::OutboundOptions;
use crate::interaction::{now_millis, Interaction, RequestId, ResponseInfo};
use crate::network::{
    bind, check_content_length, error_response, read_body, recorded_response, request_info,
    response_info, serve, text_response, ConnectionPool, HttpClient, Listener, ProxyBody,
    ServerHandle, TapBody,
};
use crate::{Result, StenoError};

type SharedCatalog = Arc<Mutex<InteractionCatalog>>;

struct Running {
    server: ServerHandle,
    pumps: Vec<JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Serves a scenario back to the application
pub struct Replayer {
    app_target: Target,
    port: u16,
    limits: LimitsConfig,
    catalog: SharedCatalog,
    triggers: Mutex<Option<UnboundedReceiver<Trigger>>>,
    client: HttpClient,
    running: OnceLock<Running>,
}

impl Replayer {
    /// Create a replayer for the scenario at `storage_path`
    ///
    /// # Errors
    ///
    /// Returns error if the application URL is missing or invalid, or the
    /// upstream client cannot be built
    pub fn new(config: &Config, storage_path: PathBuf) -> Result<Self> {
        let (catalog, triggers) = InteractionCatalog::new(storage_path);
        Ok(Self {
            app_target: config.incoming_target()?,
            port: config.outgoing_port,
            limits: config.limits.clone(),
            catalog: Arc::new(Mutex::new(catalog)),
            triggers: Mutex::new(Some(triggers)),
            client: HttpClient::new()?,
            running: OnceLock::new(),
        })
    }

    /// Bind the listener and load the scenario
    ///
    /// A missing scenario directory starts an empty scenario.
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::PortInUse`] if the port is taken, or the error
    /// from reading the scenario
    pub async fn start(&self) -> Result<()> {
        if self.running.get().is_some() {
            return Err(StenoError::Other("Replayer already started".to_string()));
        }

        let path = self.catalog.lock().await.storage_path().to_path_buf();
        let (tcp, ()) = tokio::try_join!(bind(Listener::Outgoing, self.port), async {
            match self.catalog.lock().await.load_path(path).await {
                Err(StenoError::ScenarioNotFound(path)) => {
                    warn!("Scenario {} not found, starting empty", path.display());
                    Ok(())
                }
                other => other,
            }
        })?;

        let triggers = self
            .triggers
            .lock()
            .await
            .take()
            .ok_or_else(|| StenoError::Other("Replayer already started".to_string()))?;
        let (completions, completed) = unbounded_channel();

        let service = Arc::new(ReplayService {
            catalog: Arc::clone(&self.catalog),
            completions,
            max_body_size: self.limits.max_body_size,
        });
        let server = serve(
            tcp,
            Listener::Outgoing,
            ConnectionPool::new(self.limits.max_connections),
            move |req| {
                let service = Arc::clone(&service);
                async move { service.handle(req).await }
            },
        )?;
        info!(
            "Replaying on :{}, incoming requests go to {}",
            server.local_addr().port(),
            self.app_target
        );

        let running = Running {
            server,
            pumps: vec![
                spawn_trigger_pump(
                    triggers,
                    self.client.clone(),
                    self.app_target.clone(),
                    self.limits.max_body_size,
                    Arc::clone(&self.catalog),
                ),
                spawn_completion_pump(completed, Arc::clone(&self.catalog)),
            ],
        };
        self.running
            .set(running)
            .map_err(|_| StenoError::Other("Replayer already started".to_string()))
    }

    /// Load a scenario, restarting replay from its beginning
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::ScenarioNotFound`] if the directory does not
    /// exist (the catalog is left empty), or the error from reading it
    pub async fn set_storage_path(&self, path: PathBuf) -> Result<()> {
        self.catalog.lock().await.load_path(path).await
    }

    /// Report of what happened since the scenario was loaded or reset
    ///
    /// # Errors
    ///
    /// Returns error if a history entry has a header with no value
    pub async fn history(&self) -> Result<History> {
        let catalog = self.catalog.lock().await;
        History::build(catalog.history(), catalog.unmatched_count())
    }

    /// Forget matches and history, keeping the loaded scenario
    pub async fn reset(&self) {
        self.catalog.lock().await.reset();
    }

    /// Address of the listener receiving the application's requests
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.get().map(|r| r.server.local_addr())
    }
}

/// Answers the application's requests from the catalog
struct ReplayService {
    catalog: SharedCatalog,
    completions: UnboundedSender<RequestId>,
    max_body_size: usize,
}

impl ReplayService {
    async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        if let Err(e) = check_content_length(req.headers(), self.max_body_size) {
            return Ok(error_response(&e));
        }

        let (parts, body) = req.into_parts();
        let (body, trailers) = match read_body(body, self.max_body_size).await {
            Ok(read) => read,
            Err(e @ StenoError::DataTooLarge { .. }) => return Ok(error_response(&e)),
            Err(e) => return Err(e),
        };
        let request = request_info(&parts, body, trailers.as_ref());

        let matched = self.catalog.lock().await.find_matching_interaction(&request);
        let Some(matched) = matched else {
            warn!("No recorded interaction for {} {}", request.method, request.url);
            return Ok(text_response(
                StatusCode::NOT_FOUND,
                format!(
                    "Steno has no recorded interaction for {} {}",
                    request.method, request.url
                ),
            ));
        };

        let request_id = matched.request.id;
        let recorded = matched.response;
        let completions = self.completions.clone();
        let body = TapBody::new(
            Full::new(recorded.body.clone().unwrap_or_default()),
            move |_, _| {
                if completions.send(request_id).is_err() {
                    debug!("Completion dropped for {}", request_id);
                }
            },
        );

        Ok(recorded_response(
            &recorded,
            body.map_err(|never| match never {}).boxed(),
        ))
    }
}

fn spawn_completion_pump(
    mut completed: UnboundedReceiver<RequestId>,
    catalog: SharedCatalog,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request_id) = completed.recv().await {
            catalog.lock().await.on_outgoing_response(request_id);
        }
    })
}

fn spawn_trigger_pump(
    mut triggers: UnboundedReceiver<Trigger>,
    client: HttpClient,
    app_target: Target,
    max_body_size: usize,
    catalog: SharedCatalog,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(trigger) = triggers.recv().await {
            let client = client.clone();
            let app_target = app_target.clone();
            let catalog = Arc::clone(&catalog);
            tokio::spawn(async move {
                let request_timestamp = now_millis();
                let request = &trigger.interaction.request;
                let sent =
                    send_incoming(&client, &app_target, &trigger.interaction, max_body_size).await;
                match sent {
                    Ok(response) => {
                        catalog
                            .lock()
                            .await
                            .on_incoming_response(&trigger, request_timestamp, response);
                    }
                    Err(e) => warn!(
                        "Incoming request {} {} failed: {}",
                        request.method, request.url, e
                    ),
                }
            });
        }
    })
}

/// Send a recorded incoming request to the application
async fn send_incoming(
    client: &HttpClient,
    app_target: &Target,
    interaction: &Interaction,
    max_body_size: usize,
) -> Result<ResponseInfo> {
    let request = &interaction.request;
    debug!("Sending {} {} to {}", request.method, request.url, app_target);

    let mut options = OutboundOptions::for_target(app_target, request);
    options.fix_host_header();
    // Recomputed from the stored body
    options.headers.remove("content-length");

    let upstream = HttpClient::build_request(&options, request.body.clone().unwrap_or_default())?;
    let response = client
        .send(upstream)
        .await
        .map_err(|e| StenoError::Upstream(e.to_string()))?;

    let (parts, body) = response.into_parts();
    let (body, trailers) = read_body(body, max_body_size).await?;
    Ok(response_info(&parts, request.id, body, trailers.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::time::Duration;
    use tempfile::TempDir;

    const PING: &str = "GET /ping HTTP/1.1\nhost: api.example.com\n\n\"\"\n\n-----\n\n\
        HTTP/1.1 200 OK\ncontent-type: text/plain\ncontent-length: 4\n\n\"pong\"\n";

    fn config(app_port: u16) -> Config {
        Config {
            mode: Mode::Replay,
            incoming_target_url: Some(format!("http://127.0.0.1:{app_port}")),
            outgoing_port: 0,
            ..Config::default()
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<hyper::body::Bytes>>();
        let uri = format!("http://127.0.0.1:{}{}", addr.port(), path);
        let response = client
            .request(Request::get(uri).body(Full::default()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_serves_recorded_response_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("100_outgoing_ping_GET"), PING).unwrap();

        let replayer = Replayer::new(&config(1), dir.path().to_path_buf()).unwrap();
        replayer.start().await.unwrap();
        let addr = replayer.local_addr().unwrap();

        assert_eq!(get(addr, "/ping").await, (StatusCode::OK, "pong".to_string()));
        let (status, _) = get(addr, "/ping").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // the completion pump stamps the response asynchronously
        let mut history = replayer.history().await.unwrap();
        for _ in 0..50 {
            if history.interactions[0].response.timestamp.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            history = replayer.history().await.unwrap();
        }
        assert_eq!(history.interactions.len(), 1);
        assert!(history.interactions[0].response.timestamp.is_some());
        assert!(history.meta.duration_ms.is_some());
        assert_eq!(history.meta.unmatched_count.outgoing, 0);

        replayer.reset().await;
        assert_eq!(get(addr, "/ping").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_scenario_starts_empty() {
        let dir = TempDir::new().unwrap();
        let replayer = Replayer::new(&config(1), dir.path().join("missing")).unwrap();
        replayer.start().await.unwrap();

        let (status, body) = get(replayer.local_addr().unwrap(), "/ping").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("GET /ping"));

        assert!(matches!(
            replayer.set_storage_path(dir.path().join("still_missing")).await,
            Err(StenoError::ScenarioNotFound(_))
        ));
    }
}
