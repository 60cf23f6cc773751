//! Integration tests for the record-replay cycle

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use steno::config::{Config, Mode};
use steno::controller::{Controller, Device, Printer};
use steno::hooks::Hooks;

const SCENARIO: &str = "post_message";

/// Serve `reply` on an ephemeral port, reporting each request's method and path
async fn spawn_upstream(reply: &'static str) -> (SocketAddr, UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen, requests) = unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let seen = seen.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let seen = seen.clone();
                    async move {
                        let line = format!("{} {}", req.method(), req.uri().path());
                        let _ = req.into_body().collect().await;
                        let _ = seen.send(line);
                        let response = Response::builder()
                            .header("content-type", "application/json")
                            .body(Full::new(Bytes::from_static(reply.as_bytes())))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, requests)
}

async fn post(addr: SocketAddr, path: &str, body: &'static str) -> (StatusCode, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let request = Request::post(format!("http://127.0.0.1:{}{}", addr.port(), path))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

fn config(mode: Mode, scenario_dir: &Path, app: SocketAddr, service: Option<SocketAddr>) -> Config {
    Config {
        mode,
        control_port: 0,
        scenario_name: SCENARIO.to_string(),
        scenario_dir: scenario_dir.to_path_buf(),
        incoming_target_url: Some(format!("http://127.0.0.1:{}", app.port())),
        incoming_port: 0,
        outgoing_target_url: service.map(|addr| format!("http://127.0.0.1:{}", addr.port())),
        outgoing_port: 0,
        ..Config::default()
    }
}

fn quiet() -> Printer {
    Arc::new(|_: &str| {})
}

/// Wait until `count` cassettes in `dir` carry their response
async fn wait_for_cassettes(dir: &Path, count: usize) -> Vec<String> {
    for _ in 0..200 {
        let mut complete = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let content = std::fs::read_to_string(&path).unwrap_or_default();
            if content.contains("-----") && content.contains("HTTP/1.1 200") {
                complete.push(path.file_name().unwrap().to_string_lossy().into_owned());
            }
        }
        if complete.len() == count {
            complete.sort();
            return complete;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cassettes in {} never completed", dir.display());
}

async fn recv(requests: &mut UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .expect("request not received in time")
        .unwrap()
}

#[tokio::test]
async fn test_record_then_replay() {
    let scenarios = TempDir::new().unwrap();

    // Phase 1: record an incoming event followed by the app's outgoing call
    {
        let (service, mut service_requests) = spawn_upstream(r#"{"ok":true}"#).await;
        let (app, mut app_requests) = spawn_upstream("").await;

        let controller = Arc::new(
            Controller::new(
                config(Mode::Record, scenarios.path(), app, Some(service)),
                Hooks::default(),
                quiet(),
            )
            .unwrap(),
        );
        let _control = controller.start().await.unwrap();
        let Device::Recorder(recorder) = controller.device().await.unwrap() else {
            panic!("record mode builds a recorder");
        };

        let (status, _) = post(recorder.incoming_addr().unwrap(), "/events", r#"{"type":"ping"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(recv(&mut app_requests).await, "POST /events");

        tokio::time::sleep(Duration::from_millis(5)).await;

        let (status, body) = post(
            recorder.outgoing_addr().unwrap(),
            "/api/chat.postMessage",
            r#"{"text":"hi"}"#,
        )
        .await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, r#"{"ok":true}"#));
        assert_eq!(recv(&mut service_requests).await, "POST /api/chat.postMessage");

        let names = wait_for_cassettes(&scenarios.path().join(SCENARIO), 2).await;
        assert!(names[0].ends_with("_incoming_events_POST"), "{names:?}");
        assert!(
            names[1].ends_with("_outgoing_api_chat.postMessage_POST"),
            "{names:?}"
        );
    }

    // Phase 2: replay without the external service
    let (app, mut app_requests) = spawn_upstream("").await;
    let controller = Arc::new(
        Controller::new(
            config(Mode::Replay, scenarios.path(), app, None),
            Hooks::default(),
            quiet(),
        )
        .unwrap(),
    );
    let _control = controller.start().await.unwrap();
    let Device::Replayer(replayer) = controller.device().await.unwrap() else {
        panic!("replay mode builds a replayer");
    };

    // the incoming event has nothing before it, so it fires on load
    assert_eq!(recv(&mut app_requests).await, "POST /events");

    let addr = replayer.local_addr().unwrap();
    let (status, body) = post(addr, "/api/chat.postMessage", r#"{"text":"hi"}"#).await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, r#"{"ok":true}"#));

    let (status, _) = post(addr, "/api/chat.postMessage", r#"{"text":"hi"}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // the app's answer to the event lands in history asynchronously
    for _ in 0..100 {
        if replayer.history().await.unwrap().interactions.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let history = controller.stop_scenario().await.unwrap();
    assert_eq!(history.interactions.len(), 2);
    assert_eq!(history.meta.unmatched_count.incoming, 0);
    assert_eq!(history.meta.unmatched_count.outgoing, 0);

    // a restart replays the scenario from its beginning
    controller.start_scenario(SCENARIO).await.unwrap();
    assert_eq!(recv(&mut app_requests).await, "POST /events");
    let (status, _) = post(addr, "/api/chat.postMessage", r#"{"text":"hi"}"#).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_bind_conflict_names_option() {
    let scenarios = TempDir::new().unwrap();
    let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut replay = config(
        Mode::Replay,
        scenarios.path(),
        "127.0.0.1:1".parse().unwrap(),
        None,
    );
    replay.outgoing_port = port;
    let controller = Arc::new(Controller::new(replay, Hooks::default(), quiet()).unwrap());

    let message = controller.start().await.unwrap_err().to_string();
    assert_eq!(
        message,
        format!("Port {port} is already in use. Use --out-port to choose a different port.")
    );
}
