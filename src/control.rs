//! Control API: JSON over HTTP for switching and ending scenarios
//!
//! | Route | Mode | Reply |
//! |---|---|---|
//! | `GET /scenario` | record | `{"name": ...}` |
//! | `POST /scenario {"name"}` | record | `{"name": ...}` |
//! | `POST /start {"name"}` | replay | `{"name": ...}` |
//! | `POST /stop` | replay | history report |

use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Mode;
use crate::controller::Controller;
use crate::network::{error_response, json_response, read_body, ProxyBody};
use crate::{Result, StenoError};

/// Largest control request body accepted
const MAX_CONTROL_BODY: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
struct ScenarioBody {
    name: Option<String>,
}

/// Route one control request
///
/// # Errors
///
/// Never fails; errors become JSON error responses
pub async fn handle(controller: &Controller, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
    debug!("Control {} {}", req.method(), req.uri().path());

    let route = (req.method().clone(), req.uri().path().to_string());
    let response = match (&route.0, route.1.as_str()) {
        (&Method::GET, "/scenario") => get_scenario(controller).await,
        (&Method::POST, "/scenario") => set_scenario(controller, req).await,
        (&Method::POST, "/start") => start_scenario(controller, req).await,
        (&Method::POST, "/stop") => stop_scenario(controller).await,
        _ => Ok(described(
            StatusCode::NOT_FOUND,
            &format!("Cannot {} {}", route.0, route.1),
        )),
    };

    Ok(response.unwrap_or_else(|e| {
        warn!("Control {} {} failed: {}", route.0, route.1, e);
        error_response(&e)
    }))
}

async fn get_scenario(controller: &Controller) -> Result<Response<ProxyBody>> {
    let name = controller.scenario_name().await?;
    Ok(json_response(StatusCode::OK, &json!({ "name": name })))
}

async fn set_scenario(
    controller: &Controller,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>> {
    controller.require_mode(Mode::Record)?;
    let Some(name) = scenario_name(req).await? else {
        return Ok(described(
            StatusCode::BAD_REQUEST,
            "You must specify a scenario name",
        ));
    };

    let name = controller.set_scenario_name(&name).await?;
    Ok(json_response(StatusCode::OK, &json!({ "name": name })))
}

async fn start_scenario(
    controller: &Controller,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>> {
    controller.require_mode(Mode::Replay)?;
    let Some(name) = scenario_name(req).await? else {
        return Ok(described(
            StatusCode::BAD_REQUEST,
            "You must specify a scenario name",
        ));
    };

    match controller.start_scenario(&name).await {
        Ok(name) => Ok(json_response(StatusCode::OK, &json!({ "name": name }))),
        Err(e @ StenoError::InvalidScenarioName(_)) => Err(e),
        Err(e) => {
            warn!("Could not load scenario {}: {}", name, e);
            Ok(described(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Could not load scenario {name}"),
            ))
        }
    }
}

async fn stop_scenario(controller: &Controller) -> Result<Response<ProxyBody>> {
    let history = controller.stop_scenario().await?;
    Ok(json_response(StatusCode::OK, &history))
}

/// The non-empty `name` from a JSON body, if there is one
async fn scenario_name(req: Request<Incoming>) -> Result<Option<String>> {
    let (body, _) = read_body(req.into_body(), MAX_CONTROL_BODY).await?;
    let parsed: ScenarioBody = serde_json::from_slice(&body).unwrap_or_default();
    Ok(parsed.name.filter(|name| !name.is_empty()))
}

fn described(status: StatusCode, description: &str) -> Response<ProxyBody> {
    json_response(status, &json!({ "error": { "description": description } }))
}
