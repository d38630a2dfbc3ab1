//! Relayed request routing.
//!
//! | Method | Target                              | Response                                |
//! |--------|-------------------------------------|-----------------------------------------|
//! | POST   | `/<channel>/start?machine=<id>`      | 200 `{"machine", "status": "started"}`  |
//! | POST   | `/<channel>/stop?machine=<id>`       | 200 `{"machine", "status": "stopped"}`  |
//! | POST   | `/<channel>/get_status?machine=<id>` | 200 `{"machine", "isOn": bool}`         |
//!
//! Errors: 400 when the route or `machine` is missing, 404 for any other
//! route, 405 (no body) for non-POST methods, 500 for handler faults.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{MachineRoute, MachineStore};
use crate::util::{parse_query, route_from_path, split_target};

/// Successful outcome of one relayed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Started { machine: String },
    Stopped { machine: String },
    Status { machine: String, is_on: bool },
}

/// Failure of one relayed request, mapped to a status code at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Route or machine missing")]
    MissingParameters,
    #[error("Unknown route")]
    UnknownRoute { route: String },
    #[error("{0}")]
    Internal(String),
}

impl RouteError {
    pub fn status(&self) -> u16 {
        match self {
            Self::MethodNotAllowed => 405,
            Self::MissingParameters => 400,
            Self::UnknownRoute { .. } => 404,
            Self::Internal(_) => 500,
        }
    }
}

/// Status code plus optional JSON body, ready to be written to the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl RouteResponse {
    pub fn status_description(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            _ => "",
        }
    }
}

impl From<Result<RouteOutcome, RouteError>> for RouteResponse {
    fn from(result: Result<RouteOutcome, RouteError>) -> Self {
        match result {
            Ok(RouteOutcome::Started { machine }) => Self {
                status: 200,
                body: Some(json!({"machine": machine, "status": "started"})),
            },
            Ok(RouteOutcome::Stopped { machine }) => Self {
                status: 200,
                body: Some(json!({"machine": machine, "status": "stopped"})),
            },
            Ok(RouteOutcome::Status { machine, is_on }) => Self {
                status: 200,
                body: Some(json!({"machine": machine, "isOn": is_on})),
            },
            Err(RouteError::MethodNotAllowed) => Self {
                status: 405,
                body: None,
            },
            Err(e) => Self {
                status: e.status(),
                body: Some(json!({"error": e.to_string()})),
            },
        }
    }
}

/// Interpret one relayed request and apply it to the store.
///
/// `target` is the request path plus query; `channel_path` is the hybrid
/// connection name, stripped from the front of the path to get the route.
pub async fn dispatch(
    store: &MachineStore,
    channel_path: &str,
    method: &str,
    target: &str,
) -> Result<RouteOutcome, RouteError> {
    if !method.eq_ignore_ascii_case("POST") {
        return Err(RouteError::MethodNotAllowed);
    }

    let (path, query) = split_target(target);
    let route = route_from_path(path, channel_path);
    let machine = parse_query(query).shift_remove("machine").unwrap_or_default();
    if route.trim().is_empty() || machine.trim().is_empty() {
        return Err(RouteError::MissingParameters);
    }

    info!(route, machine = %machine, "Processing request");

    match MachineRoute::parse(route) {
        Some(MachineRoute::Start) => {
            store.set_power(&machine, true).await;
            info!(machine = %machine, "Machine started");
            Ok(RouteOutcome::Started { machine })
        }
        Some(MachineRoute::Stop) => {
            store.set_power(&machine, false).await;
            info!(machine = %machine, "Machine stopped");
            Ok(RouteOutcome::Stopped { machine })
        }
        Some(MachineRoute::GetStatus) => {
            let is_on = store.is_on(&machine).await;
            debug!(machine = %machine, is_on, "Machine status checked");
            Ok(RouteOutcome::Status { machine, is_on })
        }
        None => {
            warn!(route, "Unknown route requested");
            Err(RouteError::UnknownRoute {
                route: route.to_string(),
            })
        }
    }
}
