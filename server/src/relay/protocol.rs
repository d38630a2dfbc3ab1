//! Hybrid connection control channel messages.
//!
//! Every message is a JSON text frame holding a single-key object naming the
//! command:
//!
//! ```text
//! relay → listener   {"request": {...}}     relayed HTTP request (body follows as binary frame)
//! relay → listener   {"accept": {...}}      WebSocket rendezvous offer
//! listener → relay   {"response": {...}}    reply to a request (body follows as binary frame)
//! listener → relay   {"renewToken": {...}}  fresh SAS token for the control channel
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::machines::routes::RouteResponse;

/// Commands the relay sends to the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlMessage {
    Request(RelayedRequest),
    Accept(AcceptCommand),
}

/// Commands the listener sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenerMessage {
    Response(RelayedResponse),
    RenewToken(RenewToken),
}

/// A relayed HTTP request.
///
/// When `method` is absent the request did not fit on the control channel
/// and must be read from the rendezvous `address` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// True when a binary frame with the request body follows.
    #[serde(default)]
    pub body: bool,
}

impl RelayedRequest {
    pub fn needs_rendezvous(&self) -> bool {
        self.method.is_none()
    }
}

/// A WebSocket client asking to be connected through a rendezvous address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptCommand {
    pub address: String,
    pub id: String,
    #[serde(default)]
    pub connect_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedResponse {
    pub request_id: String,
    pub status_code: u16,
    pub status_description: String,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    /// True when a binary frame with the response body follows.
    #[serde(default)]
    pub body: bool,
}

impl RelayedResponse {
    /// Build the response header and serialized body for a routed request.
    pub fn from_route(request_id: &str, route: &RouteResponse) -> (Self, Option<Vec<u8>>) {
        let body = route
            .body
            .as_ref()
            .map(|b| serde_json::to_vec(b).unwrap_or_default());
        let mut response_headers = HashMap::new();
        if body.is_some() {
            response_headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        (
            Self {
                request_id: request_id.to_string(),
                status_code: route.status,
                status_description: route.status_description().to_string(),
                response_headers,
                body: body.is_some(),
            },
            body,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewToken {
    pub token: String,
}

/// Turn an accept address into the URL that declines the rendezvous.
pub fn reject_url(address: &str, status_code: u16, description: &str) -> String {
    let address = address.replace("sb-hc-action=accept", "sb-hc-action=reject");
    let sep = if address.contains('?') { '&' } else { '?' };
    format!(
        "{address}{sep}sb-hc-statusCode={status_code}&sb-hc-statusDescription={}",
        urlencoding::encode(description)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_message_parses() {
        let raw = json!({
            "request": {
                "address": "wss://ns.example/$hc/machines?sb-hc-action=request&sb-hc-id=1",
                "id": "4cb542c3",
                "requestTarget": "/machines/start?machine=PUMP-7",
                "method": "POST",
                "remoteEndpoint": {"address": "10.0.0.1", "port": 4000},
                "requestHeaders": {"Host": "ns.example"},
                "body": false
            }
        });
        let ControlMessage::Request(req) = serde_json::from_value(raw).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.id, "4cb542c3");
        assert_eq!(req.method.as_deref(), Some("POST"));
        assert_eq!(req.request_target.as_deref(), Some("/machines/start?machine=PUMP-7"));
        assert!(!req.body);
        assert!(!req.needs_rendezvous());
    }

    #[test]
    fn address_only_request_needs_rendezvous() {
        let raw = json!({"request": {"address": "wss://ns.example/x", "id": "big"}});
        let ControlMessage::Request(req) = serde_json::from_value(raw).unwrap() else {
            panic!("expected request");
        };
        assert!(req.needs_rendezvous());
    }

    #[test]
    fn accept_message_parses() {
        let raw = json!({"accept": {"address": "wss://ns.example/a?sb-hc-action=accept", "id": "c1"}});
        assert!(matches!(
            serde_json::from_value::<ControlMessage>(raw).unwrap(),
            ControlMessage::Accept(_)
        ));
    }

    #[test]
    fn response_serializes_with_camel_case_keys() {
        let route = RouteResponse {
            status: 404,
            body: Some(json!({"error": "Unknown route"})),
        };
        let (response, body) = RelayedResponse::from_route("r1", &route);
        let value = serde_json::to_value(ListenerMessage::Response(response)).unwrap();
        assert_eq!(
            value,
            json!({
                "response": {
                    "requestId": "r1",
                    "statusCode": 404,
                    "statusDescription": "Not Found",
                    "responseHeaders": {"Content-Type": "application/json"},
                    "body": true
                }
            })
        );
        assert_eq!(body.unwrap(), br#"{"error":"Unknown route"}"#);
    }

    #[test]
    fn bodiless_response_has_no_content_type() {
        let route = RouteResponse {
            status: 405,
            body: None,
        };
        let (response, body) = RelayedResponse::from_route("r2", &route);
        assert!(!response.body);
        assert!(response.response_headers.is_empty());
        assert!(body.is_none());
    }

    #[test]
    fn renew_token_uses_camel_case_tag() {
        let msg = ListenerMessage::RenewToken(RenewToken {
            token: "SharedAccessSignature x".into(),
        });
        assert_eq!(
            serde_json::to_value(msg).unwrap(),
            json!({"renewToken": {"token": "SharedAccessSignature x"}})
        );
    }

    #[test]
    fn reject_url_swaps_action_and_appends_status() {
        let url = reject_url(
            "wss://ns.example/$hc/machines?sb-hc-action=accept&sb-hc-id=7",
            501,
            "WebSocket not supported",
        );
        assert_eq!(
            url,
            "wss://ns.example/$hc/machines?sb-hc-action=reject&sb-hc-id=7\
             &sb-hc-statusCode=501&sb-hc-statusDescription=WebSocket%20not%20supported"
        );
    }
}
