//! Chat channel seam — abstract operations on the operator dialogue.
//!
//! The transport itself (Telegram, XMPP, Slack, …) is an external
//! collaborator. It implements [`ChatApi`] for outbound messages and feeds
//! inbound operator activity as [`ChatEvent`]s onto the coordinator's event
//! queue, restricted to the single configured operator principal. A
//! line-oriented console transport is bundled for development.

pub mod console;

use anyhow::Result;
use async_trait::async_trait;

/// An inline action button attached to a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Button {
    pub label: String,
    /// Compact `action:arg…` payload echoed back on click.
    pub payload: String,
}

impl Button {
    pub fn new(label: &str, payload: String) -> Self {
        Self {
            label: label.to_string(),
            payload,
        }
    }
}

/// Outbound chat operations. Handles are opaque strings; losing one
/// degrades the operator's view but never correctness.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Sends a message with an optional button row; returns its handle.
    async fn send(&self, text: &str, keyboard: &[Button]) -> Result<String>;

    /// Edits a previously sent message in place.
    async fn edit(&self, handle: &str, text: &str, keyboard: Option<&[Button]>) -> Result<()>;

    /// Deletes a message (best-effort; used to scrub secret prompts).
    async fn delete(&self, handle: &str) -> Result<()>;
}

/// Inbound operator activity, delivered by the transport.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ButtonClick {
        /// Handle of the message carrying the clicked button.
        handle: String,
        payload: String,
    },
    TextMessage {
        /// Handle of the operator's own message (so it can be scrubbed).
        handle: String,
        /// Handle of the message being replied to, if any.
        reply_to: Option<String>,
        text: String,
    },
}

/// Transport used when no chat channel is configured: outbound messages
/// are logged and no inbound events ever arrive, so every request stays
/// `pending` until acted on through other means.
pub struct NullChat;

#[async_trait]
impl ChatApi for NullChat {
    async fn send(&self, text: &str, _keyboard: &[Button]) -> Result<String> {
        tracing::info!("chat (null transport): {}", text.lines().next().unwrap_or(""));
        Ok(format!("null-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn edit(&self, _handle: &str, _text: &str, _keyboard: Option<&[Button]>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _handle: &str) -> Result<()> {
        Ok(())
    }
}

/// Decoded button payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Approve {
        request_id: String,
        scope: crate::request::TrustScope,
    },
    Deny {
        request_id: String,
    },
    AddSecret {
        name: String,
        request_id: Option<String>,
    },
}

/// Parses an `action:arg…` payload. Unknown actions yield `None`
/// (the coordinator tolerates and ignores them).
pub fn parse_payload(payload: &str) -> Option<Action> {
    let mut parts = payload.split(':');
    match parts.next()? {
        "approve" => {
            let request_id = parts.next()?.to_string();
            let scope = crate::request::TrustScope::parse(parts.next()?)?;
            Some(Action::Approve { request_id, scope })
        }
        "deny" => Some(Action::Deny {
            request_id: parts.next()?.to_string(),
        }),
        "add_secret" => {
            let name = parts.next()?.to_string();
            Some(Action::AddSecret {
                name,
                request_id: parts.next().map(str::to_string),
            })
        }
        _ => None,
    }
}

pub fn approve_payload(request_id: &str, scope: crate::request::TrustScope) -> String {
    format!("approve:{request_id}:{scope}")
}

pub fn deny_payload(request_id: &str) -> String {
    format!("deny:{request_id}")
}

pub fn add_secret_payload(name: &str, request_id: Option<&str>) -> String {
    match request_id {
        Some(id) => format!("add_secret:{name}:{id}"),
        None => format!("add_secret:{name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TrustScope;

    #[test]
    fn test_approve_roundtrip() {
        let payload = approve_payload("abc123", TrustScope::Once);
        assert_eq!(payload, "approve:abc123:once");
        assert_eq!(
            parse_payload(&payload),
            Some(Action::Approve {
                request_id: "abc123".to_string(),
                scope: TrustScope::Once,
            })
        );
    }

    #[test]
    fn test_approve_forever() {
        assert_eq!(
            parse_payload("approve:r1:forever"),
            Some(Action::Approve {
                request_id: "r1".to_string(),
                scope: TrustScope::Forever,
            })
        );
    }

    #[test]
    fn test_deny_roundtrip() {
        assert_eq!(
            parse_payload(&deny_payload("r9")),
            Some(Action::Deny {
                request_id: "r9".to_string()
            })
        );
    }

    #[test]
    fn test_add_secret_with_and_without_request() {
        assert_eq!(
            parse_payload(&add_secret_payload("API_KEY", Some("r1"))),
            Some(Action::AddSecret {
                name: "API_KEY".to_string(),
                request_id: Some("r1".to_string()),
            })
        );
        assert_eq!(
            parse_payload(&add_secret_payload("API_KEY", None)),
            Some(Action::AddSecret {
                name: "API_KEY".to_string(),
                request_id: None,
            })
        );
    }

    #[test]
    fn test_unknown_action_tolerated() {
        assert_eq!(parse_payload("reboot:now"), None);
        assert_eq!(parse_payload(""), None);
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(parse_payload("approve"), None);
        assert_eq!(parse_payload("approve:r1"), None);
        assert_eq!(parse_payload("approve:r1:weekly"), None);
        assert_eq!(parse_payload("deny"), None);
    }
}
