//! Error Marshaller
//!
//! Handler failures cross the context boundary as a [`MarshalledError`], a
//! record tagged by `errorConstructor`:
//!
//! - `"Error"`: generic, `message`, `stack`
//! - `"AjaxErr"`: HTTP failure, `message`, `stack`, `ajaxErrorDetails`
//! - `"HandlerNotFound"`: the receiving context has no handler for `kind`
//! - `"Undeliverable"`: the broker could not reach the addressed context
//!
//! The receiving side rebuilds an equivalent error whose stack joins the
//! caller's captured call site and the responder's stack, each delimited.

use crate::bus::error::BusError;
use serde::{Deserialize, Serialize};
use std::backtrace::BacktraceStatus;

/// A failed HTTP request made by a handler.
///
/// Handlers return it inside `anyhow::Error`; the marshaller recognizes it by
/// downcast and carries every field across the boundary verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    pub message: String,
    pub stack: String,
    pub status: u16,
    pub url: String,
    pub response_text: String,
    pub status_text: String,
    /// Message extracted from the server's error body
    pub res_msg: Option<String>,
    /// Details extracted from the server's error body
    pub res_details: Option<String>,
}

impl HttpError {
    #[track_caller]
    pub fn new(message: impl Into<String>, status: u16, url: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: crate::bus::envelope::capture_stack(false),
            status,
            url: url.into(),
            response_text: String::new(),
            status_text: String::new(),
            res_msg: None,
            res_details: None,
        }
    }

    pub fn with_response(mut self, response_text: impl Into<String>, status_text: impl Into<String>) -> Self {
        self.response_text = response_text.into();
        self.status_text = status_text.into();
        self
    }

    pub fn with_server_message(mut self, res_msg: impl Into<String>, res_details: Option<String>) -> Self {
        self.res_msg = Some(res_msg.into());
        self.res_details = res_details;
        self
    }
}

/// HTTP-specific fields of an `AjaxErr` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpErrorDetails {
    pub status: u16,
    pub url: String,
    pub response_text: String,
    pub status_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_details: Option<String>,
}

/// Serializable error record. The tag fully determines the fields present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "errorConstructor")]
pub enum MarshalledError {
    #[serde(rename = "Error")]
    Generic {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    #[serde(rename = "AjaxErr")]
    Http {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(rename = "ajaxErrorDetails")]
        details: HttpErrorDetails,
    },
    #[serde(rename = "HandlerNotFound")]
    HandlerNotFound {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        kind: String,
    },
    /// Delivery failure on a relay leg. `not_ready` marks a target nobody listens on yet.
    #[serde(rename = "Undeliverable", rename_all = "camelCase")]
    Undeliverable {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default)]
        not_ready: bool,
    },
}

impl MarshalledError {
    pub fn message(&self) -> &str {
        match self {
            MarshalledError::Generic { message, .. }
            | MarshalledError::Http { message, .. }
            | MarshalledError::HandlerNotFound { message, .. }
            | MarshalledError::Undeliverable { message, .. } => message,
        }
    }

    pub fn handler_not_found(kind: &str, responder: &str) -> Self {
        MarshalledError::HandlerNotFound {
            message: format!("handler \"{}\" not set", kind),
            stack: Some(responder.to_string()),
            kind: kind.to_string(),
        }
    }

    pub fn undeliverable(message: impl Into<String>, not_ready: bool, responder: &str) -> Self {
        MarshalledError::Undeliverable {
            message: message.into(),
            stack: Some(responder.to_string()),
            not_ready,
        }
    }

    pub fn generic(message: impl Into<String>, responder: &str) -> Self {
        MarshalledError::Generic {
            message: message.into(),
            stack: Some(responder.to_string()),
        }
    }
}

/// Error rebuilt on the caller's side from a [`MarshalledError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("{message}")]
    Generic { message: String, stack: String },

    #[error("{0}")]
    Http(HttpError),
}

impl RemoteError {
    pub fn message(&self) -> &str {
        match self {
            RemoteError::Generic { message, .. } => message,
            RemoteError::Http(e) => &e.message,
        }
    }

    /// Combined caller + responder stack
    pub fn stack(&self) -> &str {
        match self {
            RemoteError::Generic { stack, .. } => stack,
            RemoteError::Http(e) => &e.stack,
        }
    }

    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            RemoteError::Http(e) => Some(e),
            RemoteError::Generic { .. } => None,
        }
    }
}

/// Marshal a handler failure. `responder` describes where the handler runs and
/// becomes the stack when the error itself carries none.
pub fn to_wire(error: &anyhow::Error, responder: &str) -> MarshalledError {
    if let Some(http) = error.downcast_ref::<HttpError>() {
        return MarshalledError::Http {
            message: http.message.clone(),
            stack: Some(format!("{}\n{}", http.stack, responder)),
            details: HttpErrorDetails {
                status: http.status,
                url: http.url.clone(),
                response_text: http.response_text.clone(),
                status_text: http.status_text.clone(),
                res_msg: http.res_msg.clone(),
                res_details: http.res_details.clone(),
            },
        };
    }
    let backtrace = error.backtrace();
    let stack = if backtrace.status() == BacktraceStatus::Captured {
        format!("{}\n{}", responder, backtrace)
    } else {
        responder.to_string()
    };
    MarshalledError::Generic {
        message: format!("{:#}", error),
        stack: Some(stack),
    }
}

/// Both ends' stacks joined into one delimited trace.
pub fn combined_stack(caller_stack: &str, responder_stack: Option<&str>) -> String {
    format!(
        "\n\n[callerStack]\n{}\n[/callerStack]\n\n[responderStack]\n{}\n[/responderStack]\n",
        caller_stack,
        responder_stack.unwrap_or("(no stack)")
    )
}

/// Rebuild the error a call to `kind` failed with, annotated with the caller's stack.
pub fn from_wire(record: MarshalledError, kind: &str, caller_stack: &str) -> BusError {
    match record {
        MarshalledError::Generic { message, stack } => BusError::Remote(RemoteError::Generic {
            message: format!("BusMsg({}) {}", kind, message),
            stack: combined_stack(caller_stack, stack.as_deref()),
        }),
        MarshalledError::Http { message, stack, details } => BusError::Remote(RemoteError::Http(HttpError {
            message: format!("BusMsg({}) {}", kind, message),
            stack: combined_stack(caller_stack, stack.as_deref()),
            status: details.status,
            url: details.url,
            response_text: details.response_text,
            status_text: details.status_text,
            res_msg: details.res_msg,
            res_details: details.res_details,
        })),
        MarshalledError::HandlerNotFound { kind: missing, .. } => BusError::HandlerNotFound { kind: missing },
        MarshalledError::Undeliverable { message, not_ready: true, .. } => BusError::ContextNotReady {
            kind: kind.to_string(),
            diagnostic: message,
        },
        MarshalledError::Undeliverable { message, not_ready: false, .. } => BusError::Transport {
            kind: kind.to_string(),
            diagnostic: message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // TEST040: Test an HTTP error keeps status, url and body exactly across the boundary
    #[test]
    fn test_http_error_roundtrip() {
        let original = HttpError::new("Bad Request", 400, "https://api.example.com/v1/keys?q=a%20b")
            .with_response("{\"error\":{\"message\":\"nope\"}}\n", "Bad Request")
            .with_server_message("nope", Some("details here".to_string()));
        let err = anyhow::Error::new(original.clone());
        let wire = to_wire(&err, "handler 'ajax' in background");

        // Cross the boundary as JSON like the transport does
        let text = serde_json::to_string(&wire).unwrap();
        let wire: MarshalledError = serde_json::from_str(&text).unwrap();

        match from_wire(wire, "ajax", "at caller.rs:1:1") {
            BusError::Remote(RemoteError::Http(e)) => {
                assert_eq!(e.status, original.status);
                assert_eq!(e.url, original.url);
                assert_eq!(e.response_text, original.response_text);
                assert_eq!(e.status_text, original.status_text);
                assert_eq!(e.res_msg, original.res_msg);
                assert_eq!(e.res_details, original.res_details);
                assert_eq!(e.message, "BusMsg(ajax) Bad Request");
                assert!(e.stack.contains("at caller.rs:1:1"));
                assert!(e.stack.contains("marshal.rs"), "responder stack lost: {}", e.stack);
            }
            other => panic!("expected Http remote error, got {:?}", other),
        }
    }

    // TEST041: Test HTTP errors wrapped with context are still recognized
    #[test]
    fn test_http_error_with_context() {
        let err = anyhow::Error::new(HttpError::new("gone", 410, "https://x")).context("fetching key");
        match to_wire(&err, "r") {
            MarshalledError::Http { details, .. } => assert_eq!(details.status, 410),
            other => panic!("expected Http, got {:?}", other),
        }
    }

    // TEST042: Test generic errors marshal message with cause chain and keep both stacks
    #[test]
    fn test_generic_error_roundtrip() {
        let err = anyhow::anyhow!("boom").context("decrypting");
        let wire = to_wire(&err, "handler 'decrypt' in context 5:2");
        assert_eq!(wire.message(), "decrypting: boom");

        let rebuilt = from_wire(wire, "decrypt", "at caller.rs:9:9");
        match rebuilt {
            BusError::Remote(remote) => {
                assert_eq!(remote.message(), "BusMsg(decrypt) decrypting: boom");
                let stack = remote.stack();
                let caller = stack.find("[callerStack]\nat caller.rs:9:9\n[/callerStack]").unwrap();
                let responder = stack.find("[responderStack]\nhandler 'decrypt' in context 5:2").unwrap();
                assert!(caller < responder);
                assert!(remote.as_http().is_none());
            }
            other => panic!("expected Remote, got {:?}", other),
        }
    }

    // TEST043: Test the wire tag uses the interoperable constructor names
    #[test]
    fn test_wire_tags() {
        let generic = serde_json::to_value(MarshalledError::generic("m", "s")).unwrap();
        assert_eq!(generic["errorConstructor"], "Error");
        assert_eq!(generic["message"], "m");

        let http = to_wire(&anyhow::Error::new(HttpError::new("x", 500, "u")), "r");
        let http = serde_json::to_value(http).unwrap();
        assert_eq!(http["errorConstructor"], "AjaxErr");
        assert_eq!(http["ajaxErrorDetails"]["status"], 500);
        assert_eq!(http["ajaxErrorDetails"]["responseText"], "");
        assert!(http["ajaxErrorDetails"].get("resMsg").is_none());

        let source_generic: MarshalledError =
            serde_json::from_str(r#"{"errorConstructor":"Error","message":"legacy"}"#).unwrap();
        assert_eq!(source_generic, MarshalledError::Generic { message: "legacy".into(), stack: None });
    }

    // TEST044: Test HandlerNotFound records rebuild as the typed taxonomy error
    #[test]
    fn test_handler_not_found_rebuild() {
        let wire = MarshalledError::handler_not_found("close_dialog", "context 1:0");
        assert!(wire.message().contains("close_dialog"));
        match from_wire(wire, "close_dialog", "") {
            BusError::HandlerNotFound { kind } => assert_eq!(kind, "close_dialog"),
            other => panic!("expected HandlerNotFound, got {:?}", other),
        }
    }

    // TEST045: Test a missing responder stack is marked rather than dropped
    #[test]
    fn test_combined_stack_without_responder() {
        let s = combined_stack("at a", None);
        assert!(s.contains("[callerStack]\nat a\n[/callerStack]"));
        assert!(s.contains("[responderStack]\n(no stack)\n[/responderStack]"));
    }

    // TEST046: Test relay failures rebuild as transport errors, never as remote handler errors
    #[test]
    fn test_undeliverable_rebuild() {
        let wire = MarshalledError::undeliverable("Receiving end does not exist.", true, "relay to 9:9 in background");
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["errorConstructor"], "Undeliverable");
        assert_eq!(json["notReady"], true);

        let wire: MarshalledError = serde_json::from_value(json).unwrap();
        match from_wire(wire, "set_css", "at caller.rs:1:1") {
            BusError::ContextNotReady { kind, diagnostic } => {
                assert_eq!(kind, "set_css");
                assert!(diagnostic.contains("Receiving end"));
            }
            other => panic!("expected ContextNotReady, got {:?}", other),
        }

        let closed = MarshalledError::undeliverable("port closed", false, "relay");
        match from_wire(closed, "set_css", "") {
            BusError::Transport { kind, diagnostic } => {
                assert_eq!(kind, "set_css");
                assert_eq!(diagnostic, "port closed");
            }
            other => panic!("expected Transport, got {:?}", other),
        }
    }
}
