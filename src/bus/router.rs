//! Delivery Router — the broker's per-envelope decision
//!
//! Every envelope the background observes gets exactly one [`Route`]:
//!
//! ```text
//!   relay policy says relay? ──yes──▶ broadcast from a unit?  ──yes──▶ Bounce(unit)
//!          │                                 │no
//!          │no                               ▼
//!          │                        destination parses?  ──yes──▶ Relay(frame)
//!          │                                 │no
//!          │                                 ▼
//!          │                           Unroutable
//!          ▼
//!   broker has a handler? ──yes──▶ Local
//!          │no
//!          ▼
//!   no destination? ──yes──▶ NoSuchHandler
//!          │no
//!          ▼
//!        Ignore
//! ```
//!
//! The relay heuristic is platform specific, so it is a [`RelayPolicy`] object
//! the broker is constructed with rather than part of this state machine.

use crate::address::{Address, FrameAddress, BROADCAST};
use crate::bus::transport::SenderInfo;
use crate::config::{BusConfig, RelayMode};
use std::sync::Arc;

/// Decides whether the broker must forward a context-to-context message
/// because the host will not deliver it directly.
pub trait RelayPolicy: Send + Sync {
    /// `destination` is the raw wire destination, `None` for the background.
    fn should_relay(&self, sender: &SenderInfo, destination: Option<&str>) -> bool;
}

/// Heuristic for hosts that deliver a frame's broker-bound messages directly to
/// extension pages as well.
///
/// Relaying is skipped only when a frame addresses its own top-level unit and
/// that unit is an extension page; the host already delivered the message there.
/// Senders outside any unit and background-bound messages are never relayed.
///
/// Any other sender addressing its own unit is relayed, whatever its own URL
/// and whatever the unit's scheme (`https://`, `http://`, `file://`). The host
/// delivers nothing directly to a unit that is not an extension page, so a
/// narrower rule, such as relaying only extension frames inside `https://`
/// units, would leave content-script messages to their unit unanswered.
#[derive(Debug, Clone)]
pub struct ChromiumRelayPolicy {
    extension_origin: String,
}

impl ChromiumRelayPolicy {
    pub fn new(extension_origin: impl Into<String>) -> Self {
        Self {
            extension_origin: extension_origin.into(),
        }
    }
}

impl RelayPolicy for ChromiumRelayPolicy {
    fn should_relay(&self, sender: &SenderInfo, destination: Option<&str>) -> bool {
        let (Some(frame), Some(destination)) = (sender.frame(), destination) else {
            return false;
        };
        if destination != frame.top_level().to_string() {
            return true;
        }
        let parent_is_extension_page = sender
            .top_url()
            .is_some_and(|url| url.starts_with(&self.extension_origin));
        !parent_is_extension_page
    }
}

/// Relays every message between two non-background contexts. For hosts that
/// deliver nothing directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRelay;

impl RelayPolicy for AlwaysRelay {
    fn should_relay(&self, sender: &SenderInfo, destination: Option<&str>) -> bool {
        sender.frame().is_some() && destination.is_some()
    }
}

/// Build the policy named by `config.relay_mode`.
pub fn policy_for(config: &BusConfig) -> Arc<dyn RelayPolicy> {
    match config.relay_mode {
        RelayMode::Chromium => Arc::new(ChromiumRelayPolicy::new(config.extension_origin.clone())),
        RelayMode::Always => Arc::new(AlwaysRelay),
    }
}

/// What the broker does with one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Forward verbatim to this frame and pass its answer back
    Relay(FrameAddress),
    /// Re-deliver a broadcast to every frame of the sender's own unit
    Bounce { major: u64 },
    /// Dispatch to the broker's own handler
    Local,
    /// Background-bound with no handler
    NoSuchHandler,
    /// Not for the broker; no response
    Ignore,
    /// Had to be relayed but the destination is not a frame address
    Unroutable(String),
}

/// Decide the route for an envelope addressed to `to`, sent by `sender`.
pub fn route(to: Option<&str>, sender: &SenderInfo, policy: &dyn RelayPolicy, has_local_handler: bool) -> Route {
    if policy.should_relay(sender, to) {
        if let (Some(BROADCAST), Some(frame)) = (to, sender.frame()) {
            return Route::Bounce { major: frame.major };
        }
        return match Address::from_wire(to) {
            Ok(Address::Frame(frame)) => Route::Relay(frame),
            Ok(other) => Route::Unroutable(format!("cannot relay to {}", other)),
            Err(e) => Route::Unroutable(format!("cannot parse destination in {}: {}", to.unwrap_or("null"), e)),
        };
    }
    if has_local_handler {
        Route::Local
    } else if to.is_none() {
        Route::NoSuchHandler
    } else {
        Route::Ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "ctxbus-extension://";

    fn frame_in(major: u64, minor: u64, url: &str, top_url: &str) -> SenderInfo {
        SenderInfo::Context {
            frame: Some(FrameAddress::new(major, minor)),
            url: url.to_string(),
            top_url: Some(top_url.to_string()),
        }
    }

    fn popup() -> SenderInfo {
        SenderInfo::Context {
            frame: None,
            url: format!("{}popup.htm", ORIGIN),
            top_url: None,
        }
    }

    // TEST120: Test the Chromium heuristic skips relay only for a frame messaging its extension-page parent
    #[test]
    fn test_chromium_policy() {
        let policy = ChromiumRelayPolicy::new(ORIGIN);
        let in_extension_page = frame_in(3, 1, "ctxbus-extension://block.htm", "ctxbus-extension://inbox.htm");
        let in_web_page = frame_in(3, 1, "ctxbus-extension://block.htm", "https://mail.example.com/");

        assert!(!policy.should_relay(&in_extension_page, Some("3:0")));
        assert!(policy.should_relay(&in_web_page, Some("3:0")));
        // A content script in a web sub-frame reaches its unit only through the broker
        let content_script = frame_in(3, 1, "https://ads.example/", "https://mail.example.com/");
        assert!(policy.should_relay(&content_script, Some("3:0")));
        let in_plain_http = frame_in(3, 1, "ctxbus-extension://block.htm", "http://intranet.example/");
        assert!(policy.should_relay(&in_plain_http, Some("3:0")));
        assert!(policy.should_relay(&in_extension_page, Some("3:2")));
        assert!(policy.should_relay(&in_extension_page, Some("4:0")));
        assert!(policy.should_relay(&in_extension_page, Some("broadcast")));
        assert!(!policy.should_relay(&in_extension_page, None));
        assert!(!policy.should_relay(&popup(), Some("3:0")));
        assert!(!policy.should_relay(&SenderInfo::Background, Some("3:0")));
    }

    // TEST121: Test AlwaysRelay relays any context-to-context message
    #[test]
    fn test_always_relay() {
        let sender = frame_in(3, 1, "ctxbus-extension://block.htm", "ctxbus-extension://inbox.htm");
        assert!(AlwaysRelay.should_relay(&sender, Some("3:0")));
        assert!(!AlwaysRelay.should_relay(&sender, None));
        assert!(!AlwaysRelay.should_relay(&popup(), Some("3:0")));
    }

    // TEST122: Test the route state machine in order of precedence
    #[test]
    fn test_route_decisions() {
        let policy = AlwaysRelay;
        let sender = frame_in(5, 1, "https://x/", "https://x/");

        assert_eq!(route(Some("5:2"), &sender, &policy, true), Route::Relay(FrameAddress::new(5, 2)));
        assert_eq!(route(Some("broadcast"), &sender, &policy, true), Route::Bounce { major: 5 });
        assert_eq!(route(None, &sender, &policy, true), Route::Local);
        assert_eq!(route(None, &sender, &policy, false), Route::NoSuchHandler);

        // A popup is never relayed, so its directed message falls through
        assert_eq!(route(Some("5:2"), &popup(), &policy, false), Route::Ignore);
        assert_eq!(route(Some("broadcast"), &popup(), &policy, true), Route::Local);
    }

    // TEST123: Test a relayed message with an unparseable destination is unroutable, not dropped
    #[test]
    fn test_route_unroutable() {
        let sender = frame_in(5, 1, "https://x/", "https://x/");
        match route(Some("tab-five"), &sender, &AlwaysRelay, false) {
            Route::Unroutable(reason) => assert!(reason.contains("tab-five")),
            other => panic!("expected Unroutable, got {:?}", other),
        }
    }

    // TEST124: Test policy_for follows the configured relay mode
    #[test]
    fn test_policy_for() {
        let sender = frame_in(3, 1, "ctxbus-extension://b.htm", "ctxbus-extension://p.htm");
        let chromium = policy_for(&BusConfig::default());
        assert!(!chromium.should_relay(&sender, Some("3:0")));
        let always = policy_for(&BusConfig {
            relay_mode: RelayMode::Always,
            ..BusConfig::default()
        });
        assert!(always.should_relay(&sender, Some("3:0")));
    }
}
