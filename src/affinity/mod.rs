//! Affinity contract artefacts.
//!
//! The router, not the node, owns stickiness. A node only accepts the token
//! the router hands the client, keeps it on the connection unchanged and
//! echoes it back. [`AffinityCookie`] describes the cookie a router issues,
//! and [`AffinityTable`] is a reference implementation of the routing rules:
//!
//! - a token stays bound to its node while the node keeps sessions
//!   (`healthy`, `starting` or `draining`) and the binding has not expired;
//! - a node seen as `unreachable` loses its bindings and the client is sent
//!   to a freshly selected node, where it handshakes again;
//! - new sessions only go to `healthy` nodes.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tungstenite::http::HeaderMap;
use uuid::Uuid;

use crate::broker::message::NodeId;
use crate::presence::{HealthState, PresenceTracker};

/// Header a router may use instead of the cookie.
pub const AFFINITY_HEADER: &str = "x-affinity-token";

/// Opaque router-issued token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffinityToken(String);

impl AffinityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityCookie {
    pub name: String,
    pub ttl: Duration,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
}

impl AffinityCookie {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            http_only: true,
            secure: true,
            same_site: SameSite::Lax,
        }
    }

    /// `Set-Cookie` value carrying `token`.
    pub fn set_cookie(&self, token: &AffinityToken) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}",
            self.name,
            token,
            self.ttl.as_secs()
        );
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str(&format!("; SameSite={}", self.same_site));
        cookie
    }

    /// Finds this cookie in a `Cookie` header value.
    pub fn parse(&self, header: &str) -> Option<AffinityToken> {
        header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let value = value.trim().trim_matches('"');
            (name.trim() == self.name && !value.is_empty()).then(|| AffinityToken::new(value))
        })
    }
}

/// Token presented at handshake: the affinity header first, then the
/// cookie.
pub fn token_from_request(headers: &HeaderMap, cookie: &AffinityCookie) -> Option<AffinityToken> {
    let from_header = headers
        .get(AFFINITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(AffinityToken::new);
    if from_header.is_some() {
        return from_header;
    }

    headers
        .get_all(tungstenite::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| cookie.parse(value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Route to this node.
    Sticky(NodeId),
    /// No usable binding: pick a node and bind again.
    Reselect,
}

#[derive(Debug, Clone)]
struct Binding {
    node: NodeId,
    expires_at: Instant,
}

/// Router-side token to node bindings.
#[derive(Debug)]
pub struct AffinityTable {
    ttl: Duration,
    bindings: DashMap<AffinityToken, Binding>,
}

impl AffinityTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bindings: DashMap::new(),
        }
    }

    /// Pins `token` to `node` for the table's TTL
    /// Rebinding a token replaces its node and restarts the TTL
    pub fn bind(&self, token: AffinityToken, node: impl Into<NodeId>) {
        self.bind_at(token, node, Instant::now());
    }

    pub fn bind_at(&self, token: AffinityToken, node: impl Into<NodeId>, now: Instant) {
        self.bindings.insert(
            token,
            Binding {
                node: node.into(),
                expires_at: now + self.ttl,
            },
        );
    }

    /// Where a returning client holding `token` should go
    ///
    /// The bound node is kept while it still keeps sessions, `draining`
    /// included. An expired binding is removed. A node seen as
    /// `unreachable` loses every binding at once, so no later lookup can
    /// send a client back to it.
    pub fn resolve(&self, token: &AffinityToken, tracker: &PresenceTracker) -> Resolution {
        self.resolve_at(token, tracker, Instant::now())
    }

    pub fn resolve_at(
        &self,
        token: &AffinityToken,
        tracker: &PresenceTracker,
        now: Instant,
    ) -> Resolution {
        let Some(binding) = self.bindings.get(token).map(|b| b.value().clone()) else {
            return Resolution::Reselect;
        };

        if now >= binding.expires_at {
            self.bindings.remove(token);
            debug!(token = %token, "affinity binding expired");
            return Resolution::Reselect;
        }

        let health = tracker.health_at(&binding.node, now);
        if health.keeps_sessions() {
            Resolution::Sticky(binding.node)
        } else {
            self.invalidate_node(&binding.node);
            Resolution::Reselect
        }
    }

    /// The healthy node with the fewest connections.
    pub fn select_node(&self, tracker: &PresenceTracker) -> Option<NodeId> {
        tracker
            .view()
            .into_values()
            .filter(|view| view.health == HealthState::Healthy)
            .min_by(|a, b| {
                a.connection_count
                    .cmp(&b.connection_count)
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|view| view.node_id)
    }

    /// Resolves `token`, selecting and binding a node when needed. Returns
    /// the token to hand back to the client and the node to route to.
    pub fn route(
        &self,
        token: Option<&AffinityToken>,
        tracker: &PresenceTracker,
    ) -> Option<(AffinityToken, NodeId)> {
        if let Some(token) = token {
            if let Resolution::Sticky(node) = self.resolve(token, tracker) {
                return Some((token.clone(), node));
            }
        }
        let node = self.select_node(tracker)?;
        let token = AffinityToken::generate();
        self.bind(token.clone(), node.clone());
        Some((token, node))
    }

    /// Drops every binding to `node`. Returns how many were dropped.
    pub fn invalidate_node(&self, node: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.node != node);
        let dropped = before.saturating_sub(self.bindings.len());
        if dropped > 0 {
            debug!(node_id = %node, dropped, "affinity bindings invalidated");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests;
