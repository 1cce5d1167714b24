//! Client sessions, CSRF tokens and client identity.
//!
//! A session is identified by an HttpOnly cookie and carries one CSRF token
//! for its whole lifetime. Mutating actions must echo that token back.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tracing::{debug, warn};

use crate::error::StoreError;

pub const SESSION_COOKIE: &str = "screenreel_session";

/// Upper bound on live sessions; the least recently seen one is evicted.
pub const MAX_SESSIONS: usize = 10_000;

/// Minimum time between full sweeps of expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct ClientSession {
    csrf_token: String,
    last_seen: Instant,
}

/// The session a request belongs to after [`SecurityGate::session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub id: String,
    pub csrf_token: String,
    /// The cookie has to be (re)sent to the client.
    pub is_new: bool,
}

impl SessionGrant {
    /// `Set-Cookie` value binding the client to this session.
    pub fn cookie(&self) -> String {
        format!("{SESSION_COOKIE}={}; HttpOnly; SameSite=Strict; Path=/", self.id)
    }
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, ClientSession>,
    last_sweep: Option<Instant>,
}

impl Sessions {
    fn sweep(&mut self, now: Instant, ttl: Duration) {
        self.by_id
            .retain(|_, s| now.saturating_duration_since(s.last_seen) < ttl);
        self.last_sweep = Some(now);
    }
}

pub struct SecurityGate {
    sessions: Mutex<Sessions>,
    ttl: Duration,
    max_sessions: usize,
}

impl SecurityGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            ttl,
            max_sessions: MAX_SESSIONS,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    /// Look up the session named by the cookie, or open a fresh one.
    pub fn session(&self, cookie_id: Option<&str>) -> SessionGrant {
        self.session_at(cookie_id, Instant::now())
    }

    /// [`session`](Self::session) against an explicit clock.
    pub fn session_at(&self, cookie_id: Option<&str>, now: Instant) -> SessionGrant {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let ttl = self.ttl;
        let due = sessions
            .last_sweep
            .map_or(true, |last| now.saturating_duration_since(last) >= SWEEP_INTERVAL);
        if due {
            sessions.sweep(now, ttl);
        }

        if let Some(id) = cookie_id {
            match sessions.by_id.get_mut(id) {
                Some(session) if now.saturating_duration_since(session.last_seen) < ttl => {
                    session.last_seen = now;
                    return SessionGrant {
                        id: id.to_string(),
                        csrf_token: session.csrf_token.clone(),
                        is_new: false,
                    };
                }
                Some(_) => {
                    sessions.by_id.remove(id);
                }
                None => {}
            }
            debug!("Unknown or expired session cookie, issuing a new session");
        }

        if sessions.by_id.len() >= self.max_sessions {
            sessions.sweep(now, ttl);
        }
        if sessions.by_id.len() >= self.max_sessions {
            let oldest = sessions
                .by_id
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                warn!("Session limit {} reached, evicting the least recent", self.max_sessions);
                sessions.by_id.remove(&oldest);
            }
        }

        // Client-chosen ids are never adopted.
        let id = random_token();
        let csrf_token = random_token();
        sessions.by_id.insert(
            id.clone(),
            ClientSession {
                csrf_token: csrf_token.clone(),
                last_seen: now,
            },
        );
        SessionGrant {
            id,
            csrf_token,
            is_new: true,
        }
    }

    /// Check a presented CSRF token against the session's.
    pub fn verify(
        &self,
        session: &SessionGrant,
        presented: Option<&str>,
    ) -> Result<(), StoreError> {
        match presented {
            Some(token) if constant_time_eq(token.as_bytes(), session.csrf_token.as_bytes()) => {
                Ok(())
            }
            Some(_) => {
                warn!("CSRF token mismatch");
                Err(StoreError::InvalidToken)
            }
            None => {
                warn!("CSRF token missing");
                Err(StoreError::InvalidToken)
            }
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_id
            .len()
    }
}

/// 32 random bytes, hex encoded.
fn random_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Session id carried by the request's cookies, if any.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Who the rate limiter counts a request against: the peer IP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_token_is_stable_for_session() {
        let gate = SecurityGate::new(Duration::from_secs(60));
        let first = gate.session(None);
        assert!(first.is_new);
        assert_eq!(first.csrf_token.len(), 64);

        let again = gate.session(Some(&first.id));
        assert!(!again.is_new);
        assert_eq!(again.csrf_token, first.csrf_token);
    }

    #[test]
    fn test_unknown_cookie_gets_fresh_session() {
        let gate = SecurityGate::new(Duration::from_secs(60));
        let grant = gate.session(Some("attacker-chosen"));
        assert!(grant.is_new);
        assert_ne!(grant.id, "attacker-chosen");
    }

    #[test]
    fn test_idle_sessions_expire() {
        let gate = SecurityGate::new(Duration::from_secs(60));
        let t0 = Instant::now();
        let grant = gate.session_at(None, t0);

        let kept = gate.session_at(Some(&grant.id), t0 + Duration::from_secs(59));
        assert!(!kept.is_new);

        let expired = gate.session_at(Some(&grant.id), t0 + Duration::from_secs(59 + 60));
        assert!(expired.is_new);
        assert_ne!(expired.csrf_token, grant.csrf_token);
        assert_eq!(gate.active_sessions(), 1);
    }

    #[test]
    fn test_session_count_is_bounded() {
        let gate = SecurityGate::new(Duration::from_secs(600)).with_max_sessions(2);
        let t0 = Instant::now();
        let first = gate.session_at(None, t0);
        let second = gate.session_at(None, t0 + Duration::from_secs(1));
        let third = gate.session_at(None, t0 + Duration::from_secs(2));
        assert!(third.is_new);
        assert_eq!(gate.active_sessions(), 2);

        // The least recently seen session made room.
        assert!(!gate.session_at(Some(&second.id), t0 + Duration::from_secs(3)).is_new);
        assert!(gate.session_at(Some(&first.id), t0 + Duration::from_secs(4)).is_new);
        assert_eq!(gate.active_sessions(), 2);
    }

    #[test]
    fn test_expired_sessions_are_dropped_before_live_ones() {
        let gate = SecurityGate::new(Duration::from_secs(60)).with_max_sessions(2);
        let t0 = Instant::now();
        gate.session_at(None, t0);
        let live = gate.session_at(None, t0 + Duration::from_secs(30));
        gate.session_at(None, t0 + Duration::from_secs(70));
        assert_eq!(gate.active_sessions(), 2);
        assert!(!gate.session_at(Some(&live.id), t0 + Duration::from_secs(71)).is_new);
    }

    #[test]
    fn test_expired_cookie_is_replaced_between_sweeps() {
        let gate = SecurityGate::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let grant = gate.session_at(None, t0);
        // Past the TTL but before the next full sweep.
        let again = gate.session_at(Some(&grant.id), t0 + Duration::from_secs(20));
        assert!(again.is_new);
        assert_eq!(gate.active_sessions(), 1);
    }

    #[test]
    fn test_verify() {
        let gate = SecurityGate::new(Duration::from_secs(60));
        let grant = gate.session(None);
        assert!(gate.verify(&grant, Some(&grant.csrf_token)).is_ok());
        assert!(matches!(
            gate.verify(&grant, Some("deadbeef")),
            Err(StoreError::InvalidToken)
        ));
        assert!(matches!(gate.verify(&grant, None), Err(StoreError::InvalidToken)));

        let mut forged = grant.csrf_token.clone();
        forged.replace_range(0..1, if forged.starts_with('0') { "1" } else { "0" });
        assert!(gate.verify(&grant, Some(&forged)).is_err());
    }

    #[test]
    fn test_session_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; screenreel_session=abc123; other=1"),
        );
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc123"));
        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn test_cookie_attributes() {
        let gate = SecurityGate::new(Duration::from_secs(60));
        let cookie = gate.session(None).cookie();
        assert!(cookie.starts_with("screenreel_session="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
    }
}
