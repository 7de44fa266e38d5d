//! Session identity for the position channel.
//!
//! A random session token lives in an HttpOnly cookie. The sender id other
//! clients see is derived from it with SHA-256, so knowing someone's public
//! id is not enough to publish as them.

use std::time::Duration;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use pulsewire_types::SenderId;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::IdentitySettings;

const TOKEN_LEN: usize = 32;
const SENDER_ID_BYTES: usize = 8;

/// Mints and recognises session cookies.
#[derive(Debug, Clone)]
pub struct Identity {
    cookie_name: String,
    max_age: Duration,
}

/// The session behind one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    minted: bool,
}

impl Identity {
    pub fn new(settings: &IdentitySettings) -> Self {
        Self {
            cookie_name: settings.cookie_name.clone(),
            max_age: Duration::from_secs(settings.max_age_days.saturating_mul(24 * 60 * 60)),
        }
    }

    /// Recall the session from the request cookies, or mint a new one.
    pub fn resolve(&self, headers: &HeaderMap) -> Session {
        match self.token_from(headers) {
            Some(token) => Session {
                token,
                minted: false,
            },
            None => {
                let token = Uuid::new_v4().simple().to_string();
                debug!("minted new session");
                Session {
                    token,
                    minted: true,
                }
            }
        }
    }

    fn token_from(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, value)| *name == self.cookie_name && is_valid_token(value))
            .map(|(_, value)| value.to_string())
    }

    /// `Set-Cookie` value for a freshly minted session; `None` when the
    /// client already had one.
    pub fn set_cookie(&self, session: &Session) -> Option<HeaderValue> {
        if !session.minted {
            return None;
        }
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.cookie_name,
            session.token,
            self.max_age.as_secs()
        );
        HeaderValue::from_str(&cookie).ok()
    }

    /// Attach the session cookie to `response` if it was just minted.
    pub fn attach(&self, session: &Session, response: &mut Response) {
        if let Some(cookie) = self.set_cookie(session) {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
    }
}

impl Session {
    /// Public sender id for this session.
    pub fn sender_id(&self) -> SenderId {
        sender_id_for(&self.token)
    }

    pub fn is_new(&self) -> bool {
        self.minted
    }
}

/// First 16 hex chars of the token's SHA-256.
pub fn sender_id_for(token: &str) -> SenderId {
    let digest = Sha256::digest(token.as_bytes());
    let id: String = digest[..SENDER_ID_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    SenderId::new(id)
}

fn is_valid_token(value: &str) -> bool {
    value.len() == TOKEN_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}
