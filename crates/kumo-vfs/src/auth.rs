//! Interactive OAuth session state.
//!
//! A [`Session`] belongs to one transport instance and walks
//! `Unauthenticated → Authenticating → Authenticated`. The authenticating
//! step is a single shared future: every caller that arrives while a flow is
//! in flight awaits that same flow, and all of them see its one outcome.
//!
//! The flow itself runs on a spawned task, so it finishes (or times out)
//! even if every waiter is dropped, and the session can never be left stuck
//! in `Authenticating`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use url::Url;

use crate::vfs::{VfsError, VfsResult};

/// Deadline for the interactive flow when none is configured.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// The party that completes an interactive sign-in.
///
/// Given the provider's authorization URL, it drives whatever user
/// interaction is needed (popup, browser, terminal prompt) and returns the
/// redirect URL the provider sent back.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, auth_url: Url) -> VfsResult<Url>;
}

/// A bearer credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

type AuthFlow = Shared<BoxFuture<'static, VfsResult<Credential>>>;

enum State {
    Unauthenticated,
    Authenticating { epoch: u64, flow: AuthFlow },
    Authenticated(Credential),
}

struct Inner {
    state: Mutex<State>,
    /// Bumped whenever a flow starts or the session is cleared, so a flow
    /// that finishes late cannot overwrite a newer state.
    epoch: AtomicU64,
    attempts: AtomicUsize,
    authorizer: Arc<dyn Authorizer>,
    auth_url: Url,
    timeout: Duration,
}

/// Per-transport session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status())
            .field("auth_url", &self.inner.auth_url.as_str())
            .finish()
    }
}

impl Session {
    pub fn new(authorizer: Arc<dyn Authorizer>, auth_url: Url, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Unauthenticated),
                epoch: AtomicU64::new(0),
                attempts: AtomicUsize::new(0),
                authorizer,
                auth_url,
                timeout,
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match &*self.inner.state.lock() {
            State::Unauthenticated => SessionStatus::Unauthenticated,
            State::Authenticating { .. } => SessionStatus::Authenticating,
            State::Authenticated(_) => SessionStatus::Authenticated,
        }
    }

    /// Number of interactive flows started so far.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Return the cached credential, or run (or join) the interactive flow.
    pub async fn credential(&self) -> VfsResult<Credential> {
        let flow = {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Authenticated(credential) => return Ok(credential.clone()),
                State::Authenticating { flow, .. } => flow.clone(),
                State::Unauthenticated => {
                    let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let flow = Self::start(Arc::clone(&self.inner), epoch);
                    *state = State::Authenticating {
                        epoch,
                        flow: flow.clone(),
                    };
                    flow
                }
            }
        };
        flow.await
    }

    /// Drop `stale` after the provider rejected it as expired. A newer
    /// credential obtained meanwhile is kept.
    pub fn invalidate(&self, stale: &Credential) {
        let mut state = self.inner.state.lock();
        if matches!(&*state, State::Authenticated(current) if current == stale) {
            tracing::info!("credential expired, session reset");
            *state = State::Unauthenticated;
        }
    }

    /// Forget all session state, returning the credential that was cached.
    ///
    /// An in-flight flow keeps running for its current waiters but its
    /// result is discarded.
    pub fn clear(&self) -> Option<Credential> {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *self.inner.state.lock(), State::Unauthenticated);
        match previous {
            State::Authenticated(credential) => Some(credential),
            _ => None,
        }
    }

    fn start(inner: Arc<Inner>, epoch: u64) -> AuthFlow {
        inner.attempts.fetch_add(1, Ordering::SeqCst);
        tracing::info!(url = %inner.auth_url, "starting interactive sign-in");

        let task = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(
                inner.timeout,
                inner.authorizer.authorize(inner.auth_url.clone()),
            )
            .await
            {
                Err(_) => Err(VfsError::AuthTimeout),
                Ok(Err(e)) if e.is_auth() => Err(e),
                Ok(Err(e)) => Err(VfsError::AuthFailed(e.to_string())),
                Ok(Ok(redirect)) => parse_token_redirect(&redirect),
            };

            let mut state = inner.state.lock();
            if inner.epoch.load(Ordering::SeqCst) == epoch {
                *state = match &outcome {
                    Ok(credential) => {
                        tracing::info!("signed in");
                        State::Authenticated(credential.clone())
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sign-in failed");
                        State::Unauthenticated
                    }
                };
            }
            outcome
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(VfsError::AuthFailed(format!("sign-in task failed: {e}"))))
        }
        .boxed()
        .shared()
    }
}

/// Extract the bearer token from an implicit-grant redirect URL.
///
/// Parameters are read from the fragment, then the query. An `error`
/// parameter or a missing token is a denial.
pub fn parse_token_redirect(redirect: &Url) -> VfsResult<Credential> {
    let params: Vec<(String, String)> = redirect
        .fragment()
        .map(|f| {
            url::form_urlencoded::parse(f.as_bytes())
                .into_owned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter()
        .chain(redirect.query_pairs().into_owned())
        .collect();

    let get = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    if let Some(error) = get("error") {
        let detail = get("error_description").unwrap_or(error);
        return Err(VfsError::AuthFailed(detail.to_string()));
    }

    match get("access_token") {
        Some(token) if !token.is_empty() => Ok(Credential::new(token)),
        _ => Err(VfsError::AuthFailed("redirect carried no access token".into())),
    }
}
