use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::watch;
use tracing::warn;

use crate::auth::{AuthClient, Session, SignUpOutcome};
use crate::client::Client;
use crate::state_file::StateFile;
use crate::types::{Profile, Role, now_rfc3339};
use crate::{AiopError, Result};

/// Credits granted when the backing store has no profile row yet for a
/// freshly confirmed user.
const STARTING_CREDITS: i64 = 100;

/// What views get to observe about the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub role: Role,
    pub credits: i64,
}

#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    profile: Option<Profile>,
}

/// Owner of the only shared mutable client-side state: the current session
/// and the cached identity/balance. The balance is written exclusively by
/// invocation results and explicit profile refreshes; everything else reads.
pub struct SessionStore {
    state: Mutex<SessionState>,
    tx: watch::Sender<Option<SessionSnapshot>>,
    cache: Option<StateFile<Option<Session>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            state: Mutex::new(SessionState::default()),
            tx,
            cache: None,
        }
    }

    /// Persists the session token to `path` so a restart can
    /// [`restore`](Self::restore) it.
    pub fn with_cache(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new();
        store.cache = Some(StateFile::new(path));
        store
    }

    /// Loads a previously cached session. Returns whether a live (unexpired)
    /// session was restored; the profile still needs a refresh afterwards.
    pub fn restore(&self) -> Result<bool> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        match cache.load()? {
            Some(session) if !session.is_expired() => {
                self.with_state(|state| state.session = Some(session))?;
                self.notify();
                Ok(true)
            }
            Some(_) => {
                cache.clear()?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn load_cached(&self) -> Result<Option<Session>> {
        match &self.cache {
            Some(cache) => cache.load(),
            None => Ok(None),
        }
    }

    pub fn set_session(&self, session: Option<Session>) -> Result<()> {
        if let Some(cache) = &self.cache {
            match &session {
                Some(session) => cache.save(&Some(session.clone()))?,
                None => cache.clear()?,
            }
        }
        self.with_state(|state| {
            let same_user = match (&state.session, &session) {
                (Some(old), Some(new)) => old.user.id == new.user.id,
                _ => false,
            };
            if !same_user {
                state.profile = None;
            }
            state.session = session;
        })?;
        self.notify();
        Ok(())
    }

    pub fn set_profile(&self, profile: Profile) -> Result<()> {
        if profile.credits < 0 {
            return Err(AiopError::InvalidResponse(format!(
                "profile {} carries a negative balance ({})",
                profile.id, profile.credits
            )));
        }
        self.with_state(|state| state.profile = Some(profile))?;
        self.notify();
        Ok(())
    }

    /// Adopts an authoritative post-call balance verbatim, discarding any
    /// optimistic local estimate.
    pub fn adopt_balance(&self, new_balance: i64) -> Result<()> {
        if new_balance < 0 {
            return Err(AiopError::InvalidResponse(format!(
                "authoritative balance is negative ({new_balance})"
            )));
        }
        self.with_state(|state| {
            if let Some(profile) = state.profile.as_mut() {
                profile.credits = new_balance;
            }
        })?;
        self.notify();
        Ok(())
    }

    pub fn identity(&self) -> Option<SessionSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.session.as_ref().map(|s| s.user.id.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.session.as_ref().map(|s| s.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.session.as_ref().and_then(|s| s.refresh_token.clone())
    }

    pub fn profile(&self) -> Option<Profile> {
        let state = self.state.lock().ok()?;
        state.profile.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.session.as_ref().is_some_and(|s| !s.is_expired())
    }

    pub fn is_admin(&self) -> bool {
        self.profile().is_some_and(|p| p.role.is_admin())
    }

    /// Observes sign-in, sign-out and balance changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionSnapshot>> {
        self.tx.subscribe()
    }

    fn with_state(&self, apply: impl FnOnce(&mut SessionState)) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AiopError::InvalidResponse("session state lock is poisoned".to_string()))?;
        apply(&mut state);
        Ok(())
    }

    fn notify(&self) {
        let snapshot = {
            let Ok(state) = self.state.lock() else {
                return;
            };
            match (&state.session, &state.profile) {
                (Some(session), Some(profile)) => Some(SessionSnapshot {
                    user_id: session.user.id.clone(),
                    role: profile.role,
                    credits: profile.credits,
                }),
                _ => None,
            }
        };
        self.tx.send_replace(snapshot);
    }
}

/// Wires the identity provider, the row store and the session store into the
/// sign-in / sign-out / refresh flows a UI needs.
pub struct Account {
    auth: AuthClient,
    client: Client,
    store: Arc<SessionStore>,
}

impl Account {
    pub fn new(auth: AuthClient, client: Client, store: Arc<SessionStore>) -> Self {
        Self {
            auth,
            client,
            store,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome> {
        let outcome = self.auth.sign_up(email, password).await?;
        if let Some(session) = &outcome.session {
            self.store.set_session(Some(session.clone()))?;
            self.refresh_profile().await?;
        }
        Ok(outcome)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Profile> {
        let session = self.auth.sign_in(email, password).await?;
        self.store.set_session(Some(session))?;
        self.refresh_profile().await
    }

    /// Brings a cached session back after a restart. A live session is
    /// adopted as-is; an expired one holding a refresh token is exchanged
    /// for a fresh grant; anything else is discarded.
    pub async fn restore(&self) -> Result<bool> {
        let Some(cached) = self.store.load_cached()? else {
            return Ok(false);
        };
        if !cached.is_expired() {
            self.store.set_session(Some(cached))?;
            self.refresh_profile().await?;
            return Ok(true);
        }
        let Some(refresh_token) = cached.refresh_token else {
            self.store.set_session(None)?;
            return Ok(false);
        };
        match self.auth.refresh(&refresh_token).await {
            Ok(session) => {
                self.store.set_session(Some(session))?;
                self.refresh_profile().await?;
                Ok(true)
            }
            Err(err) => {
                warn!(error = %err, "session refresh failed, staying signed out");
                self.store.set_session(None)?;
                Ok(false)
            }
        }
    }

    /// Remote logout failures are logged and swallowed; the local session is
    /// cleared either way.
    pub async fn sign_out(&self) -> Result<()> {
        if let Some(token) = self.store.access_token() {
            if let Err(err) = self.auth.sign_out(&token).await {
                warn!(error = %err, "remote sign-out failed, clearing local session anyway");
            }
        }
        self.store.set_session(None)
    }

    /// Re-reads the profile row and replaces the cached copy. A missing row
    /// is bootstrapped with defaults, which happens on first sign-in.
    pub async fn refresh_profile(&self) -> Result<Profile> {
        let Some(user_id) = self.store.user_id() else {
            return Err(AiopError::NotAuthenticated);
        };
        let client = self.authed_client();

        let existing = client
            .select("profiles")
            .eq("id", &user_id)
            .maybe_single::<Profile>()
            .await?;

        let profile = match existing {
            Some(profile) => profile,
            None => {
                let now = now_rfc3339();
                client
                    .insert::<Profile>(
                        "profiles",
                        &json!({
                            "id": user_id,
                            "role": "user",
                            "credits": STARTING_CREDITS,
                            "created_at": now,
                            "updated_at": now,
                        }),
                    )
                    .await?
            }
        };

        self.store.set_profile(profile.clone())?;
        Ok(profile)
    }

    /// A row-store client carrying the current session token, or the anon
    /// key when signed out.
    pub fn authed_client(&self) -> Client {
        match self.store.access_token() {
            Some(token) => self.client.clone().with_access_token(token),
            None => self.client.clone(),
        }
    }
}
