use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::Client;
use crate::session::SessionStore;
use crate::types::ResourceRef;
use crate::{AiopError, Result};

const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Structured result of the charge procedure. The debit arithmetic
/// (balance check, creator share) lives server-side; this is only its
/// reported outcome.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChargeResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub credits_used: Option<i64>,
    #[serde(default)]
    pub new_balance: Option<i64>,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Seam between the gateway and the remote store, so metering logic can be
/// exercised without a network.
#[async_trait]
pub trait ResourceInvoker: Send + Sync {
    /// Issues the single money-moving call for one logical invocation.
    async fn use_resource(
        &self,
        user_id: &str,
        resource: &ResourceRef,
        payload: Option<&Value>,
    ) -> Result<ChargeResult>;

    /// Reads the authoritative balance, used for post-failure reconciliation.
    async fn fetch_balance(&self, user_id: &str) -> Result<i64>;
}

#[async_trait]
impl ResourceInvoker for Client {
    async fn use_resource(
        &self,
        user_id: &str,
        resource: &ResourceRef,
        payload: Option<&Value>,
    ) -> Result<ChargeResult> {
        let mut args = json!({
            "p_user_id": user_id,
            "p_resource_type": resource.resource_type,
            "p_resource_id": resource.resource_id,
        });
        if let Some(payload) = payload {
            args["p_payload"] = payload.clone();
        }
        let value = self.rpc("use_resource_with_credits", args).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch_balance(&self, user_id: &str) -> Result<i64> {
        #[derive(Deserialize)]
        struct Row {
            credits: i64,
        }
        let row: Row = self
            .select("profiles")
            .columns("credits")
            .eq("id", user_id)
            .single()
            .await?;
        Ok(row.credits)
    }
}

/// What the gateway does with the cached balance after a failure whose
/// remote outcome is unknowable from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    /// Refresh the balance from the remote store, so a committed charge
    /// whose response was lost converges on the next read.
    #[default]
    RefreshAfterError,
    /// Leave the cache at its last known value.
    None,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    /// No charge was attempted; route the user to sign-in.
    #[error("not authenticated")]
    NotAuthenticated,
    /// No charge was attempted; route the user to the top-up flow.
    #[error("insufficient credits: balance {balance}, price {price}")]
    InsufficientCredits { balance: i64, price: i64 },
    /// Transient failure, safe to retry; no charge is assumed.
    #[error("remote error: {0}")]
    Remote(#[source] AiopError),
    /// The remote side may or may not have committed; the cached balance is
    /// not speculatively adjusted in either direction.
    #[error("invocation failed: {0}")]
    Unknown(String),
}

impl InvokeError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, InvokeError::Remote(_))
    }
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub credits_charged: i64,
    /// Authoritative post-call balance, adopted verbatim into the session
    /// cache before this outcome is returned.
    pub new_balance: i64,
    pub output: Option<Value>,
}

/// One metered attempt that reached the remote store. Client-visible history
/// only; the authoritative ledger lives server-side.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub resource: ResourceRef,
    pub success: bool,
    pub credits_charged: i64,
    pub duration: Duration,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Turns "use this chargeable resource" into a single metered,
/// at-most-once-charged remote call, regardless of resource type.
pub struct InvocationGateway {
    invoker: Arc<dyn ResourceInvoker>,
    session: Arc<SessionStore>,
    policy: ReconcilePolicy,
    history: Mutex<VecDeque<Invocation>>,
    history_limit: usize,
}

impl InvocationGateway {
    pub fn new(invoker: impl ResourceInvoker + 'static, session: Arc<SessionStore>) -> Self {
        Self {
            invoker: Arc::new(invoker),
            session,
            policy: ReconcilePolicy::default(),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_policy(mut self, policy: ReconcilePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Invokes one chargeable resource. `price` is the listed
    /// `credits_per_call`; the client-side balance check against it is a
    /// soft short-circuit, the server remains authoritative.
    pub async fn invoke(
        &self,
        resource: ResourceRef,
        price: i64,
        payload: Option<Value>,
    ) -> std::result::Result<InvokeOutcome, InvokeError> {
        let Some(identity) = self.session.identity() else {
            return Err(InvokeError::NotAuthenticated);
        };
        if identity.credits < price {
            return Err(InvokeError::InsufficientCredits {
                balance: identity.credits,
                price,
            });
        }

        debug!(resource = %resource, price, "invoking resource");
        let started = Instant::now();
        let result = self
            .invoker
            .use_resource(&identity.user_id, &resource, payload.as_ref())
            .await;
        let duration = started.elapsed();

        match result {
            Ok(charge) if charge.success => {
                let Some(new_balance) = charge.new_balance else {
                    self.record(Invocation {
                        resource,
                        success: false,
                        credits_charged: 0,
                        duration,
                        output: None,
                        error: Some("charge result missing new_balance".to_string()),
                    });
                    // The server says the charge committed, so the cached
                    // balance is stale until refreshed.
                    self.reconcile(&identity.user_id).await;
                    return Err(InvokeError::Unknown(
                        "charge result missing new_balance".to_string(),
                    ));
                };
                if let Err(err) = self.session.adopt_balance(new_balance) {
                    self.record(Invocation {
                        resource,
                        success: false,
                        credits_charged: 0,
                        duration,
                        output: None,
                        error: Some(err.to_string()),
                    });
                    self.reconcile(&identity.user_id).await;
                    return Err(InvokeError::Unknown(err.to_string()));
                }
                let credits_charged = charge.credits_used.unwrap_or(0);
                self.record(Invocation {
                    resource,
                    success: true,
                    credits_charged,
                    duration,
                    output: charge.output.clone(),
                    error: None,
                });
                Ok(InvokeOutcome {
                    credits_charged,
                    new_balance,
                    output: charge.output,
                })
            }
            Ok(charge) => {
                let message = charge
                    .error
                    .unwrap_or_else(|| "resource charge rejected".to_string());
                self.record(Invocation {
                    resource,
                    success: false,
                    credits_charged: 0,
                    duration,
                    output: None,
                    error: Some(message.clone()),
                });
                if message.to_ascii_lowercase().contains("insufficient") {
                    // The server disagreed with the cached balance, so the
                    // cache is provably stale. Report the refreshed balance,
                    // not the one the server just rejected.
                    self.reconcile(&identity.user_id).await;
                    let balance = self
                        .session
                        .identity()
                        .map_or(identity.credits, |refreshed| refreshed.credits);
                    Err(InvokeError::InsufficientCredits { balance, price })
                } else {
                    self.reconcile(&identity.user_id).await;
                    Err(InvokeError::Unknown(message))
                }
            }
            Err(err) => {
                self.record(Invocation {
                    resource,
                    success: false,
                    credits_charged: 0,
                    duration,
                    output: None,
                    error: Some(err.to_string()),
                });
                self.reconcile(&identity.user_id).await;
                Err(InvokeError::Remote(err))
            }
        }
    }

    pub fn history(&self) -> Vec<Invocation> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn reconcile(&self, user_id: &str) {
        if self.policy != ReconcilePolicy::RefreshAfterError {
            return;
        }
        match self.invoker.fetch_balance(user_id).await {
            Ok(balance) => {
                if let Err(err) = self.session.adopt_balance(balance) {
                    warn!(error = %err, "balance reconciliation produced an unusable value");
                }
            }
            Err(err) => warn!(error = %err, "balance reconciliation failed"),
        }
    }

    fn record(&self, invocation: Invocation) {
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        history.push_back(invocation);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthUser, Session};
    use crate::types::{Profile, ResourceType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    struct FakeInvoker {
        charge: std::result::Result<ChargeResult, String>,
        balance: Option<i64>,
        charge_calls: Arc<AtomicUsize>,
        balance_calls: Arc<AtomicUsize>,
    }

    impl FakeInvoker {
        fn charging(charge: ChargeResult) -> Self {
            Self {
                charge: Ok(charge),
                balance: None,
                charge_calls: Arc::new(AtomicUsize::new(0)),
                balance_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(message: &str, balance: Option<i64>) -> Self {
            Self {
                charge: Err(message.to_string()),
                balance,
                charge_calls: Arc::new(AtomicUsize::new(0)),
                balance_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_balance(mut self, balance: i64) -> Self {
            self.balance = Some(balance);
            self
        }
    }

    #[async_trait]
    impl ResourceInvoker for FakeInvoker {
        async fn use_resource(
            &self,
            _user_id: &str,
            _resource: &ResourceRef,
            _payload: Option<&Value>,
        ) -> Result<ChargeResult> {
            self.charge_calls.fetch_add(1, Ordering::SeqCst);
            match &self.charge {
                Ok(charge) => Ok(charge.clone()),
                Err(message) => Err(AiopError::InvalidResponse(message.clone())),
            }
        }

        async fn fetch_balance(&self, _user_id: &str) -> Result<i64> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            self.balance
                .ok_or_else(|| AiopError::InvalidResponse("no balance".to_string()))
        }
    }

    fn signed_in_store(credits: i64) -> Arc<SessionStore> {
        let store = Arc::new(SessionStore::new());
        store
            .set_session(Some(Session {
                access_token: "at".to_string(),
                refresh_token: None,
                expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
                user: AuthUser {
                    id: "u1".to_string(),
                    email: None,
                },
            }))
            .unwrap();
        store
            .set_profile(Profile {
                id: "u1".to_string(),
                email: None,
                nickname: None,
                avatar: None,
                role: Default::default(),
                credits,
                membership_type: Default::default(),
                membership_expiry: None,
                total_earnings: 0.0,
                pending_earnings: 0.0,
                withdrawn_earnings: 0.0,
            })
            .unwrap();
        store
    }

    fn agent(id: &str) -> ResourceRef {
        ResourceRef::new(ResourceType::Agent, id)
    }

    #[tokio::test]
    async fn successful_charge_adopts_the_returned_balance() {
        let store = signed_in_store(10);
        let gateway = InvocationGateway::new(
            FakeInvoker::charging(ChargeResult {
                success: true,
                credits_used: Some(8),
                new_balance: Some(2),
                ..ChargeResult::default()
            }),
            store.clone(),
        );

        let outcome = gateway.invoke(agent("3"), 8, None).await.unwrap();
        assert_eq!(outcome.credits_charged, 8);
        assert_eq!(outcome.new_balance, 2);
        assert_eq!(store.identity().unwrap().credits, 2);

        // Balance is now 2 < price 8: the second attempt never reaches the
        // remote store.
        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(
            err,
            InvokeError::InsufficientCredits {
                balance: 2,
                price: 8
            }
        ));
        assert_eq!(store.identity().unwrap().credits, 2);
        assert_eq!(gateway.history().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_balance_short_circuits_before_any_remote_call() {
        let store = signed_in_store(5);
        let invoker = FakeInvoker::charging(ChargeResult::default());
        let calls = invoker.charge_calls.clone();
        let gateway = InvocationGateway::new(invoker, store);

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(err, InvokeError::InsufficientCredits { balance: 5, price: 8 }));
        // No remote traffic and no history entry for a call never attempted.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(gateway.history().is_empty());
    }

    #[tokio::test]
    async fn signed_out_caller_is_rejected_without_network() {
        let gateway = InvocationGateway::new(
            FakeInvoker::charging(ChargeResult::default()),
            Arc::new(SessionStore::new()),
        );
        let err = gateway.invoke(agent("3"), 1, None).await.unwrap_err();
        assert!(matches!(err, InvokeError::NotAuthenticated));
    }

    #[tokio::test]
    async fn remote_failure_leaves_balance_untouched_without_a_reconcile_source() {
        let store = signed_in_store(10);
        let gateway = InvocationGateway::new(FakeInvoker::failing("boom", None), store.clone());

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(store.identity().unwrap().credits, 10);

        let history = gateway.history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn remote_failure_reconciles_against_the_authoritative_balance() {
        let store = signed_in_store(10);
        let gateway =
            InvocationGateway::new(FakeInvoker::failing("boom", Some(2)), store.clone());

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(err, InvokeError::Remote(_)));
        // The refresh found the charge had committed server-side.
        assert_eq!(store.identity().unwrap().credits, 2);
    }

    #[tokio::test]
    async fn reconcile_policy_none_skips_the_refresh() {
        let store = signed_in_store(10);
        let invoker = FakeInvoker::failing("boom", Some(2));
        let balance_calls = invoker.balance_calls.clone();
        let gateway = InvocationGateway::new(invoker, store.clone())
            .with_policy(ReconcilePolicy::None);

        gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert_eq!(balance_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.identity().unwrap().credits, 10);
    }

    #[tokio::test]
    async fn structured_rejection_maps_insufficient_credits() {
        let store = signed_in_store(10);
        let gateway = InvocationGateway::new(
            FakeInvoker::charging(ChargeResult {
                success: false,
                error: Some("Insufficient credits".to_string()),
                ..ChargeResult::default()
            }),
            store,
        )
        .with_policy(ReconcilePolicy::None);

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(err, InvokeError::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn success_without_new_balance_is_not_adopted() {
        let store = signed_in_store(10);
        let gateway = InvocationGateway::new(
            FakeInvoker::charging(ChargeResult {
                success: true,
                credits_used: Some(8),
                new_balance: None,
                ..ChargeResult::default()
            }),
            store.clone(),
        );

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(err, InvokeError::Unknown(_)));
        assert_eq!(store.identity().unwrap().credits, 10);
    }

    #[tokio::test]
    async fn success_without_new_balance_still_reconciles() {
        let store = signed_in_store(10);
        let invoker = FakeInvoker::charging(ChargeResult {
            success: true,
            credits_used: Some(8),
            new_balance: None,
            ..ChargeResult::default()
        })
        .with_balance(2);
        let balance_calls = invoker.balance_calls.clone();
        let gateway = InvocationGateway::new(invoker, store.clone());

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(err, InvokeError::Unknown(_)));
        // The committed charge shows up through the refresh, not through
        // adoption of a balance the server never sent.
        assert_eq!(balance_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.identity().unwrap().credits, 2);
    }

    #[tokio::test]
    async fn rejected_balance_adoption_still_reconciles() {
        let store = signed_in_store(10);
        let invoker = FakeInvoker::charging(ChargeResult {
            success: true,
            credits_used: Some(8),
            new_balance: Some(-5),
            ..ChargeResult::default()
        })
        .with_balance(2);
        let balance_calls = invoker.balance_calls.clone();
        let gateway = InvocationGateway::new(invoker, store.clone());

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(err, InvokeError::Unknown(_)));
        assert_eq!(balance_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.identity().unwrap().credits, 2);
    }

    #[tokio::test]
    async fn server_rejected_insufficiency_reports_the_refreshed_balance() {
        let store = signed_in_store(10);
        let invoker = FakeInvoker::charging(ChargeResult {
            success: false,
            error: Some("Insufficient credits".to_string()),
            ..ChargeResult::default()
        })
        .with_balance(3);
        let gateway = InvocationGateway::new(invoker, store.clone());

        let err = gateway.invoke(agent("3"), 8, None).await.unwrap_err();
        assert!(matches!(
            err,
            InvokeError::InsufficientCredits {
                balance: 3,
                price: 8
            }
        ));
        assert_eq!(store.identity().unwrap().credits, 3);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let store = signed_in_store(1000);
        let gateway = InvocationGateway::new(
            FakeInvoker::charging(ChargeResult {
                success: true,
                credits_used: Some(1),
                new_balance: Some(999),
                ..ChargeResult::default()
            }),
            store,
        )
        .with_history_limit(3);

        for _ in 0..5 {
            gateway.invoke(agent("3"), 1, None).await.unwrap();
        }
        assert_eq!(gateway.history().len(), 3);
    }
}
