//! Listings and money-moving flows around the credit ledger. Every balance
//! mutation happens inside a stored procedure server-side; this module only
//! supplies arguments and consumes structured results.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::client::{Client, Filters};
use crate::{AiopError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub price: f64,
    #[serde(default)]
    pub bonus_credits: i64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipPlan {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plan_type: crate::types::MembershipType,
    pub price_monthly: f64,
    pub price_yearly: f64,
    pub credits_monthly: i64,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Recharge,
    Consume,
    Earn,
    Refund,
    Gift,
    Membership,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub balance_after: i64,
    #[serde(default)]
    pub related_id: Option<String>,
    #[serde(default)]
    pub related_type: Option<String>,
    #[serde(default)]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub creator_earn: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Alipay,
    Wechat,
    Bank,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub user_id: String,
    pub amount: f64,
    pub status: WithdrawalStatus,
    pub payment_method: PaymentMethod,
    pub payment_account: String,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Outcome shape shared by the money-moving stored procedures.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcedureOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub new_balance: Option<i64>,
}

/// A pending top-up order awaiting payment confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct RechargeOrder {
    pub order_id: String,
    pub amount: f64,
}

#[derive(Clone)]
pub struct CreditsClient {
    client: Client,
}

impl CreditsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn packages(&self) -> Result<Vec<CreditPackage>> {
        self.client
            .select("credit_packages")
            .eq("is_active", true)
            .order("sort_order", false)
            .fetch()
            .await
    }

    pub async fn membership_plans(&self) -> Result<Vec<MembershipPlan>> {
        self.client
            .select("membership_plans")
            .eq("is_active", true)
            .order("sort_order", false)
            .fetch()
            .await
    }

    pub async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>> {
        self.client
            .select("credit_transactions")
            .eq("user_id", user_id)
            .order("created_at", true)
            .limit(limit)
            .fetch()
            .await
    }

    pub async fn creator_earnings(
        &self,
        creator_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>> {
        self.client
            .select("credit_transactions")
            .eq("creator_id", creator_id)
            .gt("creator_earn", 0)
            .order("created_at", true)
            .limit(limit)
            .fetch()
            .await
    }

    /// Creates a pending order for a credit package. Payment itself happens
    /// outside this crate; [`confirm_recharge`](Self::confirm_recharge)
    /// finishes the flow once payment succeeded.
    pub async fn create_recharge_order(
        &self,
        user_id: &str,
        package_id: &str,
    ) -> Result<RechargeOrder> {
        let package = self
            .client
            .select("credit_packages")
            .eq("id", package_id)
            .maybe_single::<CreditPackage>()
            .await?
            .ok_or_else(|| {
                AiopError::InvalidResponse(format!("unknown credit package {package_id}"))
            })?;

        #[derive(Deserialize)]
        struct OrderRow {
            id: String,
        }
        let order: OrderRow = self
            .client
            .insert(
                "orders",
                &json!({
                    "user_id": user_id,
                    "plan_name": package.name,
                    "amount": package.price,
                    "credits": package.credits + package.bonus_credits,
                    "payment_status": "pending",
                }),
            )
            .await?;

        Ok(RechargeOrder {
            order_id: order.id,
            amount: package.price,
        })
    }

    /// Marks the order paid and runs the crediting procedure.
    pub async fn confirm_recharge(
        &self,
        user_id: &str,
        order_id: &str,
        package_id: &str,
    ) -> Result<ProcedureOutcome> {
        self.client
            .update(
                "orders",
                &Filters::new().eq("id", order_id),
                &json!({ "payment_status": "paid" }),
            )
            .await?;

        let value = self
            .client
            .rpc(
                "recharge_credits",
                json!({
                    "p_user_id": user_id,
                    "p_package_id": package_id,
                    "p_order_id": order_id,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn request_withdrawal(
        &self,
        user_id: &str,
        amount: f64,
        method: PaymentMethod,
        account: &str,
    ) -> Result<ProcedureOutcome> {
        let value = self
            .client
            .rpc(
                "request_withdrawal",
                json!({
                    "p_user_id": user_id,
                    "p_amount": amount,
                    "p_payment_method": method,
                    "p_payment_account": account,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn withdrawals(&self, user_id: &str) -> Result<Vec<Withdrawal>> {
        self.client
            .select("withdrawals")
            .eq("user_id", user_id)
            .order("created_at", true)
            .fetch()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_method_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(PaymentMethod::Alipay).unwrap(),
            serde_json::json!("alipay")
        );
    }

    #[test]
    fn procedure_outcome_tolerates_sparse_results() {
        let outcome: ProcedureOutcome =
            serde_json::from_value(serde_json::json!({ "success": true })).unwrap();
        assert!(outcome.success);
        assert!(outcome.new_balance.is_none());

        let outcome: ProcedureOutcome = serde_json::from_value(
            serde_json::json!({ "success": false, "error": "pending earnings too low" }),
        )
        .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("pending earnings too low"));
    }

    #[test]
    fn withdrawal_row_parses_backend_timestamps() {
        let withdrawal: Withdrawal = serde_json::from_value(serde_json::json!({
            "id": "w1",
            "user_id": "u1",
            "amount": 25.0,
            "status": "pending",
            "payment_method": "alipay",
            "payment_account": "acct",
            "reject_reason": null,
            "processed_at": null,
            "created_at": "2026-01-05T10:00:00+00:00",
        }))
        .unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Pending);
        assert!(withdrawal.processed_at.is_none());
    }
}
