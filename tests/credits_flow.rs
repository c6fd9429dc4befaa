use aiop::{Client, ClientConfig, CreditsClient, PaymentMethod};
use httpmock::Method::{GET, PATCH, POST};
use httpmock::MockServer;
use serde_json::json;

fn credits(server: &MockServer) -> CreditsClient {
    CreditsClient::new(
        Client::new(ClientConfig::new(server.base_url(), "anon")).with_access_token("user-token"),
    )
}

fn package_row() -> serde_json::Value {
    json!({
        "id": "pkg-1",
        "name": "Starter",
        "credits": 500,
        "price": 9.9,
        "bonus_credits": 50,
        "is_active": true,
        "sort_order": 1,
    })
}

#[tokio::test]
async fn packages_lists_active_entries_in_sort_order() -> aiop::Result<()> {
    let server = MockServer::start();
    let list = server.mock(|when, then| {
        when.method(GET)
            .path("/rest/v1/credit_packages")
            .query_param("is_active", "eq.true")
            .query_param("order", "sort_order.asc");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([package_row()]));
    });

    let packages = credits(&server).packages().await?;
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].credits, 500);
    list.assert();
    Ok(())
}

#[tokio::test]
async fn recharge_order_combines_package_and_bonus_credits() -> aiop::Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET)
            .path("/rest/v1/credit_packages")
            .query_param("id", "eq.pkg-1");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(package_row());
    });
    let insert = server.mock(|when, then| {
        when.method(POST).path("/rest/v1/orders").json_body(json!({
            "user_id": "u1",
            "plan_name": "Starter",
            "amount": 9.9,
            "credits": 550,
            "payment_status": "pending",
        }));
        then.status(201)
            .header("content-type", "application/json")
            .json_body(json!([{ "id": "order-1" }]));
    });

    let order = credits(&server).create_recharge_order("u1", "pkg-1").await?;
    assert_eq!(order.order_id, "order-1");
    assert_eq!(order.amount, 9.9);
    insert.assert();
    Ok(())
}

#[tokio::test]
async fn confirm_recharge_marks_paid_then_credits() -> aiop::Result<()> {
    let server = MockServer::start();
    let paid = server.mock(|when, then| {
        when.method(PATCH)
            .path("/rest/v1/orders")
            .query_param("id", "eq.order-1")
            .json_body(json!({ "payment_status": "paid" }));
        then.status(204);
    });
    let rpc = server.mock(|when, then| {
        when.method(POST)
            .path("/rest/v1/rpc/recharge_credits")
            .json_body(json!({
                "p_user_id": "u1",
                "p_package_id": "pkg-1",
                "p_order_id": "order-1",
            }));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "success": true, "new_balance": 560 }));
    });

    let outcome = credits(&server)
        .confirm_recharge("u1", "order-1", "pkg-1")
        .await?;
    assert!(outcome.success);
    assert_eq!(outcome.new_balance, Some(560));
    paid.assert();
    rpc.assert();
    Ok(())
}

#[tokio::test]
async fn withdrawal_request_surfaces_the_procedure_outcome() -> aiop::Result<()> {
    let server = MockServer::start();
    let rpc = server.mock(|when, then| {
        when.method(POST)
            .path("/rest/v1/rpc/request_withdrawal")
            .json_body(json!({
                "p_user_id": "u1",
                "p_amount": 25.0,
                "p_payment_method": "alipay",
                "p_payment_account": "acct",
            }));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "success": false, "error": "pending earnings too low" }));
    });

    let outcome = credits(&server)
        .request_withdrawal("u1", 25.0, PaymentMethod::Alipay, "acct")
        .await?;
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("pending earnings too low"));
    rpc.assert();
    Ok(())
}

#[tokio::test]
async fn creator_earnings_filters_on_positive_share() -> aiop::Result<()> {
    let server = MockServer::start();
    let list = server.mock(|when, then| {
        when.method(GET)
            .path("/rest/v1/credit_transactions")
            .query_param("creator_id", "eq.u1")
            .query_param("creator_earn", "gt.0");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([{
                "id": "t1",
                "user_id": "u2",
                "type": "consume",
                "amount": -8,
                "balance_after": 2,
                "creator_id": "u1",
                "creator_earn": 5.6,
                "description": "agent call",
                "created_at": "2026-01-05T10:00:00+00:00",
            }]));
    });

    let earnings = credits(&server).creator_earnings("u1", 20).await?;
    assert_eq!(earnings.len(), 1);
    assert_eq!(earnings[0].creator_earn, 5.6);
    list.assert();
    Ok(())
}
