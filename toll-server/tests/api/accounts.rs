use serde_json::{json, Value};
use toll_server::api::v1::accounts::Account;
use toll_server::shortid::ShortId;
use toll_server::store::NewAccount;
use toll_core::Source;
use uuid::Uuid;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::{TestApp, TestClient, TestError};

const NY_ENDPOINT: &str = "/api/fetch-single-account";
const NJ_ENDPOINT: &str = "/api/fetch-nj-violation";

fn ny_account(email: Option<&str>) -> NewAccount {
    NewAccount {
        source: Source::Ny,
        account_number: Some("acc100".to_string()),
        plate_number: Some("plt1".to_string()),
        email: email.map(str::to_string),
        ..NewAccount::default()
    }
}

fn nj_account(email: Option<&str>) -> NewAccount {
    NewAccount {
        source: Source::Nj,
        violation_number: Some("V200".to_string()),
        plate_number: Some("NJPLT".to_string()),
        email: email.map(str::to_string),
        ..NewAccount::default()
    }
}

async fn create(client: &TestClient, account: NewAccount) -> Account {
    client
        .post("/api/v1/accounts", account)
        .await
        .expect("failed to create account")
}

fn status_of(result: Result<Value, TestError>) -> u16 {
    match result {
        Err(TestError::RequestError(e)) => e.status().unwrap().as_u16(),
        other => panic!("expected HTTP error, got {:?}", other),
    }
}

async fn mount_ny(app: &TestApp, response: Value) {
    Mock::given(method("POST"))
        .and(path(NY_ENDPOINT))
        .and(body_json(json!({
            "account_number": "ACC100",
            "plate_number": "PLT1",
            "source": "NY"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .expect(1)
        .mount(&app.lookup_server)
        .await;
}

async fn mount_nj(app: &TestApp, response: Value) {
    Mock::given(method("POST"))
        .and(path(NJ_ENDPOINT))
        .and(body_json(json!({
            "violation_number": "V200",
            "plate_number": "NJPLT"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .expect(1)
        .mount(&app.lookup_server)
        .await;
}

async fn mount_email(app: &TestApp, subject: &str, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/email"))
        .and(body_partial_json(json!({
            "To": "driver@example.com",
            "Subject": subject
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ErrorCode": 0,
            "Message": "OK",
            "MessageID": "b7bc2f4a-e38e-4336-af7d-e6c392c2f817"
        })))
        .expect(expected)
        .mount(&app.postmark_server)
        .await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn created_accounts_are_normalized_and_listed() {
    let (_app, client) = TestApp::start_and_connect().await;

    let account = create(&client, ny_account(Some("Driver@Example.com"))).await;

    assert_eq!(Some("ACC100"), account.account_number.as_deref());
    assert_eq!(Some("PLT1"), account.plate_number.as_deref());
    assert_eq!(Some("driver@example.com"), account.email.as_deref());
    assert!(account.sources.contains(&Source::Ny));

    let accounts: Vec<Account> = client.get("/api/v1/accounts").await.unwrap();
    assert_eq!(1, accounts.len());
    assert_eq!(account.id, accounts[0].id);

    let fetched: Account = client
        .get(&format!("/api/v1/accounts/{}", account.id))
        .await
        .unwrap();
    assert_eq!(account.id, fetched.id);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn same_email_merges_into_one_account() {
    let (app, client) = TestApp::start_and_connect().await;

    let first = create(&client, ny_account(Some("driver@example.com"))).await;
    let merged = create(&client, nj_account(Some("driver@example.com"))).await;

    assert_eq!(first.id, merged.id);
    assert_eq!(2, merged.sources.len());
    assert_eq!(1, app.store().await.list().await.len());
    assert_eq!(1, app.store().await.archived().await.len());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn invalid_and_duplicate_accounts_are_rejected() {
    let (_app, client) = TestApp::start_and_connect().await;

    let missing_violation = NewAccount {
        source: Source::Nj,
        plate_number: Some("NJPLT".to_string()),
        ..NewAccount::default()
    };
    assert_eq!(
        422,
        status_of(client.post("/api/v1/accounts", missing_violation).await)
    );

    create(&client, ny_account(None)).await;
    assert_eq!(
        409,
        status_of(client.post("/api/v1/accounts", ny_account(None)).await)
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn malformed_json_is_unprocessable() {
    let (_app, client) = TestApp::start_and_connect().await;

    let (status, body) = client
        .post_raw("/api/v1/accounts", r#"{"source": "NY", "accountNumber": }"#)
        .await
        .unwrap();

    assert_eq!(422, status.as_u16());
    assert_eq!("toll::error::bad_request", body["code"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn update_and_delete() {
    let (_app, client) = TestApp::start_and_connect().await;
    let account = create(&client, ny_account(None)).await;
    let uri = format!("/api/v1/accounts/{}", account.id);

    let updated: Account = client
        .patch(&uri, json!({ "violationNumber": "v200" }))
        .await
        .unwrap();
    assert_eq!(Some("V200"), updated.violation_number.as_deref());
    assert_eq!(2, updated.sources.len());

    let cleared = client
        .patch::<_, Value>(&uri, json!({ "accountNumber": "", "violationNumber": "" }))
        .await;
    assert_eq!(422, status_of(cleared));

    client.delete(&uri).await.unwrap();
    assert_eq!(404, status_of(client.get(&uri).await));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn refresh_merges_both_sources_and_notifies() {
    let (app, client) = TestApp::start_and_connect().await;
    create(&client, ny_account(Some("driver@example.com"))).await;
    let account = create(&client, nj_account(Some("driver@example.com"))).await;

    mount_ny(
        &app,
        json!({
            "success": true,
            "balance_amount": 12.5,
            "toll_bill_numbers": ["T1", "T2"],
            "violation_count": 0
        }),
    )
    .await;
    mount_nj(
        &app,
        json!({
            "success": true,
            "balance_amount": 5.0,
            "toll_bill_numbers": ["T2", "N1"],
            "violation_count": 1
        }),
    )
    .await;
    mount_email(
        &app,
        "E-ZPass Toll Information - NY: $12.50 | NJ: $5.00 | Total: $17.50",
        1,
    )
    .await;

    let result: Value = client
        .post(&format!("/api/v1/accounts/{}/refresh", account.id), ())
        .await
        .unwrap();

    assert_eq!("FullSuccess", result["outcome"]);
    assert_eq!(json!({}), result["errors"]);
    assert_eq!(json!({ "status": "sent" }), result["notification"]);
    assert_eq!(
        "Balance updated: $17.50 (NY: $12.50 + NJ: $5.00) - Email sent to driver@example.com",
        result["summary"]
    );

    let refreshed: Account = serde_json::from_value(result["account"].clone()).unwrap();
    assert_eq!("17.5", refreshed.total_balance.normalize().to_string());
    assert_eq!(vec!["N1", "T1", "T2"], refreshed.bill_numbers);
    assert_eq!(1, refreshed.violation_count);
    assert!(refreshed.last_updated.is_some());

    let stored = app.store().await.get(account.id.as_uuid()).await.unwrap();
    assert_eq!(refreshed.total_balance, stored.total_balance);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn refresh_reports_failed_source() {
    let (app, client) = TestApp::start_and_connect().await;
    create(&client, ny_account(Some("driver@example.com"))).await;
    let account = create(&client, nj_account(Some("driver@example.com"))).await;

    mount_ny(&app, json!({ "success": false, "error": "timeout" })).await;
    mount_nj(
        &app,
        json!({
            "success": true,
            "balance_amount": 5.0,
            "toll_bill_numbers": ["N1"],
            "violation_count": 1
        }),
    )
    .await;
    mount_email(
        &app,
        "E-ZPass Toll Information - NY: $0.00 | NJ: $5.00 | Total: $5.00",
        1,
    )
    .await;

    let result: Value = client
        .post(&format!("/api/v1/accounts/{}/refresh", account.id), ())
        .await
        .unwrap();

    assert_eq!("PartialSuccess", result["outcome"]);
    assert_eq!(json!({ "NY": "timeout" }), result["errors"]);
    assert_eq!(
        "Some errors occurred: NY: timeout. Total Balance: $5.00 (NJ: $5.00)",
        result["summary"]
    );
    assert_eq!(json!(["N1"]), result["account"]["billNumbers"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn refresh_with_every_source_failing_stores_zero_without_email() {
    let (app, client) = TestApp::start_and_connect().await;
    create(&client, ny_account(Some("driver@example.com"))).await;
    let account = create(&client, nj_account(Some("driver@example.com"))).await;

    mount_ny(&app, json!({ "success": false, "error": "site down" })).await;
    mount_nj(&app, json!({ "success": false, "error": "captcha" })).await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&app.postmark_server)
        .await;

    let result: Value = client
        .post(&format!("/api/v1/accounts/{}/refresh", account.id), ())
        .await
        .unwrap();

    assert_eq!("TotalFailure", result["outcome"]);
    assert_eq!(
        json!({ "NY": "site down", "NJ": "captcha" }),
        result["errors"]
    );
    assert_eq!(json!({ "status": "noData" }), result["notification"]);
    assert_eq!(
        "Some errors occurred: NY: site down; NJ: captcha. Total Balance: $0.00",
        result["summary"]
    );

    let stored = app.store().await.get(account.id.as_uuid()).await.unwrap();
    assert!(stored.total_balance.is_zero());
    assert!(stored.ny_balance.is_zero());
    assert!(stored.nj_balance.is_zero());
    assert!(stored.bill_numbers.is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn refresh_without_email_does_not_notify() {
    let (app, client) = TestApp::start_and_connect().await;
    let account = create(&client, ny_account(None)).await;

    mount_ny(
        &app,
        json!({ "success": true, "balance_amount": 3.25, "toll_bill_numbers": [] }),
    )
    .await;
    mount_email(&app, "unused", 0).await;

    let result: Value = client
        .post(&format!("/api/v1/accounts/{}/refresh", account.id), ())
        .await
        .unwrap();

    assert_eq!("FullSuccess", result["outcome"]);
    assert_eq!(json!({ "status": "noRecipient" }), result["notification"]);
    assert_eq!("Balance updated: $3.25 (NY: $3.25)", result["summary"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn refresh_of_unknown_account_is_not_found() {
    let (_app, client) = TestApp::start_and_connect().await;
    let id = ShortId::from(Uuid::new_v4());

    let result = client
        .post::<_, Value>(&format!("/api/v1/accounts/{}/refresh", id), ())
        .await;

    assert_eq!(404, status_of(result));
}
