use crate::TestApp;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn health_check() {
    let (_app, client) = TestApp::start_and_connect().await;

    let response = client
        .get_string("/health")
        .await
        .expect("failed to perform health check");

    assert_eq!("UP", response);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
pub async fn unknown_routes_are_json_not_found() {
    let (_app, client) = TestApp::start_and_connect().await;

    let result = client.get::<serde_json::Value>("/api/v1/nothing").await;

    match result {
        Err(crate::TestError::RequestError(e)) => {
            assert_eq!(404, e.status().unwrap().as_u16())
        }
        other => panic!("expected not found, got {:?}", other),
    }
}
