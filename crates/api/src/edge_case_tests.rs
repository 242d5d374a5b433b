//! Router edge case tests
//!
//! Drive the full router with `oneshot` against an in-memory document store
//! and fake QuickBooks endpoints.

#[cfg(test)]
mod fakes {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::Router;
    use ledgerlink_reconcile::{
        AccountingApi, ApiCallError, EntityKind, MemoryDocumentStore, OAuthProvider,
        QuickBooksConfig, ReconcileConfig, ReconcileResult, ReconcileService, RetryPolicy,
        TokenGrant,
    };
    use serde_json::Value;

    use crate::{auth::MemoryAuthStateStore, config::Config, routes::create_router, AppState};

    pub const VERIFIER: &str = "verifier-token";
    pub const REALM: &str = "realm-1";

    pub struct FakeOAuth;

    #[async_trait]
    impl OAuthProvider for FakeOAuth {
        fn authorization_url(&self, state: &str) -> ReconcileResult<String> {
            Ok(format!("https://appcenter.test/connect/oauth2?state={}", state))
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ApiCallError> {
            if code == "bad-code" {
                return Err(ApiCallError::InvalidGrant("invalid_grant".to_string()));
            }
            Ok(TokenGrant {
                access_token: format!("at-{}", code),
                refresh_token: Some(format!("rt-{}", code)),
                token_type: "bearer".to_string(),
                expires_in: 3600,
                x_refresh_token_expires_in: Some(8_726_400),
            })
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiCallError> {
            Ok(TokenGrant {
                access_token: format!("at-refreshed-{}", refresh_token),
                refresh_token: None,
                token_type: "bearer".to_string(),
                expires_in: 3600,
                x_refresh_token_expires_in: None,
            })
        }
    }

    #[derive(Default)]
    pub struct FakeAccounting {
        entities: Mutex<HashMap<String, Value>>,
    }

    impl FakeAccounting {
        pub fn insert(&self, kind: EntityKind, id: &str, value: Value) {
            self.entities
                .lock()
                .unwrap()
                .insert(format!("{}/{}", kind, id), value);
        }
    }

    #[async_trait]
    impl AccountingApi for FakeAccounting {
        async fn get_entity(
            &self,
            _access_token: &str,
            _tenant_id: &str,
            kind: EntityKind,
            id: &str,
        ) -> Result<Value, ApiCallError> {
            self.entities
                .lock()
                .unwrap()
                .get(&format!("{}/{}", kind, id))
                .cloned()
                .ok_or_else(|| ApiCallError::Status {
                    status: 404,
                    message: "Object Not Found".to_string(),
                })
        }
    }

    pub struct TestApp {
        pub router: Router,
        pub api: Arc<FakeAccounting>,
        pub reconcile: Arc<ReconcileService>,
    }

    pub fn app(verifier: Option<&str>) -> TestApp {
        let mut config = ReconcileConfig::new(QuickBooksConfig::with_base_url(
            "cid",
            "csecret",
            "http://qbo.test",
        ));
        config.webhook_verifier_token = verifier.map(str::to_string);
        config.retry = RetryPolicy::no_retry();

        let api = Arc::new(FakeAccounting::default());
        let reconcile = Arc::new(ReconcileService::with_clients(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(FakeOAuth),
            api.clone(),
        ));
        let state = AppState::new(
            Config::default(),
            reconcile.clone(),
            Arc::new(MemoryAuthStateStore::new()),
        );

        TestApp {
            router: create_router(state),
            api,
            reconcile,
        }
    }
}

#[cfg(test)]
mod webhook_tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use ledgerlink_reconcile::{webhooks::sign_payload, EntityKind};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::fakes::{app, REALM, VERIFIER};

    fn webhook_request(body: &str, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/quickbooks")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("intuit-signature", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // =========================================================================
    // API-W01: Malformed JSON is a client error
    // =========================================================================
    #[tokio::test]
    async fn test_malformed_payload_rejected() {
        let test = app(None);

        let response = test
            .router
            .oneshot(webhook_request("{not json", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], 400);
    }

    // =========================================================================
    // API-W02: Verifier configured - missing and wrong signatures are 401
    // =========================================================================
    #[tokio::test]
    async fn test_signature_required_when_verifier_set() {
        let body = r#"{"eventNotifications":[]}"#;

        let missing = app(Some(VERIFIER))
            .router
            .oneshot(webhook_request(body, None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let forged = sign_payload(body.as_bytes(), "some-other-token").unwrap();
        let wrong = app(Some(VERIFIER))
            .router
            .oneshot(webhook_request(body, Some(&forged)))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    // =========================================================================
    // API-W03: Signed delivery is applied and the report returned
    // =========================================================================
    #[tokio::test]
    async fn test_signed_delivery_applied() {
        let test = app(Some(VERIFIER));
        test.reconcile
            .tokens
            .complete_authorization("code-1", REALM)
            .await
            .unwrap();
        test.api.insert(
            EntityKind::Invoice,
            "A",
            json!({
                "Id": "A",
                "CustomerRef": {"value": "C1"},
                "MetaData": {
                    "CreateTime": "2024-03-01T10:00:00-08:00",
                    "LastUpdatedTime": "2024-03-01T10:00:00-08:00"
                },
                "TotalAmt": 250.0,
                "Balance": 250.0,
                "CustomField": [
                    {"DefinitionId": "1", "Name": "Hours Purchased", "Type": "StringType", "StringValue": "4"}
                ]
            }),
        );

        let body = json!({"eventNotifications": [{"realmId": REALM,
            "dataChangeEvent": {"entities": [
                {"name": "Invoice", "id": "A", "operation": "Create"},
                {"name": "Estimate", "id": "E1", "operation": "Create"}
            ]}}]})
        .to_string();
        let signature = sign_payload(body.as_bytes(), VERIFIER).unwrap();

        let response = test
            .router
            .oneshot(webhook_request(&body, Some(&signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["entities_seen"], 2);
        assert_eq!(report["applied"], 1);
        assert_eq!(report["ignored"], 1);
        assert_eq!(report["customers_recomputed"], json!(["C1"]));

        let aggregate = test.reconcile.records.get_aggregate("C1").await.unwrap().unwrap();
        assert_eq!(aggregate.total_balance_cents, 25000);
        assert_eq!(aggregate.total_hours, 4.0);
    }

    // =========================================================================
    // API-W04: Entity failures are reported, the delivery still gets 200
    // =========================================================================
    #[tokio::test]
    async fn test_entity_failure_still_acknowledged() {
        let test = app(None);
        test.reconcile
            .tokens
            .complete_authorization("code-1", REALM)
            .await
            .unwrap();

        let body = json!({"eventNotifications": [{"realmId": REALM,
            "dataChangeEvent": {"entities": [{"name": "Invoice", "id": "missing", "operation": "Update"}]}}]})
        .to_string();

        let response = test
            .router
            .oneshot(webhook_request(&body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["failed"], 1);
        assert_eq!(report["applied"], 0);
    }
}

#[cfg(test)]
mod connect_tests {
    use std::collections::HashMap;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::fakes::{app, REALM};

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    /// Run `/quickbooks/connect` and return the issued state
    async fn start_connect(router: &Router) -> String {
        let response = router
            .clone()
            .oneshot(get("/quickbooks/connect"))
            .await
            .unwrap();
        assert!(response.status().is_redirection());

        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        let query = location.split_once('?').unwrap().1;
        let params: HashMap<&str, &str> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        params["state"].to_string()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // =========================================================================
    // API-C01: Connect redirects to the consent screen with a fresh state
    // =========================================================================
    #[tokio::test]
    async fn test_connect_redirects_with_state() {
        let test = app(None);

        let first = start_connect(&test.router).await;
        let second = start_connect(&test.router).await;

        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
    }

    // =========================================================================
    // API-C02: Callback completes the connection once, state is single use
    // =========================================================================
    #[tokio::test]
    async fn test_callback_connects_and_state_is_single_use() {
        let test = app(None);
        let state = start_connect(&test.router).await;
        let uri = format!(
            "/quickbooks/callback?code=code-1&realmId={}&state={}",
            REALM, state
        );

        let response = test.router.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["connected"], true);
        assert_eq!(body["realmId"], REALM);

        let credential = test.reconcile.tokens.credential().await.unwrap().unwrap();
        assert_eq!(credential.tenant_id, REALM);
        assert_eq!(credential.access_token, "at-code-1");

        let replay = test.router.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    }

    // =========================================================================
    // API-C03: Unknown or missing state rejected before any exchange
    // =========================================================================
    #[tokio::test]
    async fn test_callback_rejects_unknown_state() {
        let test = app(None);

        let forged = test
            .router
            .clone()
            .oneshot(get("/quickbooks/callback?code=code-1&realmId=realm-1&state=forged"))
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::BAD_REQUEST);

        let missing = test
            .router
            .clone()
            .oneshot(get("/quickbooks/callback?code=code-1&realmId=realm-1"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        assert!(!test.reconcile.tokens.is_connected().await.unwrap());
    }

    // =========================================================================
    // API-C04: User denied consent - provider error surfaces as 400
    // =========================================================================
    #[tokio::test]
    async fn test_callback_provider_error() {
        let test = app(None);
        let state = start_connect(&test.router).await;
        let uri = format!(
            "/quickbooks/callback?error=access_denied&error_description=User%20denied&state={}",
            state
        );

        let response = test.router.clone().oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!test.reconcile.tokens.is_connected().await.unwrap());
    }

    // =========================================================================
    // API-C05: Rejected authorization code maps to 502, nothing stored
    // =========================================================================
    #[tokio::test]
    async fn test_callback_exchange_failure() {
        let test = app(None);
        let state = start_connect(&test.router).await;
        let uri = format!(
            "/quickbooks/callback?code=bad-code&realmId={}&state={}",
            REALM, state
        );

        let response = test.router.clone().oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["code"], 502);
        assert!(!test.reconcile.tokens.is_connected().await.unwrap());
    }

    // =========================================================================
    // API-C06: Missing realmId after a valid state is a client error
    // =========================================================================
    #[tokio::test]
    async fn test_callback_missing_realm() {
        let test = app(None);
        let state = start_connect(&test.router).await;
        let uri = format!("/quickbooks/callback?code=code-1&state={}", state);

        let response = test.router.clone().oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // =========================================================================
    // API-H01: Health reports connection status
    // =========================================================================
    #[tokio::test]
    async fn test_health_reports_connection() {
        let test = app(None);

        let before = json_body(test.router.clone().oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(before["status"], "ok");
        assert_eq!(before["connected"], false);

        test.reconcile
            .tokens
            .complete_authorization("code-1", REALM)
            .await
            .unwrap();

        let after = json_body(test.router.clone().oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(after["connected"], true);
    }
}
