use backloggr_core::{ApiError, AuthClient};
use std::time::Duration;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn login_posts_credentials_and_returns_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({
            "email": "ada@example.com",
            "password": "hunter2"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "token": "jwt-token",
                "user": { "id": 3, "username": "ada", "email": "ada@example.com" }
            }
        })))
        .mount(&server)
        .await;

    let client = AuthClient::with_base_url(&server.uri()).unwrap();
    let session = client.login("ada@example.com", "hunter2").await.unwrap();

    assert_eq!(session.token, "jwt-token");
    assert_eq!(session.user.unwrap().username.as_deref(), Some("ada"));
}

#[tokio::test]
async fn register_returns_api_error_on_conflict() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/register"))
        .respond_with(ResponseTemplate::new(422).set_body_string("email taken"))
        .mount(&server)
        .await;

    let client = AuthClient::with_base_url(&server.uri()).unwrap();
    let err = client
        .register("ada", "ada@example.com", "hunter2")
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(422));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn client_for_session_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/auth/profile"))
        .and(header("authorization", "Bearer jwt-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "user": { "id": 3, "dark_mode": 0, "notifications_enabled": 1 } }
        })))
        .mount(&server)
        .await;

    let auth = AuthClient::with_base_url(&server.uri()).unwrap();
    let client = auth
        .client_for(&backloggr_core::AuthSession {
            token: "jwt-token".into(),
            user: None,
        })
        .unwrap();
    let profile = client.get_profile().await.unwrap();

    assert_eq!(profile.id, 3);
    assert_eq!(profile.dark_mode, Some(false));
    assert_eq!(profile.notifications_enabled, Some(true));
    assert_eq!(profile.analytics_enabled, None);
}

#[tokio::test]
async fn login_gives_up_after_the_configured_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"token": "late"}}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = AuthClient::with_base_url(&server.uri())
        .unwrap()
        .with_timeout(Duration::from_millis(200))
        .unwrap();
    let err = client.login("ada@example.com", "hunter2").await.unwrap_err();

    assert!(matches!(&err, ApiError::Request(inner) if inner.is_timeout()));
    assert!(err.is_retryable());
}
