//! HttpAuthenticator against a mock auth service.

use doc_fanout::auth::{AuthError, Authenticator, HttpAuthenticator, USERNAME_HEADER, USER_ID_HEADER};
use doc_fanout::config::AuthConfig;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn authenticator(server: &MockServer) -> HttpAuthenticator {
    HttpAuthenticator::new(&AuthConfig {
        url: format!("{}/auth/verify", server.uri()),
        timeout: "2s".to_string(),
    })
    .unwrap()
}

#[tokio::test]
async fn accepted_token_yields_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/verify"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(USER_ID_HEADER, "u-42")
                .insert_header(USERNAME_HEADER, "ada"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let identity = authenticator(&server).await.authenticate("tok").await.unwrap();
    assert_eq!(identity.user_id, "u-42");
    assert_eq!(identity.username, "ada");
}

#[tokio::test]
async fn username_is_optional() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).insert_header(USER_ID_HEADER, "u-7"))
        .mount(&server)
        .await;

    let identity = authenticator(&server).await.authenticate("tok").await.unwrap();
    assert_eq!(identity.user_id, "u-7");
    assert_eq!(identity.username, "");
}

#[tokio::test]
async fn ok_without_user_id_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let result = authenticator(&server).await.authenticate("tok").await;
    assert!(matches!(result, Err(AuthError::Unavailable(_))));
}

#[tokio::test]
async fn unauthorized_and_forbidden_are_rejected() {
    for status in [401u16, 403] {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let result = authenticator(&server).await.authenticate("bad").await;
        assert_eq!(result, Err(AuthError::Rejected), "status {}", status);
    }
}

#[tokio::test]
async fn server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = authenticator(&server).await.authenticate("tok").await;
    assert!(matches!(result, Err(AuthError::Unavailable(_))));
}

#[tokio::test]
async fn slow_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(USER_ID_HEADER, "u-1")
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let auth = HttpAuthenticator::new(&AuthConfig {
        url: server.uri(),
        timeout: "200ms".to_string(),
    })
    .unwrap();
    let result = auth.authenticate("tok").await;
    assert!(matches!(result, Err(AuthError::Unavailable(_))));
}
