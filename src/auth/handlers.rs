use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    http::{
        header::{InvalidHeaderValue, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        cookie::{clear_session_cookie, session_cookie},
        dto::{AuthResponse, LoginRequest, PublicUser, RegisterRequest},
        error::AuthError,
        jwt::{AuthUser, JwtKeys},
        services,
    },
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/auth/me", get(get_me))
}

fn cookie_headers(
    cookie: Result<HeaderValue, InvalidHeaderValue>,
) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie.map_err(anyhow::Error::from)?);
    Ok(headers)
}

fn session_headers(state: &AppState, token: &str) -> Result<HeaderMap, AuthError> {
    cookie_headers(session_cookie(
        token,
        state.config.token_ttl_secs(),
        state.config.cookie_secure,
    ))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        warn!(error = %rejection, "rejected request body");
        AuthError::Validation(rejection.body_text())
    })
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, HeaderMap, Json<AuthResponse>), AuthError> {
    let req = json_body(payload)?;
    let keys = JwtKeys::from_ref(&state);
    let (user, token) = services::register(state.users.as_ref(), &keys, req).await?;

    let headers = session_headers(&state, &token)?;
    Ok((
        StatusCode::CREATED,
        headers,
        Json(AuthResponse {
            user: PublicUser::from(user),
            token,
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<AuthResponse>), AuthError> {
    let req = json_body(payload)?;
    let keys = JwtKeys::from_ref(&state);
    let (user, token) = services::login(state.users.as_ref(), &keys, req).await?;

    let headers = session_headers(&state, &token)?;
    Ok((
        headers,
        Json(AuthResponse {
            user: PublicUser::from(user),
            token,
        }),
    ))
}

#[instrument(skip(state))]
pub async fn logout(State(state): State<AppState>) -> Result<(StatusCode, HeaderMap), AuthError> {
    let headers = cookie_headers(clear_session_cookie(state.config.cookie_secure))?;
    Ok((StatusCode::NO_CONTENT, headers))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, AuthError> {
    match state.users.find_by_id(user_id).await? {
        Some(user) => Ok(Json(PublicUser::from(user))),
        None => {
            warn!(user_id = %user_id, "token for unknown user");
            Err(AuthError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header::CONTENT_TYPE, Request},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::app::build_app;
    use crate::auth::{
        repo::{StoreError, UserStore},
        repo_types::{NewUser, User},
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Store whose backend is always unreachable.
    struct UnavailableStore;

    #[async_trait]
    impl UserStore for UnavailableStore {
        async fn find_by_email(&self, _email: &str) -> Result<Option<User>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
        async fn find_by_id(&self, _id: uuid::Uuid) -> Result<Option<User>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
        async fn create(&self, _new_user: NewUser) -> Result<User, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    fn unavailable_app() -> Router {
        let config = AppState::fake().config;
        build_app(AppState::from_parts(Arc::new(UnavailableStore), config))
    }

    struct TestResponse {
        status: StatusCode,
        set_cookie: Option<String>,
        body: Value,
    }

    async fn send(app: &Router, req: Request<Body>) -> TestResponse {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let set_cookie = res
            .headers()
            .get(SET_COOKIE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        TestResponse {
            status,
            set_cookie,
            body,
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn alice() -> Value {
        json!({"name": "Alice", "email": "A@Test.com", "password": "secret1"})
    }

    #[tokio::test]
    async fn register_returns_201_with_token_cookie_and_sanitized_user() {
        let app = build_app(AppState::fake());
        let res = send(&app, post_json("/api/auth/register", alice())).await;

        assert_eq!(res.status, StatusCode::CREATED);
        let token = res.body["token"].as_str().unwrap();
        assert!(!token.is_empty());

        let user = res.body["user"].as_object().unwrap();
        assert_eq!(user["name"], "Alice");
        assert_eq!(user["email"], "a@test.com");
        assert_eq!(user["role"], "user");
        for key in ["id", "createdAt", "updatedAt"] {
            assert!(user.contains_key(key), "missing {key}");
        }
        assert!(!user.contains_key("password"));
        assert!(!user.contains_key("password_hash"));

        let cookie = res.set_cookie.unwrap();
        assert!(cookie.starts_with(&format!("token={token};")));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=86400"));
    }

    #[tokio::test]
    async fn register_same_email_twice_returns_422() {
        let app = build_app(AppState::fake());
        let first = send(&app, post_json("/api/auth/register", alice())).await;
        assert_eq!(first.status, StatusCode::CREATED);

        let again = json!({"name": "Alice", "email": "a@test.com", "password": "other"});
        let second = send(&app, post_json("/api/auth/register", again)).await;
        assert_eq!(second.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            second.body,
            json!({"message": "User already exists", "status": "Failed"})
        );
        assert!(second.set_cookie.is_none());
    }

    #[tokio::test]
    async fn concurrent_registration_admits_one() {
        let app = build_app(AppState::fake());
        let (a, b) = tokio::join!(
            send(&app, post_json("/api/auth/register", alice())),
            send(&app, post_json("/api/auth/register", alice())),
        );
        let mut statuses = [a.status, b.status];
        statuses.sort();
        assert_eq!(
            statuses,
            [StatusCode::CREATED, StatusCode::UNPROCESSABLE_ENTITY]
        );
    }

    #[tokio::test]
    async fn register_rejects_invalid_input_with_400() {
        let app = build_app(AppState::fake());

        let short_name = json!({"name": "Al", "email": "a@test.com", "password": "secret1"});
        let res = send(&app, post_json("/api/auth/register", short_name)).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(res.body["status"], "Failed");

        let bad_email = json!({"name": "Alice", "email": "nope", "password": "secret1"});
        let res = send(&app, post_json("/api/auth/register", bad_email)).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);

        let missing = json!({"email": "a@test.com", "password": "secret1"});
        let res = send(&app, post_json("/api/auth/register", missing)).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(res.body["status"], "Failed");
    }

    #[tokio::test]
    async fn login_with_correct_credentials_returns_200() {
        let app = build_app(AppState::fake());
        let registered = send(&app, post_json("/api/auth/register", alice())).await;

        let creds = json!({"email": "a@test.com", "password": "secret1"});
        let res = send(&app, post_json("/api/auth/login", creds)).await;
        assert_eq!(res.status, StatusCode::OK);
        assert!(!res.body["token"].as_str().unwrap().is_empty());
        assert_eq!(res.body["user"]["id"], registered.body["user"]["id"]);
        assert!(res.body["user"].get("password").is_none());
        assert!(res.set_cookie.unwrap().starts_with("token="));
    }

    #[tokio::test]
    async fn login_failures_return_identical_401() {
        let app = build_app(AppState::fake());
        send(&app, post_json("/api/auth/register", alice())).await;

        let unknown = send(
            &app,
            post_json("/api/auth/login", json!({"email": "ghost@test.com", "password": "secret1"})),
        )
        .await;
        let wrong = send(
            &app,
            post_json("/api/auth/login", json!({"email": "a@test.com", "password": "secret2"})),
        )
        .await;

        let expected = json!({"message": "Email or Password is invalid", "status": "Failed"});
        assert_eq!(unknown.status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.body, expected);
        assert_eq!(wrong.body, expected);
        assert!(unknown.set_cookie.is_none());
        assert!(wrong.set_cookie.is_none());
    }

    #[tokio::test]
    async fn me_accepts_cookie_or_bearer_token() {
        let app = build_app(AppState::fake());
        let registered = send(&app, post_json("/api/auth/register", alice())).await;
        let token = registered.body["token"].as_str().unwrap().to_string();

        let by_cookie = Request::builder()
            .uri("/api/auth/me")
            .header("Cookie", format!("token={token}"))
            .body(Body::empty())
            .unwrap();
        let res = send(&app, by_cookie).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["email"], "a@test.com");

        let by_header = Request::builder()
            .uri("/api/auth/me")
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let res = send(&app, by_header).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["id"], registered.body["user"]["id"]);
    }

    #[tokio::test]
    async fn me_rejects_missing_or_bad_token() {
        let app = build_app(AppState::fake());

        let none = Request::builder()
            .uri("/api/auth/me")
            .body(Body::empty())
            .unwrap();
        let res = send(&app, none).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert_eq!(res.body["status"], "Failed");

        let garbage = Request::builder()
            .uri("/api/auth/me")
            .header("Cookie", "token=not.a.jwt")
            .body(Body::empty())
            .unwrap();
        let res = send(&app, garbage).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_rejects_token_for_unknown_user() {
        let state = AppState::fake();
        let token = JwtKeys::from_ref(&state).sign(uuid::Uuid::new_v4()).unwrap();
        let app = build_app(state);

        let req = Request::builder()
            .uri("/api/auth/me")
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn store_fault_returns_generic_500() {
        let app = unavailable_app();
        let expected = json!({"message": "Internal server error", "status": "Failed"});

        let res = send(&app, post_json("/api/auth/register", alice())).await;
        assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body, expected);
        assert!(res.set_cookie.is_none());

        let creds = json!({"email": "a@test.com", "password": "secret1"});
        let res = send(&app, post_json("/api/auth/login", creds)).await;
        assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body, expected);
        assert!(!res.body.to_string().contains("pool timed out"));
    }

    #[tokio::test]
    async fn me_prefers_valid_bearer_over_stale_cookie() {
        let app = build_app(AppState::fake());
        let registered = send(&app, post_json("/api/auth/register", alice())).await;
        let token = registered.body["token"].as_str().unwrap().to_string();

        let req = Request::builder()
            .uri("/api/auth/me")
            .header("Cookie", "token=stale.garbage.value")
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["email"], "a@test.com");
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let app = build_app(AppState::fake());
        let req = Request::builder()
            .method("POST")
            .uri("/api/auth/logout")
            .body(Body::empty())
            .unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status, StatusCode::NO_CONTENT);
        let cookie = res.set_cookie.unwrap();
        assert!(cookie.starts_with("token=;"));
        assert!(cookie.contains("Max-Age=0"));
    }
}
