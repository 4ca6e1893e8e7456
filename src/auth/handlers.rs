use axum::{
    extract::{
        rejection::{FormRejection, JsonRejection},
        State,
    },
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::post,
    Form, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::{
        dto::{LoginForm, MessageResponse, RegisterRequest},
        rate_limit::limit_login_attempts,
        services,
        session::{Session, SESSION_COOKIE},
    },
    error::AppError,
    state::AppState,
};

pub const LOGIN_SUCCESS_URL: &str = "/dashboard";
pub const LOGIN_FAILURE_URL: &str = "/login?error=true";
pub const LOGOUT_SUCCESS_URL: &str = "/login?logout=true";
pub const INVALID_BODY_MESSAGE: &str = "Invalid request body";

pub fn auth_routes(state: AppState) -> Router<AppState> {
    let login_route = Router::new()
        .route("/api/login", post(login))
        .route_layer(middleware::from_fn_with_state(state, limit_login_attempts));

    Router::new()
        .route("/api/register", post(register))
        .route("/logout", post(logout))
        .merge(login_route)
}

fn session_cookie(session: &Session, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session.id.clone()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .build()
}

fn expired_session_cookie() -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, "")).path("/").build()
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(payload) = payload.map_err(|rejection| {
        debug!(error = %rejection.body_text(), "unreadable registration body");
        AppError::Validation(INVALID_BODY_MESSAGE.into())
    })?;
    match services::register_user(&state, payload).await {
        Ok(_) => Ok(Json(MessageResponse {
            message: "User registered successfully".into(),
        })),
        Err(e) => {
            if let AppError::Validation(reason) = &e {
                info!(%reason, "registration rejected");
            }
            Err(e)
        }
    }
}

#[instrument(skip(state, jar, form), fields(username = tracing::field::Empty))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "unreadable login form");
            return Redirect::to(LOGIN_FAILURE_URL).into_response();
        }
    };
    tracing::Span::current().record("username", form.username.as_str());
    match services::login(&state, &form.username, &form.password).await {
        Ok(session) => {
            // never reuse whatever session id the browser arrived with
            if let Some(previous) = jar.get(SESSION_COOKIE) {
                state.sessions.invalidate(previous.value());
            }
            let cookie = session_cookie(&session, state.config.security.require_https);
            info!(user_id = %session.user_id, "user logged in");
            (jar.add(cookie), Redirect::to(LOGIN_SUCCESS_URL)).into_response()
        }
        Err(AppError::Authentication(cause)) => {
            debug!(%cause, "login failed");
            Redirect::to(LOGIN_FAILURE_URL).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[instrument(skip(state, jar))]
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Some(session) = state.sessions.invalidate(cookie.value()) {
            info!(user_id = %session.user_id, "user logged out");
        }
    }
    (
        jar.remove(expired_session_cookie()),
        Redirect::to(LOGOUT_SUCCESS_URL),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::build_app,
        auth::repo_types::{NewUser, Role},
        config::AppConfig,
        error::RATE_LIMIT_MESSAGE,
    };
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use tower::ServiceExt;

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn login_request(username: &str, password: &str, ip: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("x-forwarded-for", ip)
            .body(Body::from(format!("username={username}&password={password}")))
            .unwrap()
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(c) = cookie {
            builder = builder.header(header::COOKIE, c);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn location(response: &Response) -> &str {
        response.headers()[header::LOCATION].to_str().unwrap()
    }

    /// `SESSION=<id>` taken from the Set-Cookie headers of a login response.
    fn session_pair(response: &Response) -> String {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("SESSION="))
            .and_then(|v| v.split(';').next())
            .expect("session cookie")
            .to_string()
    }

    async fn register(app: &Router, username: &str, password: &str) -> Response {
        app.clone()
            .oneshot(json_request(
                "/api/register",
                serde_json::json!({ "username": username, "password": password }),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_then_duplicate() {
        let app = build_app(AppState::fake());

        let response = register(&app, "alice", "password123").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "message": "User registered successfully" })
        );

        let response = register(&app, "alice", "anything1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Username already exists");
    }

    #[tokio::test]
    async fn register_rejects_short_password_and_missing_fields() {
        let app = build_app(AppState::fake());

        let response = register(&app, "bob", "short").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "Password must be at least 8 characters long"
        );

        let response = app
            .clone()
            .oneshot(json_request("/api/register", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "Username must be between 3 and 50 characters"
        );
    }

    #[tokio::test]
    async fn malformed_registration_bodies_get_a_json_400() {
        let app = build_app(AppState::fake());

        let wrong_type = app
            .clone()
            .oneshot(json_request(
                "/api/register",
                serde_json::json!({ "username": 5, "password": "password123" }),
            ))
            .await
            .unwrap();
        let not_json = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let no_content_type = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/register")
                    .body(Body::from(r#"{"username":"alice","password":"password123"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        for response in [wrong_type, not_json, no_content_type] {
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                body_json(response).await,
                serde_json::json!({ "error": INVALID_BODY_MESSAGE })
            );
        }
    }

    #[tokio::test]
    async fn login_without_form_content_type_redirects_to_failure() {
        let app = build_app(AppState::fake());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/login")
                    .header("x-forwarded-for", "10.0.1.1")
                    .body(Body::from("username=alice&password=password123"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), LOGIN_FAILURE_URL);
    }

    #[tokio::test]
    async fn alice_scenario_over_http() {
        let state = AppState::fake();
        let app = build_app(state.clone());
        assert_eq!(register(&app, "alice", "password123").await.status(), StatusCode::OK);

        for expected in 1..=3 {
            let response = app
                .clone()
                .oneshot(login_request("alice", "wrongpass", "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(location(&response), LOGIN_FAILURE_URL);
            let stored = state.store.find_by_username("alice").await.unwrap().unwrap();
            assert_eq!(stored.failed_login_attempts, expected);
        }

        let response = app
            .clone()
            .oneshot(login_request("alice", "password123", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), LOGIN_SUCCESS_URL);
        let cookie = session_pair(&response);

        let stored = state.store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(stored.failed_login_attempts, 0);
        assert!(stored.last_login_at.is_some());

        let response = app
            .clone()
            .oneshot(get("/dashboard", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["username"], "alice");
    }

    #[tokio::test]
    async fn unknown_user_gets_the_same_redirect_as_bad_password() {
        let app = build_app(AppState::fake());
        register(&app, "alice", "password123").await;

        let unknown = app
            .clone()
            .oneshot(login_request("mallory", "password123", "10.0.0.2"))
            .await
            .unwrap();
        let wrong = app
            .clone()
            .oneshot(login_request("alice", "nottheone", "10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(unknown.status(), wrong.status());
        assert_eq!(location(&unknown), location(&wrong));
    }

    #[tokio::test]
    async fn eleventh_login_in_window_is_throttled() {
        let app = build_app(AppState::fake());

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(login_request("nobody", "password123", "198.51.100.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
        }

        let response = app
            .clone()
            .oneshot(login_request("nobody", "password123", "198.51.100.4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(body_json(response).await["error"], RATE_LIMIT_MESSAGE);

        // another client is unaffected
        let response = app
            .clone()
            .oneshot(login_request("nobody", "password123", "198.51.100.5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn registration_is_not_rate_limited() {
        let app = build_app(AppState::fake());
        for i in 0..12 {
            let response = register(&app, &format!("user{i:02}"), "password123").await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn locked_account_cannot_log_in_with_correct_password() {
        let state = AppState::fake();
        let app = build_app(state.clone());
        register(&app, "alice", "password123").await;

        for _ in 0..state.config.security.lockout_threshold {
            app.clone()
                .oneshot(login_request("alice", "wrongpass", "10.0.0.3"))
                .await
                .unwrap();
        }
        let response = app
            .clone()
            .oneshot(login_request("alice", "password123", "10.0.0.3"))
            .await
            .unwrap();
        assert_eq!(location(&response), LOGIN_FAILURE_URL);
        assert!(!state
            .store
            .find_by_username("alice")
            .await
            .unwrap()
            .unwrap()
            .account_non_locked);
    }

    #[tokio::test]
    async fn logout_invalidates_session() {
        let app = build_app(AppState::fake());
        register(&app, "alice", "password123").await;
        let response = app
            .clone()
            .oneshot(login_request("alice", "password123", "10.0.0.4"))
            .await
            .unwrap();
        let cookie = session_pair(&response);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/logout")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), LOGOUT_SUCCESS_URL);

        let response = app
            .clone()
            .oneshot(get("/dashboard", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login");
    }

    #[tokio::test]
    async fn second_login_evicts_first_session_by_default() {
        let app = build_app(AppState::fake());
        register(&app, "alice", "password123").await;

        let first = app
            .clone()
            .oneshot(login_request("alice", "password123", "10.0.0.5"))
            .await
            .unwrap();
        let first_cookie = session_pair(&first);
        let second = app
            .clone()
            .oneshot(login_request("alice", "password123", "10.0.0.6"))
            .await
            .unwrap();
        let second_cookie = session_pair(&second);

        let stale = app
            .clone()
            .oneshot(get("/dashboard", Some(&first_cookie)))
            .await
            .unwrap();
        assert_eq!(stale.status(), StatusCode::SEE_OTHER);

        let live = app
            .clone()
            .oneshot(get("/dashboard", Some(&second_cookie)))
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_routes_need_the_admin_role() {
        let state = AppState::fake();
        let app = build_app(state.clone());

        let response = app.clone().oneshot(get("/admin", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login");

        register(&app, "alice", "password123").await;
        let response = app
            .clone()
            .oneshot(login_request("alice", "password123", "10.0.0.7"))
            .await
            .unwrap();
        let user_cookie = session_pair(&response);
        let response = app
            .clone()
            .oneshot(get("/admin", Some(&user_cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let hash = state.hasher.hash("rootpassword").unwrap();
        state
            .store
            .save(NewUser {
                username: "root".into(),
                password_hash: hash,
                role: Role::Admin,
            })
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(login_request("root", "rootpassword", "10.0.0.8"))
            .await
            .unwrap();
        let admin_cookie = session_pair(&response);
        let response = app
            .clone()
            .oneshot(get("/admin", Some(&admin_cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["username"], "root");
    }

    #[tokio::test]
    async fn session_cookie_is_secure_when_https_is_required() {
        let mut config = AppConfig::for_tests();
        config.security.require_https = true;
        let state = AppState::fake_with(config);
        services::register_user(
            &state,
            RegisterRequest {
                username: "alice".into(),
                password: "password123".into(),
            },
        )
        .await
        .unwrap();
        let app = build_app(state);

        let mut request = login_request("alice", "password123", "10.0.0.9");
        request
            .headers_mut()
            .insert("x-forwarded-proto", "https".parse().unwrap());
        let response = app.clone().oneshot(request).await.unwrap();
        let set_cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("SESSION="))
            .unwrap()
            .to_string();
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Secure"));
    }
}
