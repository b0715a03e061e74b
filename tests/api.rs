//! End-to-end tests that drive the router in memory.

use std::sync::Arc;

use attendance::app::{router, AppState};
use attendance::config::{MailConfig, OidcConfig};
use attendance::{Config, Storage};
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

struct Reply {
    status: StatusCode,
    cookie: Option<String>,
    content_type: Option<String>,
    body: Value,
}

fn app() -> Router {
    app_with(Config::default()).0
}

fn app_with(config: Config) -> (Router, Arc<AppState>) {
    let storage = Storage::open_in_memory().unwrap();
    let state = Arc::new(AppState::new(config, storage).unwrap());
    (router(state.clone()), state)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    cookie: Option<&str>,
    body: Option<Value>,
) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::to_string);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };

    Reply {
        status,
        cookie,
        content_type,
        body,
    }
}

async fn register(app: &Router, username: &str) -> String {
    let reply = send(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "username": username,
            "email": format!("{username}@example.edu.vn"),
            "password": "mat-khau-123",
        })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    reply.cookie.expect("register sets a session cookie")
}

async fn create_event(app: &Router, cookie: &str) -> i64 {
    let reply = send(
        app,
        "POST",
        "/api/events",
        Some(cookie),
        Some(json!({
            "name": "Ngày hội việc làm",
            "location": "Sân vận động",
            "event_date": "2024-06-01",
            "start_time": "08:00",
            "end_time": "17:00",
        })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.body["is_owner"], true);
    reply.body["id"].as_i64().unwrap()
}

async fn enroll(app: &Router, cookie: &str, event_id: i64, student_id: &str) -> Value {
    let reply = send(
        app,
        "POST",
        &format!("/api/events/{event_id}/attendees"),
        Some(cookie),
        Some(json!({ "student_id": student_id, "full_name": "Nguyễn Văn An" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    reply.body
}

#[tokio::test]
async fn health_is_public() {
    let app = app();
    let reply = send(&app, "GET", "/health", None, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["status"], "ok");
}

#[tokio::test]
async fn api_requires_a_session() {
    let app = app();
    let reply = send(&app, "GET", "/api/events", None, None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = send(&app, "GET", "/api/events", Some("session=bogus"), None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_login_and_logout() {
    let app = app();
    let cookie = register(&app, "organizer").await;

    let me = send(&app, "GET", "/api/auth/me", Some(&cookie), None).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["username"], "organizer");
    assert!(me.body.get("password_hash").is_none());

    let wrong = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "username": "organizer", "password": "nope-nope" })),
    )
    .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);

    let by_email = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "username": "organizer@example.edu.vn", "password": "mat-khau-123" })),
    )
    .await;
    assert_eq!(by_email.status, StatusCode::OK);
    let fresh = by_email.cookie.unwrap();

    let out = send(&app, "POST", "/api/auth/logout", Some(&fresh), None).await;
    assert_eq!(out.status, StatusCode::NO_CONTENT);
    let me = send(&app, "GET", "/api/auth/me", Some(&fresh), None).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn duplicate_username_conflicts() {
    let app = app();
    register(&app, "organizer").await;
    let reply = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "username": "organizer", "password": "mat-khau-123" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn check_in_flow() {
    let app = app();
    let cookie = register(&app, "organizer").await;
    let event_id = create_event(&app, &cookie).await;
    let attendee = enroll(&app, &cookie, event_id, "SV001").await;
    let qr = attendee["qr_code"].as_str().unwrap().to_string();
    assert_eq!(attendee["status"], "pending");

    let checkin = format!("/api/events/{event_id}/checkin");
    let first = send(&app, "POST", &checkin, Some(&cookie), Some(json!({ "code": qr }))).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["result"], "checked_in");
    assert_eq!(first.body["attendee"]["status"], "checked_in");
    assert_eq!(first.body["log"]["method"], "qr");

    // A second scan straight away stays checked in.
    let again = send(&app, "POST", &checkin, Some(&cookie), Some(json!({ "code": qr }))).await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["result"], "unchanged");
    assert!(again.body["log"].is_null());

    let out = send(
        &app,
        "POST",
        &checkin,
        Some(&cookie),
        Some(json!({ "code": "SV001", "action": "check_out", "method": "manual" })),
    )
    .await;
    assert_eq!(out.status, StatusCode::OK);
    assert_eq!(out.body["result"], "checked_out");

    let back_in = send(
        &app,
        "POST",
        &checkin,
        Some(&cookie),
        Some(json!({ "code": qr, "action": "check_in" })),
    )
    .await;
    assert_eq!(back_in.status, StatusCode::CONFLICT);

    let unknown = send(&app, "POST", &checkin, Some(&cookie), Some(json!({ "code": "NOPE" }))).await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);

    let stats = send(&app, "GET", &format!("/api/events/{event_id}/stats"), Some(&cookie), None).await;
    assert_eq!(stats.status, StatusCode::OK);
    assert_eq!(stats.body["total"], 1);
    assert_eq!(stats.body["checked_out"], 1);
    assert_eq!(stats.body["attendance_rate"], 100.0);

    let logs = send(&app, "GET", &format!("/api/events/{event_id}/logs"), Some(&cookie), None).await;
    assert_eq!(logs.status, StatusCode::OK);
    assert_eq!(logs.body.as_array().unwrap().len(), 2);

    let reset = send(
        &app,
        "POST",
        &format!("/api/events/{event_id}/attendees/{}/reset", attendee["id"]),
        Some(&cookie),
        None,
    )
    .await;
    assert_eq!(reset.status, StatusCode::OK);
    assert_eq!(reset.body["result"], "reset");
    assert_eq!(reset.body["attendee"]["status"], "pending");
}

#[tokio::test]
async fn qr_from_another_event_is_rejected() {
    let app = app();
    let cookie = register(&app, "organizer").await;
    let first = create_event(&app, &cookie).await;
    let second = create_event(&app, &cookie).await;
    let attendee = enroll(&app, &cookie, first, "SV001").await;

    let reply = send(
        &app,
        "POST",
        &format!("/api/events/{second}/checkin"),
        Some(&cookie),
        Some(json!({ "code": attendee["qr_code"] })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn collaborator_permissions_are_enforced() {
    let app = app();
    let owner = register(&app, "organizer").await;
    let viewer = register(&app, "viewer").await;
    let stranger = register(&app, "stranger").await;
    let event_id = create_event(&app, &owner).await;
    enroll(&app, &owner, event_id, "SV001").await;

    let added = send(
        &app,
        "POST",
        &format!("/api/events/{event_id}/collaborators"),
        Some(&owner),
        Some(json!({ "username": "viewer", "permissions": ["view"] })),
    )
    .await;
    assert_eq!(added.status, StatusCode::CREATED);

    let seen = send(&app, "GET", &format!("/api/events/{event_id}"), Some(&viewer), None).await;
    assert_eq!(seen.status, StatusCode::OK);
    assert_eq!(seen.body["is_owner"], false);
    assert_eq!(seen.body["permissions"], json!(["view"]));

    let listed = send(&app, "GET", "/api/events", Some(&viewer), None).await;
    assert_eq!(listed.body.as_array().unwrap().len(), 1);

    let denied = send(
        &app,
        "POST",
        &format!("/api/events/{event_id}/checkin"),
        Some(&viewer),
        Some(json!({ "code": "SV001" })),
    )
    .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let hidden = send(&app, "GET", &format!("/api/events/{event_id}"), Some(&stranger), None).await;
    assert_eq!(hidden.status, StatusCode::NOT_FOUND);

    let delete = send(&app, "DELETE", &format!("/api/events/{event_id}"), Some(&viewer), None).await;
    assert_eq!(delete.status, StatusCode::FORBIDDEN);

    let delete = send(&app, "DELETE", &format!("/api/events/{event_id}"), Some(&owner), None).await;
    assert_eq!(delete.status, StatusCode::NO_CONTENT);
    let gone = send(&app, "GET", &format!("/api/events/{event_id}"), Some(&owner), None).await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bulk_enroll_is_all_or_nothing() {
    let app = app();
    let cookie = register(&app, "organizer").await;
    let event_id = create_event(&app, &cookie).await;
    let uri = format!("/api/events/{event_id}/attendees/bulk");

    let bad = send(
        &app,
        "POST",
        &uri,
        Some(&cookie),
        Some(json!({ "attendees": [
            { "student_id": "SV001", "full_name": "An" },
            { "student_id": "SV001", "full_name": "Bình" },
        ]})),
    )
    .await;
    assert_eq!(bad.status, StatusCode::CONFLICT);

    let list = send(&app, "GET", &format!("/api/events/{event_id}/attendees"), Some(&cookie), None).await;
    assert!(list.body.as_array().unwrap().is_empty());

    let good = send(
        &app,
        "POST",
        &uri,
        Some(&cookie),
        Some(json!({ "attendees": [
            { "student_id": "SV001", "full_name": "An" },
            { "student_id": "SV002", "full_name": "Bình" },
        ]})),
    )
    .await;
    assert_eq!(good.status, StatusCode::CREATED);

    let search = send(
        &app,
        "GET",
        &format!("/api/events/{event_id}/attendees?q=sv002"),
        Some(&cookie),
        None,
    )
    .await;
    assert_eq!(search.body.as_array().unwrap().len(), 1);
    assert_eq!(search.body[0]["full_name"], "Bình");
}

#[tokio::test]
async fn qr_images_and_export() {
    let app = app();
    let cookie = register(&app, "organizer").await;
    let event_id = create_event(&app, &cookie).await;
    let attendee = enroll(&app, &cookie, event_id, "SV001").await;
    let base = format!("/api/events/{event_id}/attendees/{}", attendee["id"]);

    let png = send(&app, "GET", &format!("{base}/qr"), Some(&cookie), None).await;
    assert_eq!(png.status, StatusCode::OK);
    assert_eq!(png.content_type.as_deref(), Some("image/png"));

    let svg = send(&app, "GET", &format!("{base}/qr?format=svg"), Some(&cookie), None).await;
    assert_eq!(svg.content_type.as_deref(), Some("image/svg+xml"));

    let regenerated = send(&app, "POST", &format!("{base}/qr/regenerate"), Some(&cookie), None).await;
    assert_eq!(regenerated.status, StatusCode::OK);
    assert_ne!(regenerated.body["qr_code"], attendee["qr_code"]);

    let email = send(&app, "POST", &format!("{base}/qr/email"), Some(&cookie), None).await;
    assert_eq!(email.status, StatusCode::SERVICE_UNAVAILABLE);

    let csv = send(&app, "GET", &format!("/api/events/{event_id}/export"), Some(&cookie), None).await;
    assert_eq!(csv.status, StatusCode::OK);
    assert_eq!(csv.content_type.as_deref(), Some("text/csv; charset=utf-8"));
    assert!(csv.body.as_str().unwrap().contains("SV001"));
}

#[tokio::test]
async fn dashboard_overview_counts_visible_events() {
    let app = app();
    let cookie = register(&app, "organizer").await;
    let event_id = create_event(&app, &cookie).await;
    enroll(&app, &cookie, event_id, "SV001").await;
    enroll(&app, &cookie, event_id, "SV002").await;

    let overview = send(&app, "GET", "/api/dashboard", Some(&cookie), None).await;
    assert_eq!(overview.status, StatusCode::OK);
    assert_eq!(overview.body["total_events"], 1);
    assert_eq!(overview.body["total_attendees"], 2);
}

#[tokio::test]
async fn optional_integrations_report_unavailable() {
    let app = app();
    let oidc = send(&app, "GET", "/auth/oidc/login", None, None).await;
    assert_eq!(oidc.status, StatusCode::SERVICE_UNAVAILABLE);

    let forgot = send(
        &app,
        "POST",
        "/api/auth/forgot-password",
        None,
        Some(json!({ "email": "someone@example.edu.vn" })),
    )
    .await;
    assert_eq!(forgot.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn stats_follow_check_ins() {
    let app = app();
    let cookie = register(&app, "organizer").await;
    let event_id = create_event(&app, &cookie).await;
    enroll(&app, &cookie, event_id, "SV001").await;
    let stats_uri = format!("/api/events/{event_id}/stats");

    let before = send(&app, "GET", &stats_uri, Some(&cookie), None).await;
    assert_eq!(before.body["total"], 1);
    assert_eq!(before.body["checked_in"], 0);

    let checkin = send(
        &app,
        "POST",
        &format!("/api/events/{event_id}/checkin"),
        Some(&cookie),
        Some(json!({ "code": "SV001", "method": "manual" })),
    )
    .await;
    assert_eq!(checkin.status, StatusCode::OK);

    let after = send(&app, "GET", &stats_uri, Some(&cookie), None).await;
    assert_eq!(after.body["checked_in"], 1);
    assert_eq!(after.body["pending"], 0);
}

#[tokio::test]
async fn check_in_reaches_live_subscribers() {
    let (app, state) = app_with(Config::default());
    let cookie = register(&app, "organizer").await;
    let event_id = create_event(&app, &cookie).await;
    let attendee = enroll(&app, &cookie, event_id, "SV001").await;

    let mut feed = state.realtime.subscribe(event_id);
    let reply = send(
        &app,
        "POST",
        &format!("/api/events/{event_id}/checkin"),
        Some(&cookie),
        Some(json!({ "code": attendee["qr_code"] })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let frame: Value = serde_json::from_str(&feed.try_recv().unwrap()).unwrap();
    assert_eq!(frame["type"], "checkin");
    assert_eq!(frame["event_id"], event_id);
    assert_eq!(frame["data"]["attendee"]["student_id"], "SV001");

    let stats: Value = serde_json::from_str(&feed.try_recv().unwrap()).unwrap();
    assert_eq!(stats["type"], "stats");
    assert_eq!(stats["data"]["checked_in"], 1);
}

#[tokio::test]
async fn live_feed_requires_a_session() {
    let app = app();
    let reply = send(&app, "GET", "/ws/events/1", None, None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn password_change_ends_other_sessions() {
    let app = app();
    let current = register(&app, "organizer").await;
    let other = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "username": "organizer", "password": "mat-khau-123" })),
    )
    .await
    .cookie
    .unwrap();

    let changed = send(
        &app,
        "POST",
        "/api/auth/change-password",
        Some(&current),
        Some(json!({ "current_password": "mat-khau-123", "new_password": "mat-khau-moi" })),
    )
    .await;
    assert_eq!(changed.status, StatusCode::NO_CONTENT);

    let me = send(&app, "GET", "/api/auth/me", Some(&current), None).await;
    assert_eq!(me.status, StatusCode::OK);
    let me = send(&app, "GET", "/api/auth/me", Some(&other), None).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn password_reset_ends_all_sessions() {
    let (app, state) = app_with(Config::default());
    let cookie = register(&app, "organizer").await;
    {
        let storage = state.storage();
        let user = storage.find_user_by_username("organizer").unwrap().unwrap();
        let expires = chrono::Utc::now() + chrono::Duration::minutes(10);
        storage.set_reset_code(user.id, Some(("ABC12345", expires))).unwrap();
    }

    let reset = send(
        &app,
        "POST",
        "/api/auth/reset-password",
        None,
        Some(json!({
            "email": "organizer@example.edu.vn",
            "code": "abc12345",
            "new_password": "mat-khau-moi",
        })),
    )
    .await;
    assert_eq!(reset.status, StatusCode::NO_CONTENT);

    let me = send(&app, "GET", "/api/auth/me", Some(&cookie), None).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn forgot_password_hides_mail_failures() {
    let mut config = Config::default();
    // Nothing listens on port 1, so delivery fails.
    config.mail = Some(MailConfig {
        host: "localhost".into(),
        port: 1,
        username: "mailer".into(),
        password: "secret".into(),
        from: "Diem danh <noreply@example.edu.vn>".into(),
    });
    let (app, _) = app_with(config);
    register(&app, "organizer").await;

    for email in ["organizer@example.edu.vn", "nobody@example.edu.vn"] {
        let reply = send(
            &app,
            "POST",
            "/api/auth/forgot-password",
            None,
            Some(json!({ "email": email })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::ACCEPTED);
    }
}

fn oidc_config() -> Config {
    let mut config = Config::default();
    config.oidc = Some(OidcConfig {
        issuer_url: None,
        authorize_url: Some("https://id.example.edu.vn/authorize".into()),
        token_url: Some("https://id.example.edu.vn/token".into()),
        userinfo_url: Some("https://id.example.edu.vn/userinfo".into()),
        client_id: "attendance".into(),
        client_secret: "secret".into(),
        redirect_url: "http://127.0.0.1:3000/auth/oidc/callback".into(),
        scopes: vec!["openid".into(), "email".into()],
    });
    config
}

#[tokio::test]
async fn oidc_callback_requires_the_starting_browser() {
    let (app, _) = app_with(oidc_config());

    let start = app
        .clone()
        .oneshot(Request::get("/auth/oidc/login").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(start.status(), StatusCode::SEE_OTHER);
    let location = start.headers()[header::LOCATION].to_str().unwrap().to_string();
    let cookie = start.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let login_state = cookie.strip_prefix("oidc_state=").unwrap().to_string();
    assert!(location.contains(&format!("state={login_state}")));

    let callback = format!("/auth/oidc/callback?code=abc&state={login_state}");
    let no_cookie = send(&app, "GET", &callback, None, None).await;
    assert_eq!(no_cookie.status, StatusCode::BAD_REQUEST);

    let other = send(&app, "GET", &callback, Some("oidc_state=someone-else"), None).await;
    assert_eq!(other.status, StatusCode::BAD_REQUEST);
}
