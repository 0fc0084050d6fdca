//! Shared fixtures: an in-memory store with two theaters, their cashiers and
//! one administrator, and helpers to drive the router in-process.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use marquee_api::config::ApiConfig;
use marquee_api::{AppState, router};
use marquee_core::agent::SupervisorConfig;
use marquee_core::agent::printer::MemoryPrinter;
use marquee_core::auth::password::hash_password;
use marquee_core::id::{TenantId, UserId};
use marquee_core::models::auth::{User, UserCredentials};
use marquee_core::models::tenant::Tenant;
use marquee_core::store::Store;
use marquee_core::store::memory::MemoryStore;
use serde_json::{Value, json};
use tower::ServiceExt;

pub const PASSWORD: &str = "p@ss";
pub const CASHIER1_PIN: &str = "4242";
pub const CASHIER2_PIN: &str = "1111";
pub const ADMIN_EMAIL: &str = "boss@example.com";
pub const ADMIN_PASSWORD: &str = "secret";

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub printer: Arc<MemoryPrinter>,
    pub router: Router,
}

pub fn test_config() -> ApiConfig {
    let mut config = ApiConfig::development();
    config.agent_autostart = false;
    config.db_ready_timeout = Duration::from_millis(50);
    config
}

pub async fn app() -> TestApp {
    app_with(test_config()).await
}

pub async fn app_with(config: ApiConfig) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    seed(&store).await;
    let printer = Arc::new(MemoryPrinter::new());
    let supervisor = SupervisorConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        start_timeout: Duration::from_secs(5),
    };
    let state = AppState::with_supervisor_config(store.clone(), config, printer.clone(), supervisor);
    TestApp {
        router: router(state.clone()),
        state,
        store,
        printer,
    }
}

fn user(id: &str, tenant: Option<&str>, username: &str, password: &str, pin: Option<&str>) -> UserCredentials {
    let admin = tenant.is_none();
    UserCredentials {
        user: User {
            id: UserId::new(id),
            tenant_id: tenant.map(TenantId::new),
            username: username.into(),
            email: admin.then(|| ADMIN_EMAIL.to_string()),
            display_name: None,
            role: if admin { "admin" } else { "cashier" }.into(),
            user_type: if admin { "admin" } else { "theater_user" }.into(),
            is_active: true,
            last_login_at: None,
        },
        password_hash: hash_password(password).unwrap(),
        pin: pin.map(str::to_string),
    }
}

async fn seed(store: &MemoryStore) {
    store
        .upsert_tenant(&Tenant::new(TenantId::new("T1"), "Grand"))
        .await
        .unwrap();
    store
        .upsert_tenant(&Tenant::new(TenantId::new("T2"), "Roxy"))
        .await
        .unwrap();
    store
        .insert_user(&user("U1", Some("T1"), "cashier1", PASSWORD, Some(CASHIER1_PIN)))
        .await
        .unwrap();
    store
        .insert_user(&user("U2", Some("T2"), "cashier2", PASSWORD, Some(CASHIER2_PIN)))
        .await
        .unwrap();
    store
        .insert_user(&user("A1", None, "boss", ADMIN_PASSWORD, None))
        .await
        .unwrap();
}

pub struct Call<'a> {
    method: Method,
    uri: &'a str,
    token: Option<&'a str>,
    headers: Vec<(&'a str, String)>,
    body: Option<Value>,
}

pub fn get(uri: &str) -> Call<'_> {
    Call {
        method: Method::GET,
        uri,
        token: None,
        headers: Vec::new(),
        body: None,
    }
}

pub fn post(uri: &str, body: Value) -> Call<'_> {
    Call {
        method: Method::POST,
        uri,
        token: None,
        headers: Vec::new(),
        body: Some(body),
    }
}

impl<'a> Call<'a> {
    pub fn token(mut self, token: &'a str) -> Self {
        self.token = Some(token);
        self
    }

    pub fn header(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn request(self) -> Request<Body> {
        let mut builder = Request::builder().method(self.method).uri(self.uri);
        if let Some(token) = self.token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        match self.body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    pub async fn send(self, router: &Router) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(self.request()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}

/// Password step; returns the `pendingAuth` envelope.
pub async fn password_step(router: &Router, username: &str) -> Value {
    let (status, json) = post(
        "/auth/login",
        json!({"username": username, "password": PASSWORD}),
    )
    .send(router)
    .await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["isPinRequired"], true);
    json["pendingAuth"].clone()
}

/// PIN step for a pending envelope; returns the raw response.
pub async fn pin_step(router: &Router, pending: &Value, pin: &str) -> (StatusCode, Value) {
    post(
        "/auth/validate-pin",
        json!({
            "userId": pending["userId"],
            "tenantId": pending["tenantId"],
            "pin": pin,
            "ephemeralSecret": pending["ephemeralSecret"],
        }),
    )
    .send(router)
    .await
}

/// Full two-step login; returns `(token, refreshToken)`.
pub async fn pin_login(router: &Router, username: &str, pin: &str) -> (String, String) {
    let pending = password_step(router, username).await;
    let (status, json) = pin_step(router, &pending, pin).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    (
        json["token"].as_str().unwrap().to_string(),
        json["refreshToken"].as_str().unwrap().to_string(),
    )
}

pub async fn admin_login(router: &Router) -> String {
    let (status, json) = post(
        "/auth/login",
        json!({"email": ADMIN_EMAIL, "password": ADMIN_PASSWORD}),
    )
    .send(router)
    .await;
    assert_eq!(status, StatusCode::OK, "{json}");
    json["token"].as_str().unwrap().to_string()
}

pub fn order_body(tenant: &str, key: &str) -> Value {
    json!({
        "tenantId": tenant,
        "idempotencyKey": key,
        "items": [{"productId": "P1", "name": "Popcorn", "quantity": 2, "unitPriceCents": 450}],
        "taxCents": 90,
        "customer": {"name": "Ada", "phone": "+1 555 0100", "seat": "H12"}
    })
}

/// Poll `condition` for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
