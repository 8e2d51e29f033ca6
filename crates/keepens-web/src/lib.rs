//! Axum JSON API for KeepENS.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use keepens_adapters::Mailer;
use keepens_core::SubscriptionRecord;
use keepens_engine::{
    sample_notice, ConnectedAddressResolver, DomainResolver, ExpiryNotifier, Services,
};
use keepens_storage::{StoreError, SubscriptionStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "keepens-web";

const DEFAULT_PREVIEW_DAYS: i64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<DomainResolver>,
    pub connected: Arc<ConnectedAddressResolver>,
    pub notifier: Arc<ExpiryNotifier>,
    pub store: Arc<dyn SubscriptionStore>,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn from_services(services: &Services) -> Self {
        Self {
            resolver: services.resolver.clone(),
            connected: services.connected.clone(),
            notifier: services.notifier.clone(),
            store: services.store.clone(),
            cron_secret: services.config.cron_secret.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AddressQuery {
    address: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FidQuery {
    fid: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SubscriptionQuery {
    wallet_address: Option<String>,
    ens_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SubscribeBody {
    wallet_address: Option<String>,
    ens_name: Option<String>,
    expiry_date: Option<JsonValue>,
    email: Option<String>,
    fid: Option<JsonValue>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PreviewBody {
    test_email: Option<String>,
    days_threshold: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TestEmailBody {
    email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: Uuid,
    pub ens_name: String,
    pub expiry_date: DateTime<Utc>,
    pub notified: bool,
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl From<SubscriptionRecord> for SubscriptionView {
    fn from(record: SubscriptionRecord) -> Self {
        Self {
            id: record.id,
            ens_name: record.ens_name,
            expiry_date: record.expiry_date,
            notified: record.notified,
            last_notified_at: record.last_notified_at,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ens", get(ens_handler))
        .route("/api/farcaster/connected-addresses", get(connected_addresses_handler))
        .route(
            "/api/subscribe",
            post(subscribe_handler)
                .delete(unsubscribe_handler)
                .get(list_subscriptions_handler),
        )
        .route(
            "/api/cron/check-expiry",
            get(check_expiry_handler).post(preview_expiry_handler),
        )
        .route("/api/test-email", post(test_email_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(services: &Services) -> anyhow::Result<()> {
    let port = services.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "keepens api listening");
    axum::serve(listener, app(AppState::from_services(services))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let services = Services::from_env().await?;
    serve(&services).await
}

async fn ens_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AddressQuery>,
) -> Response {
    let Some(address) = non_blank(query.address) else {
        return bad_request("Address parameter is required");
    };
    match state.resolver.resolve(&address).await {
        Ok(domains) => Json(json!({
            "address": address,
            "count": domains.len(),
            "domains": domains,
        }))
        .into_response(),
        Err(err) => server_error("Failed to fetch ENS domains", err.into()),
    }
}

async fn connected_addresses_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FidQuery>,
) -> Response {
    let Some(fid) = non_blank(query.fid) else {
        return bad_request("FID parameter is required");
    };
    let addresses = state.connected.resolve_addresses_for_identity(&fid).await;
    Json(json!({
        "fid": fid,
        "count": addresses.len(),
        "addresses": addresses,
    }))
    .into_response()
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubscribeBody>,
) -> Response {
    let (Some(wallet), Some(ens_name), Some(expiry_raw)) = (
        non_blank(body.wallet_address),
        non_blank(body.ens_name),
        body.expiry_date.filter(|v| !v.is_null()),
    ) else {
        return bad_request("Missing required fields: walletAddress, ensName, expiryDate");
    };
    let Some(expiry_date) = parse_expiry_date(&expiry_raw) else {
        return bad_request(
            "expiryDate must be an RFC 3339 timestamp, a YYYY-MM-DD date or unix seconds",
        );
    };
    let fid = body.fid.as_ref().and_then(fid_string);
    let type_label = if body.kind.as_deref() == Some("basename") {
        "Basename"
    } else {
        "ENS domain"
    };

    let result = async {
        let user = state
            .store
            .find_or_create_user(&wallet, body.email.as_deref(), fid.as_deref())
            .await?;
        state.store.subscribe(user.id, &ens_name, expiry_date).await
    }
    .await;

    match result {
        Ok(record) => Json(json!({
            "success": true,
            "record": SubscriptionView::from(record),
        }))
        .into_response(),
        Err(err) => server_error(&format!("Failed to subscribe to {type_label}"), err.into()),
    }
}

async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Response {
    let (Some(wallet), Some(ens_name)) =
        (non_blank(query.wallet_address), non_blank(query.ens_name))
    else {
        return bad_request("Missing required parameters: walletAddress, ensName");
    };

    let result = async {
        let user = state.store.find_or_create_user(&wallet, None, None).await?;
        state.store.unsubscribe(user.id, &ens_name).await
    }
    .await;

    match result {
        Ok(()) => Json(json!({
            "success": true,
            "message": "Successfully unsubscribed from ENS domain",
        }))
        .into_response(),
        Err(StoreError::SubscriptionNotFound { .. }) => {
            error_json(StatusCode::NOT_FOUND, "Subscription not found")
        }
        Err(err) => server_error("Failed to unsubscribe from ENS domain", err.into()),
    }
}

async fn list_subscriptions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Response {
    let Some(wallet) = non_blank(query.wallet_address) else {
        return bad_request("Missing required parameter: walletAddress");
    };

    let result = async {
        let user = state.store.find_or_create_user(&wallet, None, None).await?;
        state.store.list_subscriptions(user.id).await
    }
    .await;

    match result {
        Ok(records) => Json(json!({
            "success": true,
            "records": records.into_iter().map(SubscriptionView::from).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(err) => server_error("Failed to get subscriptions", err.into()),
    }
}

async fn check_expiry_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !cron_authorized(state.cron_secret.as_deref(), &headers) {
        return error_json(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    match state.notifier.run_once(Utc::now()).await {
        Ok(summary) => {
            let mut body = json!({
                "success": true,
                "message": "Cron job completed",
                "sent": summary.sent,
                "failed": summary.failed,
                "skipped": summary.skipped,
            });
            if !summary.errors.is_empty() {
                body["errors"] = json!(summary.errors);
            }
            Json(body).into_response()
        }
        Err(err) => server_error("Cron job failed", err.into()),
    }
}

async fn preview_expiry_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PreviewBody>,
) -> Response {
    let Some(test_email) = non_blank(body.test_email) else {
        return bad_request("testEmail is required for testing");
    };
    let days = body.days_threshold.unwrap_or(DEFAULT_PREVIEW_DAYS);

    match state.notifier.send_preview(&test_email, days, Utc::now()).await {
        Ok(outcome) if outcome.domains_count == 0 => Json(json!({
            "success": true,
            "message": "No expiring domains found",
            "testEmail": test_email,
        }))
        .into_response(),
        Ok(outcome) => {
            let success = outcome.error.is_none();
            let message = if success {
                "Test email sent successfully"
            } else {
                "Failed to send test email"
            };
            Json(json!({
                "success": success,
                "message": message,
                "error": outcome.error,
                "testEmail": test_email,
                "domainsCount": outcome.domains_count,
            }))
            .into_response()
        }
        Err(err) => server_error("Test failed", err.into()),
    }
}

async fn test_email_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestEmailBody>,
) -> Response {
    let Some(email) = non_blank(body.email) else {
        return bad_request("Email address is required");
    };
    if !is_plausible_email(&email) {
        return bad_request("Invalid email format");
    }

    let notice = sample_notice(Utc::now());
    match state
        .notifier
        .mailer()
        .send_expiry_notice(&email, std::slice::from_ref(&notice), Some("Test User"))
        .await
    {
        Ok(()) => Json(json!({
            "success": true,
            "message": "Test email sent successfully",
            "email": email,
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "test email failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": err.to_string()})),
            )
                .into_response()
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn fid_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => non_blank(Some(s.clone())),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts RFC 3339 timestamps, bare `YYYY-MM-DD` dates (midnight UTC) or
/// unix seconds.
pub fn parse_expiry_date(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|dt| dt.and_utc())
                })
        }
        JsonValue::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// `local@domain.tld` with no whitespace.
pub fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

fn cron_authorized(secret: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {secret}"))
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: &str) -> Response {
    error_json(StatusCode::BAD_REQUEST, message)
}

fn server_error(message: &str, err: anyhow::Error) -> Response {
    warn!(error = %err, "{message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message, "details": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use keepens_adapters::{
        ChainReadError, ChainReader, DomainIndexer, ExpiryNotice, IdentityError, IdentityLookup,
        IdentityProfile, IndexerError, LogMailer, MailError,
    };
    use keepens_core::{DomainRecord, LabelHash, Namespace};
    use keepens_storage::MemorySubscriptionStore;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct StaticIndexer;

    #[async_trait]
    impl DomainIndexer for StaticIndexer {
        async fn query_owned_domains(
            &self,
            owner: &str,
            namespace: Namespace,
        ) -> Result<Vec<DomainRecord>, IndexerError> {
            Ok(match namespace {
                Namespace::Primary => vec![DomainRecord {
                    external_id: Some("0x1".to_string()),
                    full_name: "alice.eth".to_string(),
                    label: Some("alice".to_string()),
                    raw_expiry: Some(4_000_000_000),
                    owner_address: owner.to_string(),
                    namespace,
                }],
                Namespace::L2 => Vec::new(),
            })
        }
    }

    struct DownChain;

    #[async_trait]
    impl ChainReader for DownChain {
        async fn authoritative_expiry(
            &self,
            _identifier: &LabelHash,
            _namespace: Namespace,
            _is_wrapped: bool,
        ) -> Result<u64, ChainReadError> {
            Err(ChainReadError::Malformed("offline".to_string()))
        }
    }

    struct StaticIdentity;

    #[async_trait]
    impl IdentityLookup for StaticIdentity {
        async fn lookup(&self, fid: u64) -> Result<Option<IdentityProfile>, IdentityError> {
            Ok(Some(IdentityProfile {
                fid,
                verified_eth_addresses: vec!["0xAbC".to_string()],
                custody_address: None,
            }))
        }
    }

    #[derive(Default)]
    struct CapturingMailer {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Mailer for CapturingMailer {
        async fn send_expiry_notice(
            &self,
            to: &str,
            _domains: &[ExpiryNotice],
            _user_name: Option<&str>,
        ) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    fn state_with(mailer: Arc<dyn Mailer>) -> (AppState, Arc<MemorySubscriptionStore>) {
        let store = Arc::new(MemorySubscriptionStore::new());
        let state = AppState {
            resolver: Arc::new(DomainResolver::new(
                Arc::new(StaticIndexer),
                Arc::new(DownChain),
                "0xwrapper",
            )),
            connected: Arc::new(ConnectedAddressResolver::new(Arc::new(StaticIdentity))),
            notifier: Arc::new(ExpiryNotifier::new(store.clone(), mailer, 30)),
            store: store.clone(),
            cron_secret: Some("s3cret".to_string()),
        };
        (state, store)
    }

    fn test_app() -> Router {
        app(state_with(Arc::new(LogMailer)).0)
    }

    fn json_request(method: &str, uri: &str, body: JsonValue) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ens_lookup_returns_resolved_domains() {
        let resp = test_app().oneshot(get_request("/api/ens?address=0xABC")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["address"], "0xABC");
        assert_eq!(body["count"], 1);
        assert_eq!(body["domains"][0]["name"], "alice.eth");
        assert_eq!(body["domains"][0]["expiryTimestamp"], 4_000_000_000u64);
        assert_eq!(body["domains"][0]["ownerAddress"], "0xabc");
    }

    #[tokio::test]
    async fn ens_lookup_requires_address() {
        let resp = test_app().oneshot(get_request("/api/ens")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn connected_addresses_are_lowercased() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(get_request("/api/farcaster/connected-addresses?fid=42"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["addresses"], json!(["0xabc"]));
        assert_eq!(body["count"], 1);

        let missing = app.oneshot(get_request("/api/farcaster/connected-addresses")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscribe_list_and_unsubscribe_round_trip() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/subscribe",
                json!({
                    "walletAddress": "0xAbC",
                    "ensName": "alice.eth",
                    "expiryDate": "2027-01-01T00:00:00Z",
                    "email": "alice@example.com",
                    "fid": 42
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["record"]["ensName"], "alice.eth");
        assert_eq!(body["record"]["notified"], false);

        let listed = app
            .clone()
            .oneshot(get_request("/api/subscribe?walletAddress=0xabc"))
            .await
            .unwrap();
        let listed = body_json(listed).await;
        assert_eq!(listed["records"].as_array().unwrap().len(), 1);

        let deleted = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/api/subscribe?walletAddress=0xABC&ensName=alice.eth")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);

        let listed = app
            .oneshot(get_request("/api/subscribe?walletAddress=0xabc"))
            .await
            .unwrap();
        let listed = body_json(listed).await;
        assert!(listed["records"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_rejects_missing_fields() {
        let resp = test_app()
            .oneshot(json_request("POST", "/api/subscribe", json!({"walletAddress": "0xabc"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cron_requires_bearer_secret() {
        let app = test_app();
        let denied = app.clone().oneshot(get_request("/api/cron/check-expiry")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/cron/check-expiry")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/cron/check-expiry")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert_eq!(body["sent"], 0);
        assert!(body.get("errors").is_none());
    }

    #[tokio::test]
    async fn cron_sweep_emails_expiring_subscribers() {
        let mailer = Arc::new(CapturingMailer::default());
        let (state, store) = state_with(mailer.clone());
        let user = store
            .find_or_create_user("0xabc", Some("owner@example.com"), None)
            .await
            .unwrap();
        store
            .subscribe(user.id, "soon.eth", Utc::now() + chrono::Duration::days(3))
            .await
            .unwrap();

        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/cron/check-expiry")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["sent"], 1);
        assert_eq!(mailer.sent.lock().unwrap().as_slice(), ["owner@example.com".to_string()]);
    }

    #[tokio::test]
    async fn preview_requires_test_email() {
        let app = test_app();
        let missing = app
            .clone()
            .oneshot(json_request("POST", "/api/cron/check-expiry", json!({})))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let empty = app
            .oneshot(json_request(
                "POST",
                "/api/cron/check-expiry",
                json!({"testEmail": "qa@example.com"}),
            ))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::OK);
        assert_eq!(body_json(empty).await["message"], "No expiring domains found");
    }

    #[tokio::test]
    async fn test_email_validates_address() {
        let mailer = Arc::new(CapturingMailer::default());
        let app = app(state_with(mailer.clone()).0);
        let bad = app
            .clone()
            .oneshot(json_request("POST", "/api/test-email", json!({"email": "not an email"})))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .oneshot(json_request("POST", "/api/test-email", json!({"email": "qa@example.com"})))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn expiry_date_formats() {
        assert_eq!(
            parse_expiry_date(&json!("2027-01-01")).unwrap().timestamp(),
            1_798_761_600
        );
        assert_eq!(
            parse_expiry_date(&json!("2027-01-01T00:00:00+00:00")).unwrap().timestamp(),
            1_798_761_600
        );
        assert_eq!(parse_expiry_date(&json!(1_798_761_600)).unwrap().timestamp(), 1_798_761_600);
        assert!(parse_expiry_date(&json!("soon")).is_none());
        assert!(parse_expiry_date(&json!(true)).is_none());
    }

    #[test]
    fn email_plausibility() {
        assert!(is_plausible_email("a@b.co"));
        assert!(!is_plausible_email("a@b"));
        assert!(!is_plausible_email("@b.co"));
        assert!(!is_plausible_email("a b@c.co"));
        assert!(!is_plausible_email("a@@b.co"));
    }
}
