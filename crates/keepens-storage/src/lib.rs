//! JSON-over-HTTP transport + subscription persistence for KeepENS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepens_core::{normalize_address, ExpiringSubscription, SubscriptionRecord, UserRecord};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "keepens-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_target_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 32,
            per_target_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

/// Shared HTTP handle used by every adapter. Bounded by a global semaphore
/// plus one semaphore per logical target (an indexer, an RPC node, ...).
#[derive(Debug)]
pub struct JsonHttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_target_limit: usize,
    per_target: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl JsonHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_target_limit: config.per_target_concurrency.max(1),
            per_target: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_target_semaphore(&self, target: &str) -> Arc<Semaphore> {
        let mut map = self.per_target.lock().await;
        map.entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_target_limit)))
            .clone()
    }

    pub async fn post_json<B>(
        &self,
        target: &str,
        url: &str,
        body: &B,
        headers: &[(&str, String)],
    ) -> Result<JsonValue, FetchError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let span = info_span!("http_post_json", target, url);
        let _permits = self.acquire(target).await?;
        self.send_with_retry(|| {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            request
        })
        .instrument(span)
        .await
    }

    pub async fn get_json(
        &self,
        target: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_get_json", target, url);
        let _permits = self.acquire(target).await?;
        self.send_with_retry(|| {
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            request
        })
        .instrument(span)
        .await
    }

    async fn acquire(
        &self,
        target: &str,
    ) -> Result<(tokio::sync::OwnedSemaphorePermit, tokio::sync::OwnedSemaphorePermit), FetchError>
    {
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_target = self
            .per_target_semaphore(target)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        Ok((global, per_target))
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<JsonValue, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                            url: final_url,
                            source,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no subscription to {ens_name} for user {user_id}")]
    SubscriptionNotFound { user_id: Uuid, ens_name: String },
    #[error("no subscription with id {0}")]
    UnknownSubscription(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Persistence of users and their per-name expiry subscriptions, keyed by
/// `(wallet_address, ens_name)`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Wallet addresses are stored lowercased. A provided email or fid
    /// overwrites the stored one; `None` keeps it.
    async fn find_or_create_user(
        &self,
        wallet_address: &str,
        email: Option<&str>,
        fid: Option<&str>,
    ) -> Result<UserRecord, StoreError>;

    /// Upsert; re-subscribing resets the notified flag.
    async fn subscribe(
        &self,
        user_id: Uuid,
        ens_name: &str,
        expiry_date: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError>;

    async fn unsubscribe(&self, user_id: Uuid, ens_name: &str) -> Result<(), StoreError>;

    async fn list_subscriptions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SubscriptionRecord>, StoreError>;

    /// Not-yet-notified subscriptions expiring at or before `threshold`,
    /// soonest first.
    async fn expiring_subscriptions(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<ExpiringSubscription>, StoreError>;

    async fn mark_notified(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

#[derive(Debug, Default)]
struct MemoryState {
    users: Vec<UserRecord>,
    subscriptions: Vec<SubscriptionRecord>,
}

/// Process-local store used when no database is configured.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    state: Mutex<MemoryState>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_or_create_user(
        &self,
        wallet_address: &str,
        email: Option<&str>,
        fid: Option<&str>,
    ) -> Result<UserRecord, StoreError> {
        let wallet_address = normalize_address(wallet_address);
        let email = non_empty(email);
        let fid = non_empty(fid);
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(user) = state
            .users
            .iter_mut()
            .find(|u| u.wallet_address == wallet_address)
        {
            if email.is_some() || fid.is_some() {
                if email.is_some() {
                    user.email = email;
                }
                if fid.is_some() {
                    user.fid = fid;
                }
                user.updated_at = now;
            }
            return Ok(user.clone());
        }

        let user = UserRecord {
            id: Uuid::new_v4(),
            wallet_address,
            email,
            fid,
            created_at: now,
            updated_at: now,
        };
        state.users.push(user.clone());
        Ok(user)
    }

    async fn subscribe(
        &self,
        user_id: Uuid,
        ens_name: &str,
        expiry_date: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.user_id == user_id && s.ens_name == ens_name)
        {
            existing.expiry_date = expiry_date;
            existing.notified = false;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id,
            ens_name: ens_name.to_string(),
            expiry_date,
            notified: false,
            last_notified_at: None,
            created_at: now,
            updated_at: now,
        };
        state.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn unsubscribe(&self, user_id: Uuid, ens_name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| !(s.user_id == user_id && s.ens_name == ens_name));
        if state.subscriptions.len() == before {
            return Err(StoreError::SubscriptionNotFound {
                user_id,
                ens_name: ens_name.to_string(),
            });
        }
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records = state
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(|s| s.expiry_date);
        Ok(records)
    }

    async fn expiring_subscriptions(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<ExpiringSubscription>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .subscriptions
            .iter()
            .filter(|s| !s.notified && s.expiry_date <= threshold)
            .filter_map(|s| {
                state
                    .users
                    .iter()
                    .find(|u| u.id == s.user_id)
                    .map(|user| ExpiringSubscription {
                        subscription: s.clone(),
                        user: user.clone(),
                    })
            })
            .collect::<Vec<_>>();
        out.sort_by_key(|e| e.subscription.expiry_date);
        Ok(out)
    }

    async fn mark_notified(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or(StoreError::UnknownSubscription(subscription_id))?;
        record.notified = true;
        record.last_notified_at = Some(at);
        record.updated_at = at;
        Ok(())
    }
}

/// Postgres-backed store; schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow, prefix: &str) -> Result<UserRecord, sqlx::Error> {
    Ok(UserRecord {
        id: row.try_get(format!("{prefix}id").as_str())?,
        wallet_address: row.try_get(format!("{prefix}wallet_address").as_str())?,
        email: row.try_get(format!("{prefix}email").as_str())?,
        fid: row.try_get(format!("{prefix}fid").as_str())?,
        created_at: row.try_get(format!("{prefix}created_at").as_str())?,
        updated_at: row.try_get(format!("{prefix}updated_at").as_str())?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<SubscriptionRecord, sqlx::Error> {
    Ok(SubscriptionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        ens_name: row.try_get("ens_name")?,
        expiry_date: row.try_get("expiry_date")?,
        notified: row.try_get("notified")?,
        last_notified_at: row.try_get("last_notified_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_or_create_user(
        &self,
        wallet_address: &str,
        email: Option<&str>,
        fid: Option<&str>,
    ) -> Result<UserRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, wallet_address, email, fid)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (wallet_address) DO UPDATE
               SET email = COALESCE(EXCLUDED.email, users.email),
                   fid = COALESCE(EXCLUDED.fid, users.fid),
                   updated_at = CASE
                       WHEN EXCLUDED.email IS NULL AND EXCLUDED.fid IS NULL THEN users.updated_at
                       ELSE NOW()
                   END
            RETURNING id, wallet_address, email, fid, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(normalize_address(wallet_address))
        .bind(non_empty(email))
        .bind(non_empty(fid))
        .fetch_one(&self.pool)
        .await?;
        Ok(user_from_row(&row, "")?)
    }

    async fn subscribe(
        &self,
        user_id: Uuid,
        ens_name: &str,
        expiry_date: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ens_records (id, user_id, ens_name, expiry_date)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, ens_name) DO UPDATE
               SET expiry_date = EXCLUDED.expiry_date,
                   notified = FALSE,
                   updated_at = NOW()
            RETURNING id, user_id, ens_name, expiry_date, notified, last_notified_at,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(ens_name)
        .bind(expiry_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(subscription_from_row(&row)?)
    }

    async fn unsubscribe(&self, user_id: Uuid, ens_name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM ens_records WHERE user_id = $1 AND ens_name = $2")
            .bind(user_id)
            .bind(ens_name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SubscriptionNotFound {
                user_id,
                ens_name: ens_name.to_string(),
            });
        }
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, ens_name, expiry_date, notified, last_notified_at,
                   created_at, updated_at
              FROM ens_records
             WHERE user_id = $1
             ORDER BY expiry_date ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(subscription_from_row(row)?);
        }
        Ok(out)
    }

    async fn expiring_subscriptions(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<ExpiringSubscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.user_id, r.ens_name, r.expiry_date, r.notified, r.last_notified_at,
                   r.created_at, r.updated_at,
                   u.id AS u_id, u.wallet_address AS u_wallet_address, u.email AS u_email,
                   u.fid AS u_fid, u.created_at AS u_created_at, u.updated_at AS u_updated_at
              FROM ens_records r
              JOIN users u ON u.id = r.user_id
             WHERE r.notified = FALSE
               AND r.expiry_date <= $1
             ORDER BY r.expiry_date ASC
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(ExpiringSubscription {
                subscription: subscription_from_row(row)?,
                user: user_from_row(row, "u_")?,
            });
        }
        Ok(out)
    }

    async fn mark_notified(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ens_records
               SET notified = TRUE,
                   last_notified_at = $2,
                   updated_at = $2
             WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownSubscription(subscription_id));
        }
        Ok(())
    }
}
