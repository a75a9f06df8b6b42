//! # Remote API Client
//!
//! The backend operations the handlers replay, behind a trait so the engine
//! can run against a recording fake in tests.
//!
//! ## Endpoints (HttpRemoteApi)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  open_batch     POST {base}/batches               → { "id": ... }      │
//! │  create_order   POST {base}/orders                → { "id": ... }      │
//! │  close_batch    POST {base}/batches/{key}/close   → (body ignored)     │
//! │  create_refund  POST {base}/refunds               → { "id": ... }      │
//! │                                                                         │
//! │  Headers:                                                              │
//! │    Authorization: Bearer <api_token>     (when configured)             │
//! │    Idempotency-Key: <local record id>                                  │
//! │                                                                         │
//! │  A replayed command sends the same key, so the backend can answer      │
//! │  with the record it already created.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::RemoteSettings;
use cashline_core::{Batch, Order, OrderItem, PaymentMethod, Refund};

/// Header carrying the local record id.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// =============================================================================
// Errors
// =============================================================================

/// Remote call failures.
///
/// The `Display` text ends up in the command's `last_error`, so it is meant
/// for an operator to read.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection refused, reset, DNS failure...
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// Authentication rejected (401/403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend refused the request (4xx other than auth).
    #[error("rejected by backend ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend failed (5xx, 429).
    #[error("backend error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The response body could not be read.
    #[error("invalid response: {0}")]
    Decode(String),

    /// Client misconfiguration (missing base URL, bad header value...).
    #[error("client configuration: {0}")]
    Config(String),
}

impl RemoteError {
    /// Returns true if repeating the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport(_) | RemoteError::Timeout | RemoteError::Server { .. }
        )
    }

    /// Maps a non-success HTTP status and body to an error.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map(|b| b.message)
            .unwrap_or_else(|_| {
                if body.trim().is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("no message")
                        .to_string()
                } else {
                    body.trim().to_string()
                }
            });

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
            StatusCode::TOO_MANY_REQUESTS => RemoteError::Server {
                status: status.as_u16(),
                message,
            },
            s if s.is_client_error() => RemoteError::Rejected {
                status: s.as_u16(),
                message,
            },
            s => RemoteError::Server {
                status: s.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else if err.is_builder() {
            RemoteError::Config(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Error body the backend sends with a non-success status.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

// =============================================================================
// Requests / Responses
// =============================================================================

/// Identity the backend assigned to a created record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
}

/// Body of `POST /batches`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenBatchRequest {
    /// Local batch id (also the idempotency key).
    pub local_id: String,
    pub store_id: String,
    pub user_id: String,
    pub location_id: String,
    pub register_id: String,
    pub starting_cash_cents: i64,
    pub opened_at: DateTime<Utc>,
}

impl From<&Batch> for OpenBatchRequest {
    fn from(batch: &Batch) -> Self {
        OpenBatchRequest {
            local_id: batch.id.clone(),
            store_id: batch.store_id.clone(),
            user_id: batch.user_id.clone(),
            location_id: batch.location_id.clone(),
            register_id: batch.register_id.clone(),
            starting_cash_cents: batch.starting_cash_cents,
            opened_at: batch.opened_at,
        }
    }
}

/// One line of [`CreateOrderRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub line_total_cents: i64,
    pub tax_cents: i64,
}

impl From<&OrderItem> for OrderLine {
    fn from(item: &OrderItem) -> Self {
        OrderLine {
            product_id: item.product_id.clone(),
            sku: item.sku_snapshot.clone(),
            name: item.name_snapshot.clone(),
            unit_price_cents: item.unit_price_cents,
            quantity: item.quantity,
            line_total_cents: item.line_total_cents,
            tax_cents: item.tax_cents,
        }
    }
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Local order id (also the idempotency key).
    pub local_id: String,
    /// Backend key of the batch the order belongs to.
    pub batch_id: String,
    pub receipt_number: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderLine>,
}

impl CreateOrderRequest {
    pub fn new(order: &Order, items: &[OrderItem], batch_key: &str) -> Self {
        CreateOrderRequest {
            local_id: order.id.clone(),
            batch_id: batch_key.to_string(),
            receipt_number: order.receipt_number.clone(),
            subtotal_cents: order.subtotal_cents,
            tax_cents: order.tax_cents,
            discount_cents: order.discount_cents,
            total_cents: order.total_cents,
            payment_method: order.payment_method,
            created_at: order.created_at,
            items: items.iter().map(OrderLine::from).collect(),
        }
    }
}

/// Body of `POST /batches/{key}/close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseBatchRequest {
    /// Local batch id (also the idempotency key).
    pub local_id: String,
    pub closing_cash_cents: i64,
    pub closed_at: DateTime<Utc>,
}

/// Body of `POST /refunds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRefundRequest {
    /// Local refund id (also the idempotency key).
    pub local_id: String,
    /// Backend id of the refunded order.
    pub order_id: String,
    pub amount_cents: i64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CreateRefundRequest {
    pub fn new(refund: &Refund, order_remote_id: &str) -> Self {
        CreateRefundRequest {
            local_id: refund.id.clone(),
            order_id: order_remote_id.to_string(),
            amount_cents: refund.amount_cents,
            reason: refund.reason.clone(),
            created_at: refund.created_at,
        }
    }
}

// =============================================================================
// RemoteApi Trait
// =============================================================================

/// Backend operations used by the command handlers.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Opens a batch on the backend; returns its backend id.
    async fn open_batch(&self, request: &OpenBatchRequest) -> RemoteResult<RemoteRecord>;

    /// Creates an order (header and lines); returns its backend id.
    async fn create_order(&self, request: &CreateOrderRequest) -> RemoteResult<RemoteRecord>;

    /// Closes the batch addressed by `batch_key`.
    async fn close_batch(&self, batch_key: &str, request: &CloseBatchRequest) -> RemoteResult<()>;

    /// Creates a refund; returns its backend id.
    async fn create_refund(&self, request: &CreateRefundRequest) -> RemoteResult<RemoteRecord>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// [`RemoteApi`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteApi {
    /// Creates a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> RemoteResult<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RemoteError::Config(format!(
                "base URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(HttpRemoteApi {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Creates a client from the `[remote]` config section.
    pub fn from_settings(settings: &RemoteSettings) -> RemoteResult<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .ok_or_else(|| RemoteError::Config("remote.base_url is not set".into()))?;

        Self::new(
            base_url,
            settings.api_token.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    /// Returns the base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<B: Serialize + Sync>(
        &self,
        path: &str,
        idempotency_key: &str,
        body: &B,
    ) -> RemoteResult<reqwest::Response> {
        let url = self.url(path);
        debug!(%url, idempotency_key, "POST");

        let mut req = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, &text));
        }
        Ok(response)
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        idempotency_key: &str,
        body: &B,
    ) -> RemoteResult<T> {
        let response = self.send(path, idempotency_key, body).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn open_batch(&self, request: &OpenBatchRequest) -> RemoteResult<RemoteRecord> {
        self.post_json("batches", &request.local_id, request).await
    }

    async fn create_order(&self, request: &CreateOrderRequest) -> RemoteResult<RemoteRecord> {
        self.post_json("orders", &request.local_id, request).await
    }

    async fn close_batch(&self, batch_key: &str, request: &CloseBatchRequest) -> RemoteResult<()> {
        let path = format!("batches/{}/close", batch_key);
        self.send(&path, &request.local_id, request).await?;
        Ok(())
    }

    async fn create_refund(&self, request: &CreateRefundRequest) -> RemoteResult<RemoteRecord> {
        self.post_json("refunds", &request.local_id, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let api = HttpRemoteApi::new("https://api.example.com/v1/", None, Duration::from_secs(5))
            .unwrap();
        assert_eq!(api.base_url(), "https://api.example.com/v1");
        assert_eq!(api.url("orders"), "https://api.example.com/v1/orders");
        assert_eq!(
            api.url("/batches/b-1/close"),
            "https://api.example.com/v1/batches/b-1/close"
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        let err = HttpRemoteApi::new("ws://backend", None, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, RemoteError::Config(_)));

        let err = HttpRemoteApi::from_settings(&RemoteSettings::default()).unwrap_err();
        assert!(matches!(err, RemoteError::Config(_)));
    }

    #[test]
    fn test_status_mapping() {
        let err = RemoteError::from_status(StatusCode::BAD_REQUEST, r#"{"message":"bad cash"}"#);
        assert!(matches!(
            err,
            RemoteError::Rejected { status: 400, ref message } if message == "bad cash"
        ));
        assert!(!err.is_transient());

        let err = RemoteError::from_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(matches!(err, RemoteError::Server { status: 503, .. }));
        assert!(err.is_transient());

        let err = RemoteError::from_status(StatusCode::UNAUTHORIZED, "token expired");
        assert!(matches!(err, RemoteError::Unauthorized(ref m) if m == "token expired"));

        assert!(RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
    }

    #[test]
    fn test_order_request_carries_lines_and_batch_key() {
        let mut order = Order::new("b-local", "R-0001", PaymentMethod::ExternalCard);
        let items = vec![OrderItem::new(&order.id, "p-1", "COKE", "Coke", 150, 2, 25)];
        order.apply_items(&items);

        let req = CreateOrderRequest::new(&order, &items, "srv-batch-9");
        assert_eq!(req.local_id, order.id);
        assert_eq!(req.batch_id, "srv-batch-9");
        assert_eq!(req.total_cents, 325);
        assert_eq!(req.items.len(), 1);
        assert_eq!(req.items[0].sku, "COKE");

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["payment_method"], "external_card");
    }
}
