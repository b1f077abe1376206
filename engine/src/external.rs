//! External collaborators
//!
//! The analytics warehouse and the report text generator are opaque
//! request/response services. Calls get a deadline and exactly one retry on
//! timeout; a second timeout surfaces as [`ExternalError::ExternalServiceTimeout`].
//! Nothing here substitutes data on failure, the caller picks its own fallback.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExternalError, ExternalResult};
use crate::metrics::MetricsCollector;

pub const WAREHOUSE_SERVICE: &str = "warehouse";
pub const REPORT_SERVICE: &str = "report_generator";

/// Aggregate query sent to the analytics warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseQuery {
    pub statement: String,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub title: String,
    pub prompt: String,
}

#[async_trait]
pub trait WarehouseClient: Send + Sync {
    async fn query(&self, query: &WarehouseQuery) -> ExternalResult<WarehouseResponse>;
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, request: &ReportRequest) -> ExternalResult<String>;
}

/// Deadline and retry behaviour for external calls
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retry_on_timeout: bool,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_on_timeout: true,
        }
    }
}

impl CallPolicy {
    pub fn attempts(&self) -> u32 {
        if self.retry_on_timeout {
            2
        } else {
            1
        }
    }
}

/// Run `call` under the policy's deadline, retrying once on timeout
///
/// Only timeouts are retried; any other error is returned as-is.
pub async fn call_with_retry<T, F, Fut>(service: &str, policy: &CallPolicy, mut call: F) -> ExternalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExternalResult<T>>,
{
    let attempts = policy.attempts();
    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => return result,
            Err(_) => {
                tracing::warn!(service, attempt, timeout_ms = policy.timeout.as_millis() as u64, "External call timed out");
            }
        }
    }

    Err(ExternalError::ExternalServiceTimeout {
        service: service.to_string(),
        attempts,
    })
}

/// Configured collaborators plus the shared call policy
pub struct ExternalServices {
    warehouse: Option<Arc<dyn WarehouseClient>>,
    reports: Option<Arc<dyn ReportGenerator>>,
    policy: CallPolicy,
    metrics: Arc<MetricsCollector>,
}

impl ExternalServices {
    pub fn new(policy: CallPolicy, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            warehouse: None,
            reports: None,
            policy,
            metrics,
        }
    }

    pub fn with_warehouse(mut self, client: Arc<dyn WarehouseClient>) -> Self {
        self.warehouse = Some(client);
        self
    }

    pub fn with_report_generator(mut self, generator: Arc<dyn ReportGenerator>) -> Self {
        self.reports = Some(generator);
        self
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    pub async fn query_warehouse(&self, query: &WarehouseQuery) -> ExternalResult<WarehouseResponse> {
        let client = self.warehouse.as_ref().ok_or_else(|| not_configured(WAREHOUSE_SERVICE))?;
        let result = call_with_retry(WAREHOUSE_SERVICE, &self.policy, || client.query(query)).await;
        self.observe(result)
    }

    pub async fn generate_report(&self, request: &ReportRequest) -> ExternalResult<String> {
        let generator = self.reports.as_ref().ok_or_else(|| not_configured(REPORT_SERVICE))?;
        let result = call_with_retry(REPORT_SERVICE, &self.policy, || generator.generate(request)).await;
        self.observe(result)
    }

    fn observe<T>(&self, result: ExternalResult<T>) -> ExternalResult<T> {
        if let Err(ExternalError::ExternalServiceTimeout { .. }) = &result {
            self.metrics.record_external_timeout();
        }
        result
    }
}

fn not_configured(service: &str) -> ExternalError {
    ExternalError::RequestFailed {
        service: service.to_string(),
        reason: "service not configured".to_string(),
    }
}

#[cfg(feature = "warehouse-http")]
pub use http::HttpWarehouseClient;

#[cfg(feature = "warehouse-http")]
mod http {
    use super::*;
    use reqwest::Client;

    #[derive(Debug, Deserialize)]
    struct ApiResponse<T> {
        success: bool,
        data: Option<T>,
        error: Option<String>,
    }

    /// Warehouse client speaking JSON over HTTP (`POST {base_url}/query`)
    #[derive(Clone)]
    pub struct HttpWarehouseClient {
        client: Client,
        base_url: String,
    }

    impl HttpWarehouseClient {
        pub fn new(base_url: impl Into<String>) -> ExternalResult<Self> {
            let client = Client::builder().build().map_err(|e| request_failed(e.to_string()))?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }
    }

    fn request_failed(reason: String) -> ExternalError {
        ExternalError::RequestFailed {
            service: WAREHOUSE_SERVICE.to_string(),
            reason,
        }
    }

    #[async_trait]
    impl WarehouseClient for HttpWarehouseClient {
        async fn query(&self, query: &WarehouseQuery) -> ExternalResult<WarehouseResponse> {
            let response = self
                .client
                .post(format!("{}/query", self.base_url))
                .json(query)
                .send()
                .await
                .map_err(|e| request_failed(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(request_failed(format!("HTTP {}", status)));
            }

            let body: ApiResponse<WarehouseResponse> =
                response.json().await.map_err(|e| request_failed(e.to_string()))?;
            match (body.success, body.data) {
                (true, Some(data)) => Ok(data),
                _ => Err(request_failed(body.error.unwrap_or_else(|| "empty response".to_string()))),
            }
        }
    }
}
