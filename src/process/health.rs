//! Health check functionality for the worker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

/// Response structure for the worker's health endpoint. Descriptive fields
/// are surfaced verbatim and may be missing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub fp16_enabled: Option<bool>,
    #[serde(default)]
    pub available_prompts: Option<u64>,
    #[serde(default)]
    pub available_emotions: Option<u64>,
    #[serde(default)]
    pub cache_size: Option<u64>,
}

impl HealthSnapshot {
    pub fn health_status(&self) -> HealthStatus {
        if self.status == "healthy" {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Outcome of one health fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthReport {
    Reachable(HealthSnapshot),
    Unreachable(String),
}

impl HealthReport {
    pub fn status(&self) -> HealthStatus {
        match self {
            Self::Reachable(snapshot) => snapshot.health_status(),
            Self::Unreachable(_) => HealthStatus::Unreachable,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }
}

/// Fetches worker health. Failures are values, never errors.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn fetch_health(&self) -> HealthReport;

    /// Supplementary load counters; `None` when unavailable.
    async fn fetch_concurrency(&self) -> Option<serde_json::Map<String, serde_json::Value>>;
}

/// [`HealthProbe`] over HTTP.
pub struct HttpHealthProbe {
    client: Client,
    health_url: String,
    concurrency_url: String,
}

impl HttpHealthProbe {
    pub fn new(health_url: String, concurrency_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            health_url,
            concurrency_url,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::health_unreachable(url, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::health_unreachable(url, resp.status().to_string()));
        }
        resp.json::<T>()
            .await
            .map_err(|e| AppError::health_unreachable(url, format!("invalid payload: {}", e)))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn fetch_health(&self) -> HealthReport {
        match self.get_json::<HealthSnapshot>(&self.health_url).await {
            Ok(snapshot) => HealthReport::Reachable(snapshot),
            Err(e) => {
                log::debug!("Health check failed: {}", e);
                HealthReport::Unreachable(e.to_string())
            }
        }
    }

    async fn fetch_concurrency(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        match self
            .get_json::<serde_json::Value>(&self.concurrency_url)
            .await
        {
            Ok(serde_json::Value::Object(map)) => Some(map),
            Ok(_) => None,
            Err(e) => {
                log::debug!("Concurrency stats unavailable: {}", e);
                None
            }
        }
    }
}
