//! Backend Invocation Seam: the opaque `invoke(model, prompt) → text` call
//! the dispatcher performs against whichever external LLM API backs a given
//! agent. The concrete clients are out of scope; this module is
//! the trait and circuit breaker they plug into.

pub mod circuit_breaker;

use crate::{CoreError, Result};
use async_trait::async_trait;
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use std::time::Duration;
use tracing::warn;

/// A backend that can turn `(model, prompt)` into generated text. Exactly
/// one implementation ships here (`HttpBackendClient`); production
/// deployments plug in their own.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String>;
}

/// Wraps any `BackendClient` with the circuit breaker, so a failing backend
/// stops being hammered regardless of which concrete client is plugged in.
pub struct GuardedBackendClient<C: BackendClient> {
    inner: C,
    breaker: CircuitBreaker,
}

impl<C: BackendClient> GuardedBackendClient<C> {
    pub fn new(inner: C, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }
}

#[async_trait]
impl<C: BackendClient> BackendClient for GuardedBackendClient<C> {
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String> {
        if !self.breaker.should_allow_request().await {
            warn!(model, "backend call rejected, circuit open");
            return Err(CoreError::Fatal(format!("circuit open for backend {model}")));
        }

        match self.inner.invoke(model, prompt).await {
            Ok(text) => {
                self.breaker.record_success().await;
                Ok(text)
            }
            Err(e) => {
                self.breaker.record_failure().await;
                Err(e)
            }
        }
    }
}

/// Default `BackendClient` implementation: a generic HTTP POST to a
/// configured endpoint, expecting a JSON body `{model, prompt}` and a JSON
/// response `{text}`.
pub struct HttpBackendClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBackendClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CoreError::Backend)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[derive(serde::Serialize)]
struct InvokeRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(serde::Deserialize)]
struct InvokeResponse {
    text: String,
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&InvokeRequest { model, prompt })
            .send()
            .await?
            .error_for_status()?
            .json::<InvokeResponse>()
            .await?;
        Ok(response.text)
    }
}
