//! Upstream academic data provider
//!
//! This module contains the client boundary to the upstream system of
//! record. Upstream data is untrusted: individual malformed items are
//! skipped with a warning and reported in the fetch outcome, never
//! allowed to abort a whole fetch.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use quadra_core::Season;

/// Errors from the upstream boundary
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Transport or status failure
    #[error("Upstream request failed: {0}")]
    RequestFailed(String),

    /// The response body was not the expected shape
    #[error("Upstream response malformed: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::RequestFailed(err.to_string())
    }
}

/// One course component as the upstream system reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamComponent {
    /// Upstream identifier, unique within a season
    pub id: String,

    /// Course code, e.g. "CS101"
    pub code: String,

    /// Human-readable title
    pub title: String,

    /// Remaining upstream fields, carried verbatim
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// A fetch result plus how many upstream items had to be skipped
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome<T> {
    /// Successfully decoded items
    pub items: T,

    /// Items dropped because they failed to decode
    pub skipped: usize,
}

/// Boundary to the upstream academic data API
#[async_trait]
pub trait UpstreamProvider: Send + Sync + std::fmt::Debug {
    /// All course components offered in a season
    async fn get_components(
        &self,
        season: &Season,
    ) -> Result<FetchOutcome<Vec<UpstreamComponent>>, UpstreamError>;

    /// Enrollment sets keyed by student id, fetched from an upstream
    /// link provided by the trigger
    async fn get_enrollments(
        &self,
        link: &str,
    ) -> Result<FetchOutcome<HashMap<String, Vec<UpstreamComponent>>>, UpstreamError>;
}

/// HTTP implementation of [`UpstreamProvider`] over reqwest
#[derive(Debug, Clone)]
pub struct HttpUpstreamProvider {
    /// Base URL of the upstream API
    base_url: String,

    /// HTTP client
    client: Client,
}

impl HttpUpstreamProvider {
    /// Create a provider for the given base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| UpstreamError::RequestFailed(format!("HTTP client init: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn components_url(&self, season: &Season) -> String {
        format!("{}/components?season={}", self.base_url, season)
    }

    /// Resolve a trigger-provided link against the base URL
    fn enrollments_url(&self, link: &str) -> String {
        if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else {
            format!("{}/{}", self.base_url, link.trim_start_matches('/'))
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, UpstreamError> {
        debug!(url, "Fetching upstream data");
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(UpstreamError::RequestFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/// Items may live at the top level or under an `items` key.
fn item_array(body: Value) -> Result<Vec<Value>, UpstreamError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(UpstreamError::MalformedResponse(
                "expected an array or an object with an `items` array".to_string(),
            )),
        },
        other => Err(UpstreamError::MalformedResponse(format!(
            "expected an array, got {}",
            value_kind(&other)
        ))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode each item individually, skipping the ones that fail
fn decode_components(items: Vec<Value>) -> FetchOutcome<Vec<UpstreamComponent>> {
    let mut outcome = FetchOutcome {
        items: Vec::with_capacity(items.len()),
        skipped: 0,
    };

    for item in items {
        match serde_json::from_value::<UpstreamComponent>(item) {
            Ok(component) => outcome.items.push(component),
            Err(e) => {
                warn!(error = %e, "Skipping malformed upstream component");
                outcome.skipped += 1;
            }
        }
    }
    outcome
}

#[async_trait]
impl UpstreamProvider for HttpUpstreamProvider {
    async fn get_components(
        &self,
        season: &Season,
    ) -> Result<FetchOutcome<Vec<UpstreamComponent>>, UpstreamError> {
        let body = self.get_json(&self.components_url(season)).await?;
        let outcome = decode_components(item_array(body)?);

        debug!(
            season = %season,
            fetched = outcome.items.len(),
            skipped = outcome.skipped,
            "Fetched upstream components"
        );
        Ok(outcome)
    }

    async fn get_enrollments(
        &self,
        link: &str,
    ) -> Result<FetchOutcome<HashMap<String, Vec<UpstreamComponent>>>, UpstreamError> {
        let body = self.get_json(&self.enrollments_url(link)).await?;

        // Shape: { "students": { "<id>": [components...] } } or the
        // map at the top level.
        let students = match body {
            Value::Object(mut map) => match map.remove("students") {
                Some(Value::Object(students)) => students,
                Some(other) => {
                    return Err(UpstreamError::MalformedResponse(format!(
                        "`students` should be an object, got {}",
                        value_kind(&other)
                    )))
                }
                None => map,
            },
            other => {
                return Err(UpstreamError::MalformedResponse(format!(
                    "expected an object, got {}",
                    value_kind(&other)
                )))
            }
        };

        let mut outcome = FetchOutcome {
            items: HashMap::new(),
            skipped: 0,
        };
        for (student_id, value) in students {
            match value {
                Value::Array(items) => {
                    let decoded = decode_components(items);
                    outcome.skipped += decoded.skipped;
                    outcome.items.insert(student_id, decoded.items);
                }
                _ => {
                    warn!(student_id, "Skipping malformed enrollment entry");
                    outcome.skipped += 1;
                }
            }
        }

        debug!(
            students = outcome.items.len(),
            skipped = outcome.skipped,
            "Fetched upstream enrollments"
        );
        Ok(outcome)
    }
}
