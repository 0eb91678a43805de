//! Producers hand harvested payloads to the orchestrator. Credentials are
//! resolved before a producer runs; producers never manage auth lifecycles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use yuru_core::{Harvest, Source};
use yuru_storage::HttpFetcher;

use crate::vendor::unwrap_vendor_response;
use crate::{read_json_file, AdapterError, ProducerContext};

#[async_trait]
pub trait SourceProducer: Send + Sync {
    fn source(&self) -> Source;
    fn category(&self) -> &str;

    /// `source/category`, used in logs and run summaries.
    fn label(&self) -> String {
        format!("{}/{}", self.source(), self.category())
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn produce(&self, ctx: &ProducerContext) -> Result<Vec<Harvest>, AdapterError>;
}

pub trait CredentialProvider: Send + Sync {
    fn credential(&self, name: &str) -> Option<String>;
}

/// Reads credentials from process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credential(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// A vendor response captured to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCapture {
    pub source: Source,
    pub category: String,
    pub captured_at: DateTime<Utc>,
    pub response: JsonValue,
}

#[derive(Debug, Clone)]
pub struct FixtureProducer {
    source: Source,
    category: String,
    path: PathBuf,
}

impl FixtureProducer {
    pub fn new(source: Source, category: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            category: category.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<FixtureCapture> {
        read_json_file(&self.path)
    }
}

#[async_trait]
impl SourceProducer for FixtureProducer {
    fn source(&self) -> Source {
        self.source
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn is_available(&self) -> bool {
        self.path.is_file()
    }

    async fn produce(&self, ctx: &ProducerContext) -> Result<Vec<Harvest>, AdapterError> {
        let capture = self.load()?;
        if capture.source != self.source {
            return Err(AdapterError::Message(format!(
                "fixture {} was captured from {}, expected {}",
                self.path.display(),
                capture.source,
                self.source
            )));
        }
        unwrap_vendor_response(ctx, self.source, &self.category, &capture.response)
    }
}

/// GETs a vendor JSON endpoint. `{start_date}` and `{end_date}` in the URL are
/// replaced with the canonical polling window.
pub struct HttpJsonProducer {
    source: Source,
    category: String,
    url_template: String,
    credential_name: Option<String>,
    credentials: Arc<dyn CredentialProvider>,
    http: Arc<HttpFetcher>,
}

impl HttpJsonProducer {
    pub fn new(
        source: Source,
        category: impl Into<String>,
        url_template: impl Into<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source,
            category: category.into(),
            url_template: url_template.into(),
            credential_name: None,
            credentials: Arc::new(EnvCredentials),
            http,
        }
    }

    pub fn with_credential(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        self.credential_name = Some(name.into());
        self.credentials = provider;
        self
    }

    pub fn render_url(&self, ctx: &ProducerContext) -> String {
        let (start, end) = ctx.window();
        self.url_template
            .replace("{start_date}", &start.format("%Y-%m-%d").to_string())
            .replace("{end_date}", &end.format("%Y-%m-%d").to_string())
    }

    fn bearer(&self) -> Result<Option<String>, AdapterError> {
        let Some(name) = &self.credential_name else {
            return Ok(None);
        };
        match self.credentials.credential(name) {
            Some(token) => Ok(Some(token)),
            None => Err(AdapterError::Unavailable {
                source_tag: self.source,
                reason: format!("credential {name} is not set"),
            }),
        }
    }
}

#[async_trait]
impl SourceProducer for HttpJsonProducer {
    fn source(&self) -> Source {
        self.source
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn is_available(&self) -> bool {
        self.bearer().is_ok()
    }

    async fn produce(&self, ctx: &ProducerContext) -> Result<Vec<Harvest>, AdapterError> {
        let bearer = self.bearer()?;
        let url = self.render_url(ctx);
        let raw = self
            .http
            .get_json(&self.label(), &url, bearer.as_deref())
            .await?;
        unwrap_vendor_response(ctx, self.source, &self.category, &raw)
    }
}
