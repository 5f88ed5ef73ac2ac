// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Solr update client and the [`DataProcessor`] shipping batches through it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use tracing::{debug, error};

use crate::errors::SolrError;
use crate::processor::DataProcessor;
use crate::record::Record;

pub const DEFAULT_CONTEXT: &str = "/solr";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolrConfig {
    /// Base URL of the Solr server, e.g. `http://localhost:8983`.
    pub url: String,
    /// Path Solr is served under.
    pub context: String,
    pub collection: String,
    /// Ask Solr to commit each update.
    pub commit: bool,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

impl Default for SolrConfig {
    fn default() -> Self {
        SolrConfig {
            url: String::new(),
            context: DEFAULT_CONTEXT.to_string(),
            collection: String::new(),
            commit: true,
            timeout: DEFAULT_TIMEOUT,
            https_proxy: None,
        }
    }
}

impl SolrConfig {
    pub fn update_url(&self) -> String {
        let url = self.url.trim_end_matches('/');
        let context = self.context.trim_matches('/');
        let collection = self.collection.trim_matches('/');
        let mut update_url = if context.is_empty() {
            format!("{url}/{collection}/update")
        } else {
            format!("{url}/{context}/{collection}/update")
        };
        if self.commit {
            update_url.push_str("?commit=true");
        }
        update_url
    }
}

/// Posts JSON documents to a collection's update handler.
#[derive(Debug, Clone)]
pub struct SolrClient {
    client: reqwest::Client,
    update_url: String,
}

impl SolrClient {
    pub fn new(config: &SolrConfig) -> Result<Self, SolrError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy).map_err(SolrError::Client)?);
        }
        let client = builder.build().map_err(SolrError::Client)?;

        Ok(SolrClient {
            client,
            update_url: config.update_url(),
        })
    }

    pub fn update_url(&self) -> &str {
        &self.update_url
    }

    /// Indexes `documents`. Any non-2xx answer is an error.
    pub async fn update(&self, documents: &[Record]) -> Result<(), SolrError> {
        let body = serde_json::to_vec(documents)?;
        let response = self.client.post(&self.update_url).body(body).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SolrError::Status { status, body })
    }
}

/// Ships batches to Solr and logs the ones that had to be dropped.
#[derive(Debug, Clone)]
pub struct SolrDataProcessor {
    client: SolrClient,
}

impl SolrDataProcessor {
    pub fn new(client: SolrClient) -> Self {
        SolrDataProcessor { client }
    }
}

#[async_trait]
impl DataProcessor for SolrDataProcessor {
    type Error = SolrError;

    async fn process(&self, batch: &[Record]) -> Result<(), SolrError> {
        debug!("Sending {} documents to {}", batch.len(), self.client.update_url());
        self.client.update(batch).await
    }

    async fn handle_error(&self, batch: &[Record], error: SolrError) {
        error!(
            "Dropped batch of {} documents for {}: {error}",
            batch.len(),
            self.client.update_url()
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::collections::HashMap;
    use tracing_test::traced_test;

    fn config(url: String) -> SolrConfig {
        SolrConfig {
            url,
            collection: "logs".to_string(),
            ..SolrConfig::default()
        }
    }

    fn record(msg: &str) -> Record {
        Record::new(HashMap::from([
            ("id".to_string(), "1".to_string()),
            ("msg".to_string(), msg.to_string()),
        ]))
    }

    #[test]
    fn test_update_url() {
        let config = config("http://localhost:8983".to_string());
        assert_eq!(
            config.update_url(),
            "http://localhost:8983/solr/logs/update?commit=true"
        );
    }

    #[test]
    fn test_update_url_without_context_or_commit() {
        let config = SolrConfig {
            context: String::new(),
            commit: false,
            ..config("http://localhost:8983/".to_string())
        };
        assert_eq!(config.update_url(), "http://localhost:8983/logs/update");
    }

    #[test]
    fn test_update_url_custom_context() {
        let config = SolrConfig {
            context: "search/".to_string(),
            ..config("http://solr:8983".to_string())
        };
        assert_eq!(
            config.update_url(),
            "http://solr:8983/search/logs/update?commit=true"
        );
    }

    #[tokio::test]
    async fn test_update_posts_json_documents() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/solr/logs/update")
            .match_query(Matcher::UrlEncoded("commit".into(), "true".into()))
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::Json(serde_json::json!([
                {"id": "1", "msg": "hello"}
            ])))
            .with_status(200)
            .with_body(r#"{"responseHeader":{"status":0}}"#)
            .create_async()
            .await;

        let client = SolrClient::new(&config(server.url())).unwrap();
        client.update(&[record("hello")]).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_reports_error_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/solr/logs/update")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let client = SolrClient::new(&config(server.url())).unwrap();
        let error = client.update(&[record("hello")]).await.unwrap_err();

        match error {
            SolrError::Status { status, body } => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_handle_error_logs_dropped_batch() {
        let client = SolrClient::new(&config("http://localhost:8983".to_string())).unwrap();
        let processor = SolrDataProcessor::new(client);

        processor
            .handle_error(
                &[record("a"), record("b")],
                SolrError::Status {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: String::new(),
                },
            )
            .await;

        assert!(logs_contain("Dropped batch of 2 documents"));
    }
}
