//! HTTP client for the master API.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::Config;
use crate::error::CliError;

/// Header carrying the requester name on submissions.
const REQUESTER_HEADER: &str = "x-gantry-requester";

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &Config, requester: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(requester) = requester {
            headers.insert(
                REQUESTER_HEADER,
                HeaderValue::from_str(requester).context("Invalid requester name")?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.master_url().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.get(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        self.handle_response(response).await
    }

    /// PUT with no body, expecting no content back.
    pub async fn put_empty(&self, path: &str) -> Result<(), CliError> {
        let response = self.client.put(self.url(path)).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            self.handle_error(response).await
        }
    }

    /// Open a server-sent event stream and return the raw response.
    pub async fn get_event_stream(&self, path: &str) -> Result<reqwest::Response, CliError> {
        let response = self
            .client
            .get(self.url(path))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            self.handle_error(response).await
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)))
        } else {
            self.handle_error(response).await
        }
    }

    async fn handle_error<T>(&self, response: reqwest::Response) -> Result<T, CliError> {
        let status = response.status().as_u16();

        let problem: Problem = response.json().await.unwrap_or_else(|_| Problem {
            code: "unknown".to_string(),
            detail: "Unknown error".to_string(),
            request_id: None,
        });

        Err(CliError::api(status, problem.code, problem.detail, problem.request_id))
    }
}

/// Problem document returned on errors.
#[derive(Debug, Deserialize)]
struct Problem {
    code: String,
    detail: String,
    #[serde(default)]
    request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let config = Config {
            master_url: "http://master:8080/".to_string(),
            requester: None,
        };
        let client = ApiClient::new(&config, Some("ana")).unwrap();
        assert_eq!(client.url("/v1/pools"), "http://master:8080/v1/pools");
    }

    #[test]
    fn test_problem_parses_master_errors() {
        let body = r#"{
            "type": "https://gantry.dev/problems/queue_full",
            "title": "Too Many Requests",
            "status": 429,
            "detail": "pool compute has 1000 pending requests",
            "code": "queue_full",
            "request_id": "req_1",
            "retryable": true
        }"#;
        let problem: Problem = serde_json::from_str(body).unwrap();
        assert_eq!(problem.code, "queue_full");
        assert_eq!(problem.request_id.as_deref(), Some("req_1"));
    }
}
