//! HTTP provider for a JSON REST control plane.
//!
//! Routes: `POST /v1/resources/{kind}` creates, `GET`, `PUT` and `DELETE` on
//! `/v1/resources/{kind}/{id}` read, update and delete. Every response body
//! describing a resource is `{ "id", "attributes", "outputs" }`.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceKind};

use super::{CloudProvider, ProviderResource, ProviderResult};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// HTTP control-plane provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token, if any.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    logical_id: &'a str,
    attributes: &'a Attributes,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    attributes: &'a Attributes,
}

impl HttpProvider {
    /// Creates a provider for `endpoint` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> ProviderResult<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        endpoint: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/v1/resources/{}", self.endpoint, kind.as_str())
    }

    fn resource_url(&self, kind: ResourceKind, provider_id: &str) -> String {
        format!("{}/{provider_id}", self.collection_url(kind))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ProviderResult<Response> {
        self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    message: e.to_string(),
                }
            } else {
                ProviderError::network(format!("Request failed: {e}"))
            }
        })
    }

    async fn parse_resource(response: Response) -> ProviderResult<ProviderResource> {
        response
            .json::<ProviderResource>()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                message: format!("Failed to parse resource: {e}"),
            })
    }
}

/// Maps a non-success response to a provider error.
async fn classify(response: Response, kind: ResourceKind, provider_id: &str) -> ProviderError {
    let status = response.status();
    let retry_after_ms = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(0, |secs| secs.saturating_mul(1000));
    let body = response.text().await.unwrap_or_default();

    classify_status(status, retry_after_ms, body, kind, provider_id)
}

fn classify_status(
    status: StatusCode,
    retry_after_ms: u64,
    body: String,
    kind: ResourceKind,
    provider_id: &str,
) -> ProviderError {
    match status.as_u16() {
        429 => ProviderError::Throttled { retry_after_ms },
        408 => ProviderError::Timeout { message: body },
        code @ (502..=504) => ProviderError::Unavailable {
            status: code,
            message: body,
        },
        404 => ProviderError::NotFound {
            kind: kind.to_string(),
            provider_id: provider_id.to_string(),
        },
        401 | 403 => ProviderError::Authentication {
            message: if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body
            },
        },
        code => ProviderError::rejected(code, body),
    }
}

#[async_trait]
impl CloudProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResource> {
        let url = self.collection_url(kind);
        debug!("POST {url} ({logical_id})");

        let response = self
            .send(self.client.post(&url).json(&CreateRequest {
                logical_id,
                attributes,
            }))
            .await?;

        if !response.status().is_success() {
            return Err(classify(response, kind, logical_id).await);
        }
        Self::parse_resource(response).await
    }

    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> ProviderResult<Option<ProviderResource>> {
        let url = self.resource_url(kind, provider_id);
        trace!("GET {url}");

        let response = self.send(self.client.get(&url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Self::parse_resource(response).await.map(Some),
            _ => Err(classify(response, kind, provider_id).await),
        }
    }

    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResource> {
        let url = self.resource_url(kind, provider_id);
        debug!("PUT {url}");

        let response = self
            .send(self.client.put(&url).json(&UpdateRequest { attributes }))
            .await?;

        if !response.status().is_success() {
            return Err(classify(response, kind, provider_id).await);
        }
        Self::parse_resource(response).await
    }

    async fn delete(&self, kind: ResourceKind, provider_id: &str) -> ProviderResult<()> {
        let url = self.resource_url(kind, provider_id);
        debug!("DELETE {url}");

        let response = self.send(self.client.delete(&url)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify(response, kind, provider_id).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn attributes(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).expect("attribute map")
    }

    #[tokio::test]
    async fn test_create_posts_to_kind_collection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources/table"))
            .and(header_eq("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"logical_id": "stats"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "tbl-42",
                "attributes": {"table_name": "stats"},
                "outputs": {"arn": "arn:table/stats", "name": "stats"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            HttpProvider::new(&server.uri(), Some(String::from("secret"))).expect("provider");
        let created = provider
            .create(ResourceKind::Table, "stats", &attributes(json!({"table_name": "stats"})))
            .await
            .expect("create");

        assert_eq!(created.provider_id, "tbl-42");
        assert_eq!(created.outputs["arn"], json!("arn:table/stats"));
    }

    #[tokio::test]
    async fn test_read_missing_resource_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/role/role-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("provider");
        let read = provider.read(ResourceKind::Role, "role-1").await.expect("read");
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_throttle_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/resources/function/fn-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("provider");
        let err = provider
            .update(ResourceKind::Function, "fn-1", &Attributes::new())
            .await
            .expect_err("throttled");
        assert_eq!(err, ProviderError::Throttled { retry_after_ms: 2000 });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/log_group/lg-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("provider");
        let err = provider
            .delete(ResourceKind::LogGroup, "lg-1")
            .await
            .expect_err("not found");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[test]
    fn test_status_classification() {
        let classify = |code: u16| {
            classify_status(
                StatusCode::from_u16(code).expect("status"),
                0,
                String::from("body"),
                ResourceKind::Policy,
                "p-1",
            )
        };

        assert!(classify(503).is_transient());
        assert!(classify(408).is_transient());
        assert!(!classify(500).is_transient());
        assert!(matches!(classify(403), ProviderError::Authentication { .. }));
        assert!(matches!(classify(409), ProviderError::Rejected { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let provider = HttpProvider::with_timeout("http://127.0.0.1:9", None, 2).expect("provider");
        let err = provider
            .read(ResourceKind::Table, "tbl-1")
            .await
            .expect_err("unreachable");
        assert!(err.is_unreachable());
    }
}
