//! HTTP fetch boundary.
//!
//! The crawler talks to the network through the `Fetcher` capability
//! trait; `ReqwestFetcher` is the real implementation and test doubles
//! slot in behind the same trait.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::error::CrawlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
}

/// One outbound request, fully materialized (headers come from the
/// profile's fingerprint plus caller extras).
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub total_timeout: Duration,
}

/// A completed response. Immutable once returned.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub elapsed: Duration,
    pub bytes: usize,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Capability interface for issuing HTTP requests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CrawlError>;
}

/// Production fetcher over reqwest with rustls, bounded redirects, and an
/// independent connect timeout. The per-request total timeout comes from
/// the `FetchRequest`.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CrawlError> {
        let started = Instant::now();

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Head => self.client.head(&request.url),
        };
        builder = builder.timeout(request.total_timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.total_timeout))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, request.total_timeout))?;

        Ok(FetchResponse {
            url: request.url.clone(),
            final_url,
            status,
            bytes: body.len(),
            body,
            headers,
            elapsed: started.elapsed(),
        })
    }
}

fn map_reqwest_error(error: reqwest::Error, total_timeout: Duration) -> CrawlError {
    if error.is_timeout() {
        CrawlError::Timeout(total_timeout)
    } else if error.is_connect() {
        CrawlError::Network(format!("connect failed: {error}"))
    } else if error.is_decode() || error.is_body() {
        CrawlError::Protocol(error.to_string())
    } else if error.is_builder() {
        CrawlError::InvalidUrl(error.to_string())
    } else {
        CrawlError::Network(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String) -> FetchRequest {
        FetchRequest {
            url,
            method: HttpMethod::Get,
            headers: vec![("User-Agent".to_string(), "wraith-test".to_string())],
            total_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn fetch_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("User-Agent", "wraith-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body>ok</body></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let fetcher = ReqwestFetcher::new(Duration::from_secs(2));
        let response = fetcher
            .fetch(&request(format!("{}/page", server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.bytes, response.body.len());
        assert!(response.body.contains("ok"));
        assert_eq!(response.header("content-type"), Some("text/html"));
    }

    #[tokio::test]
    async fn connection_refused_maps_to_network_error() {
        let fetcher = ReqwestFetcher::new(Duration::from_millis(500));
        // Port 9 (discard) is a safe dead endpoint.
        let err = fetcher
            .fetch(&request("http://127.0.0.1:9/".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CrawlError::Network(_) | CrawlError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn slow_response_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let mut req = request(server.uri());
        req.total_timeout = Duration::from_millis(200);

        let fetcher = ReqwestFetcher::new(Duration::from_secs(2));
        let err = fetcher.fetch(&req).await.unwrap_err();
        assert!(matches!(err, CrawlError::Timeout(_)));
    }
}
