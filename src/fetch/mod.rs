pub mod render;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::recipe::{FetchMode, ProxyConfig, Recipe};

/// Transport-level failure of a page fetch
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("server returned HTTP {0}")]
    HttpStatus(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("render backend error: {0}")]
    Render(String),
}

/// Everything a single fetch needs, derived from an (override-applied)
/// recipe copy
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub mode: FetchMode,
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
    pub headers: HashMap<String, String>,
    pub proxy: Option<ProxyConfig>,
}

impl FetchPlan {
    pub fn from_recipe(recipe: &Recipe) -> Self {
        Self {
            mode: recipe.fetch_mode(),
            timeout_secs: recipe.timeout,
            user_agent: recipe.user_agent.clone(),
            headers: recipe.headers.clone(),
            proxy: if recipe.use_proxy {
                recipe.proxy_config.clone()
            } else {
                None
            },
        }
    }
}

/// Page fetch collaborator; mocked in pipeline tests
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, plan: &FetchPlan) -> Result<String, FetchError>;
}

/// Production fetcher: plain reqwest for static pages, a WebDriver
/// endpoint for rendered ones
pub struct HttpFetcher {
    webdriver_url: String,
    default_user_agent: String,
}

impl HttpFetcher {
    pub fn new(webdriver_url: &str, default_user_agent: &str) -> Self {
        Self {
            webdriver_url: webdriver_url.to_string(),
            default_user_agent: default_user_agent.to_string(),
        }
    }

    async fn fetch_static(&self, url: &str, plan: &FetchPlan) -> Result<String, FetchError> {
        let user_agent = plan
            .user_agent
            .clone()
            .unwrap_or_else(|| self.default_user_agent.clone());

        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .cookie_store(true)
            .timeout(Duration::from_secs(plan.timeout_secs));

        if let Some(proxy) = &plan.proxy {
            let proxy = reqwest::Proxy::all(proxy.to_url())
                .map_err(|e| FetchError::Network(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let response = client
            .get(url)
            .headers(build_headers(&plan.headers))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, plan.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(e, plan.timeout_secs))?;

        debug!(url, bytes = body.len(), "Fetched page statically");
        Ok(body)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, plan: &FetchPlan) -> Result<String, FetchError> {
        match plan.mode {
            FetchMode::Static => self.fetch_static(url, plan).await,
            FetchMode::Rendered => render::fetch_rendered(&self.webdriver_url, url, plan).await,
        }
    }
}

fn classify_reqwest_error(error: reqwest::Error, timeout_secs: u64) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(timeout_secs)
    } else {
        FetchError::Network(error.to_string())
    }
}

fn build_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = name.as_str(), "Skipping malformed request header"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plan(timeout_secs: u64) -> FetchPlan {
        FetchPlan {
            mode: FetchMode::Static,
            timeout_secs,
            user_agent: Some("TestAgent/1.0".to_string()),
            headers: HashMap::new(),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new("http://localhost:4444", "TestAgent/1.0");
        let body = fetcher
            .fetch(&format!("{}/article", server.uri()), &plan(5))
            .await
            .unwrap();
        assert_eq!(body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn classifies_http_status_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new("http://localhost:4444", "TestAgent/1.0");
        let err = fetcher
            .fetch(&format!("{}/missing", server.uri()), &plan(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn classifies_timeouts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new("http://localhost:4444", "TestAgent/1.0");
        let err = fetcher
            .fetch(&format!("{}/slow", server.uri()), &plan(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(1)));
    }

    #[tokio::test]
    async fn classifies_connection_failures_as_network() {
        // nothing listens on this port
        let fetcher = HttpFetcher::new("http://localhost:4444", "TestAgent/1.0");
        let err = fetcher
            .fetch("http://127.0.0.1:59999/", &plan(2))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn sends_override_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-client", "pipeline"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut custom = plan(5);
        custom
            .headers
            .insert("x-client".to_string(), "pipeline".to_string());

        let fetcher = HttpFetcher::new("http://localhost:4444", "TestAgent/1.0");
        let body = fetcher.fetch(&server.uri(), &custom).await.unwrap();
        assert_eq!(body, "ok");
    }
}
