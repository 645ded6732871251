use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{domain_of, ExtractionRule, MediaRules, PostProcess, Recipe, SelectorKind};

/// Logical fields the analyzer is asked to locate on a page
pub const LOGICAL_FIELDS: [&str; 6] = [
    "title",
    "content",
    "author",
    "publishDate",
    "language",
    "categories",
];

/// Media categories the analyzer is asked to locate
pub const MEDIA_CATEGORIES: [&str; 3] = ["images", "videos", "embeds"];

/// Failure of the external page-analysis capability
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("page analysis request failed: {0}")]
    Request(String),

    #[error("analyzer rejected the page: {0}")]
    Rejected(String),

    #[error("analyzer response is incomplete: {0}")]
    Incomplete(String),

    #[error("url has no host to key a recipe on: {0}")]
    InvalidUrl(String),
}

/// Rule as the analyzer reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedRule {
    pub selector: String,
    #[serde(default)]
    pub selector_type: Option<SelectorKind>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub post_process: Option<PostProcess>,
}

/// Structured response of the page-analysis capability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    #[serde(default)]
    pub fields: HashMap<String, AnalyzedRule>,
    pub images: Option<AnalyzedRule>,
    pub videos: Option<AnalyzedRule>,
    pub embeds: Option<AnalyzedRule>,
    #[serde(default)]
    pub requires_javascript: bool,
}

/// External page-analysis collaborator; mocked in pipeline tests
#[async_trait]
pub trait PageAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        url: &str,
        fields: &[&str],
        media: &[&str],
    ) -> Result<AnalyzeResponse, AnalysisError>;
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    url: &'a str,
    fields: &'a [&'a str],
    media: &'a [&'a str],
}

/// HTTP client for the analysis service
pub struct HttpAnalyzer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl PageAnalyzer for HttpAnalyzer {
    async fn analyze(
        &self,
        url: &str,
        fields: &[&str],
        media: &[&str],
    ) -> Result<AnalyzeResponse, AnalysisError> {
        let request = AnalyzeRequest { url, fields, media };

        debug!(url, "Sending page to analysis service");

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AnalysisError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Rejected(format!("HTTP {}", status.as_u16())));
        }

        response
            .json::<AnalyzeResponse>()
            .await
            .map_err(|e| AnalysisError::Request(format!("unreadable response: {}", e)))
    }
}

/// Builds fresh recipes by invoking the analyzer and converting its
/// response into the recipe schema. Conversion is all-or-nothing: a
/// response missing a media category never becomes a stored recipe.
pub struct RecipeGenerator {
    analyzer: Arc<dyn PageAnalyzer>,
    default_timeout: u64,
    default_retry_count: u32,
}

impl RecipeGenerator {
    pub fn new(analyzer: Arc<dyn PageAnalyzer>, default_timeout: u64, default_retry_count: u32) -> Self {
        Self {
            analyzer,
            default_timeout,
            default_retry_count,
        }
    }

    /// Analyze the page behind `url` and convert the result into a
    /// recipe for its domain. Always analyzes from a clean fetch; no
    /// prior recipe's selectors are consulted.
    pub async fn generate(&self, url: &str) -> Result<Recipe, AnalysisError> {
        let domain =
            domain_of(url).ok_or_else(|| AnalysisError::InvalidUrl(url.to_string()))?;

        info!(domain = domain.as_str(), "Generating recipe");

        let response = self
            .analyzer
            .analyze(url, &LOGICAL_FIELDS, &MEDIA_CATEGORIES)
            .await?;

        self.convert(&domain, response)
    }

    fn convert(&self, domain: &str, response: AnalyzeResponse) -> Result<Recipe, AnalysisError> {
        let mut extraction_rules = HashMap::new();
        for (field, rule) in response.fields {
            if !LOGICAL_FIELDS.contains(&field.as_str()) {
                debug!(field = field.as_str(), "Analyzer proposed an unknown field, skipping");
                continue;
            }
            if rule.selector.trim().is_empty() {
                debug!(field = field.as_str(), "Analyzer proposed an empty selector, skipping");
                continue;
            }
            extraction_rules.insert(field, convert_rule(rule, None));
        }

        let media_rules = MediaRules {
            images: media_rule("images", response.images)?,
            videos: media_rule("videos", response.videos)?,
            embeds: media_rule("embeds", response.embeds)?,
        };

        let mut recipe = Recipe {
            domain: domain.to_string(),
            use_headless: response.requires_javascript,
            use_proxy: false,
            timeout: self.default_timeout,
            user_agent: None,
            proxy_config: None,
            retry_count: self.default_retry_count,
            extraction_rules,
            media_rules,
            headers: HashMap::new(),
        };
        recipe.clamp_tunables();
        recipe
            .validate()
            .map_err(AnalysisError::Incomplete)?;

        Ok(recipe)
    }
}

fn convert_rule(rule: AnalyzedRule, default_attribute: Option<&str>) -> ExtractionRule {
    ExtractionRule {
        selector: rule.selector,
        selector_type: rule.selector_type.unwrap_or(SelectorKind::Css),
        attribute: rule
            .attribute
            .or_else(|| default_attribute.map(|a| a.to_string())),
        post_process: rule.post_process,
    }
}

fn media_rule(
    category: &str,
    rule: Option<AnalyzedRule>,
) -> Result<ExtractionRule, AnalysisError> {
    let rule = rule.ok_or_else(|| {
        AnalysisError::Incomplete(format!("missing media rule for {}", category))
    })?;
    if rule.selector.trim().is_empty() {
        return Err(AnalysisError::Incomplete(format!(
            "empty selector for media category {}",
            category
        )));
    }
    // media urls live in src attributes unless the analyzer says otherwise
    Ok(convert_rule(rule, Some("src")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAnalyzer {
        response: AnalyzeResponse,
    }

    #[async_trait]
    impl PageAnalyzer for FixedAnalyzer {
        async fn analyze(
            &self,
            _url: &str,
            _fields: &[&str],
            _media: &[&str],
        ) -> Result<AnalyzeResponse, AnalysisError> {
            Ok(self.response.clone())
        }
    }

    fn rule(selector: &str) -> AnalyzedRule {
        AnalyzedRule {
            selector: selector.to_string(),
            selector_type: None,
            attribute: None,
            post_process: None,
        }
    }

    fn full_response() -> AnalyzeResponse {
        AnalyzeResponse {
            fields: HashMap::from([
                ("title".to_string(), rule("h1")),
                ("content".to_string(), rule("article")),
                ("unknownField".to_string(), rule("aside")),
            ]),
            images: Some(rule("img")),
            videos: Some(rule("video source")),
            embeds: Some(rule("iframe")),
            requires_javascript: true,
        }
    }

    fn generator(response: AnalyzeResponse) -> RecipeGenerator {
        RecipeGenerator::new(Arc::new(FixedAnalyzer { response }), 30, 3)
    }

    #[tokio::test]
    async fn converts_analysis_into_a_recipe() {
        let recipe = generator(full_response())
            .generate("https://news.example.com/story")
            .await
            .unwrap();

        assert_eq!(recipe.domain, "news.example.com");
        assert!(recipe.use_headless);
        assert_eq!(recipe.timeout, 30);
        assert_eq!(recipe.retry_count, 3);
        assert!(recipe.extraction_rules.contains_key("title"));
        assert!(recipe.extraction_rules.contains_key("content"));
        // unknown fields from the analyzer are not carried
        assert!(!recipe.extraction_rules.contains_key("unknownField"));
        // media rules default to reading src
        assert_eq!(recipe.media_rules.images.attribute.as_deref(), Some("src"));
        assert!(recipe.validate().is_ok());
    }

    #[tokio::test]
    async fn missing_media_category_never_becomes_a_recipe() {
        let mut response = full_response();
        response.videos = None;

        let err = generator(response)
            .generate("https://news.example.com/story")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Incomplete(_)));
    }

    #[tokio::test]
    async fn url_without_host_is_rejected() {
        let err = generator(full_response())
            .generate("not-a-url")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidUrl(_)));
    }
}
