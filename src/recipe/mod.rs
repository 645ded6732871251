pub mod generator;
pub mod store;

// Re-export common types
pub use generator::{AnalysisError, HttpAnalyzer, PageAnalyzer, RecipeGenerator};
pub use store::RecipeStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

/// How the page body is obtained for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Plain HTTP GET
    Static,

    /// Full browser render via the WebDriver backend
    Rendered,
}

/// Selector dialect of an extraction rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    Css,
    Xpath,
}

/// Post-processing step applied to an extracted string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcess {
    Strip,
    Lowercase,
    Uppercase,
}

impl PostProcess {
    pub fn apply(&self, value: &str) -> String {
        match self {
            PostProcess::Strip => value.trim().to_string(),
            PostProcess::Lowercase => value.to_lowercase(),
            PostProcess::Uppercase => value.to_uppercase(),
        }
    }
}

/// A single selector-based extraction rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRule {
    /// Selector string; semantics depend on `selector_type`
    pub selector: String,

    /// Selector dialect
    pub selector_type: SelectorKind,

    /// Attribute to read instead of the node text
    #[serde(default)]
    pub attribute: Option<String>,

    /// Optional transform applied to the extracted string
    #[serde(default)]
    pub post_process: Option<PostProcess>,
}

impl ExtractionRule {
    pub fn css(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            selector_type: SelectorKind::Css,
            attribute: None,
            post_process: None,
        }
    }

    pub fn with_attribute(mut self, attribute: &str) -> Self {
        self.attribute = Some(attribute.to_string());
        self
    }
}

/// Media extraction rules; all three categories are always present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRules {
    pub images: ExtractionRule,
    pub videos: ExtractionRule,
    pub embeds: ExtractionRule,
}

impl MediaRules {
    pub fn iter(&self) -> [(&'static str, &ExtractionRule); 3] {
        [
            ("images", &self.images),
            ("videos", &self.videos),
            ("embeds", &self.embeds),
        ]
    }
}

/// Outbound proxy used when a recipe asks for one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// "http" or "socks5"
    pub proxy_type: String,
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Render the proxy as a URL reqwest understands
    pub fn to_url(&self) -> String {
        let scheme = match self.proxy_type.as_str() {
            "socks5" => "socks5",
            _ => "http",
        };
        let port = self.port.unwrap_or(8080);
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}://{}:{}@{}:{}", scheme, user, pass, self.address, port)
            }
            _ => format!("{}://{}:{}", scheme, self.address, port),
        }
    }
}

/// Bounds for recipe tunables
pub const TIMEOUT_RANGE: (u64, u64) = (1, 300);
pub const RETRY_COUNT_RANGE: (u32, u32) = (1, 5);

/// Per-domain extraction recipe, persisted as JSON in the recipe store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    /// Host this recipe applies to; the store key
    pub domain: String,

    /// Fetch through the rendering backend instead of plain HTTP
    #[serde(default)]
    pub use_headless: bool,

    /// Route the fetch through `proxy_config`
    #[serde(default)]
    pub use_proxy: bool,

    /// Fetch timeout in seconds, clamped to [1, 300]
    pub timeout: u64,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub proxy_config: Option<ProxyConfig>,

    /// Retry budget hint, clamped to [1, 5]
    pub retry_count: u32,

    /// Logical field name -> rule; any subset of the known fields
    pub extraction_rules: HashMap<String, ExtractionRule>,

    /// Always carries images, videos and embeds
    pub media_rules: MediaRules,

    /// Request headers; only ever populated on the in-memory copy
    /// produced by override application, never persisted
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl Recipe {
    pub fn fetch_mode(&self) -> FetchMode {
        if self.use_headless {
            FetchMode::Rendered
        } else {
            FetchMode::Static
        }
    }

    /// Clamp tunables into their documented bounds
    pub fn clamp_tunables(&mut self) {
        self.timeout = self.timeout.clamp(TIMEOUT_RANGE.0, TIMEOUT_RANGE.1);
        self.retry_count = self
            .retry_count
            .clamp(RETRY_COUNT_RANGE.0, RETRY_COUNT_RANGE.1);
    }

    /// Check the structural invariants: every selector non-empty
    pub fn validate(&self) -> Result<(), String> {
        for (field, rule) in &self.extraction_rules {
            if rule.selector.trim().is_empty() {
                return Err(format!("empty selector for field '{}'", field));
            }
        }
        for (category, rule) in self.media_rules.iter() {
            if rule.selector.trim().is_empty() {
                return Err(format!("empty selector for media category '{}'", category));
            }
        }
        Ok(())
    }
}

/// Extract the recipe key (host) for a URL
pub fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}
