use std::collections::HashMap;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use sxd_document::parser as xml_parser;
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value};
use tracing::debug;

use crate::recipe::{ExtractionRule, Recipe, SelectorKind};

/// Logical field names the engine knows how to place into `ScrapedContent`
pub const KNOWN_FIELDS: [&str; 6] = [
    "title",
    "content",
    "author",
    "publishDate",
    "language",
    "categories",
];

/// Media URL lists, keyed by category, in document order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFiles {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub videos: Vec<String>,
    #[serde(default)]
    pub embeds: Vec<String>,
}

/// Structured content produced by applying a recipe to a page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedContent {
    pub title: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub publish_date: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub media_files: MediaFiles,
}

/// Classification of an extraction, consumed by the task pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every requested field produced a value
    Complete,

    /// A requested title or content came back absent
    Partial,

    /// Every requested field came back absent; the recipe is stale
    Empty,
}

/// Result of one extraction pass
#[derive(Debug, Clone)]
pub struct Extraction {
    pub content: ScrapedContent,
    pub warnings: Vec<String>,
    pub outcome: Outcome,
}

/// Apply `recipe` to `html`. Pure with respect to its inputs; a rule that
/// fails to select degrades to an absent field with a warning, it never
/// aborts the remaining fields.
pub fn extract(html: &str, recipe: &Recipe) -> Extraction {
    let document = Html::parse_document(html);
    let mut xml = XmlDocument::new(html);

    let mut content = ScrapedContent::default();
    let mut warnings = Vec::new();
    let mut requested = 0usize;
    let mut absent: Vec<&str> = Vec::new();

    for (field, rule) in &recipe.extraction_rules {
        if !KNOWN_FIELDS.contains(&field.as_str()) {
            warnings.push(format!("unknown field '{}' ignored", field));
            continue;
        }
        requested += 1;

        if field == "categories" {
            match select_all(&document, &mut xml, rule, TextFallback::Text) {
                Ok(values) if !values.is_empty() => {
                    content.categories = match rule.post_process {
                        Some(step) => values.iter().map(|v| step.apply(v)).collect(),
                        None => values,
                    };
                }
                Ok(_) => absent.push("categories"),
                Err(reason) => {
                    warnings.push(format!("categories: {}", reason));
                    absent.push("categories");
                }
            }
            continue;
        }

        let value = match select_first(&document, &mut xml, rule) {
            Ok(value) => value,
            Err(reason) => {
                warnings.push(format!("{}: {}", field, reason));
                None
            }
        };

        match value {
            Some(value) => {
                let value = match rule.post_process {
                    Some(step) => step.apply(&value),
                    None => value,
                };
                set_field(&mut content, field, value);
            }
            None => absent.push(field.as_str()),
        }
    }

    for (category, rule) in recipe.media_rules.iter() {
        match select_all(&document, &mut xml, rule, TextFallback::Skip) {
            Ok(urls) => set_media(&mut content.media_files, category, urls),
            Err(reason) => warnings.push(format!("{}: {}", category, reason)),
        }
    }

    let outcome = classify(requested, &absent, &mut warnings);
    debug!(
        requested,
        absent = absent.len(),
        warnings = warnings.len(),
        "Extraction pass finished"
    );

    Extraction {
        content,
        warnings,
        outcome,
    }
}

fn classify(requested: usize, absent: &[&str], warnings: &mut Vec<String>) -> Outcome {
    if requested == 0 {
        warnings.push("recipe requests no fields".to_string());
        return Outcome::Complete;
    }
    if absent.len() == requested {
        return Outcome::Empty;
    }
    if absent.contains(&"title") || absent.contains(&"content") {
        return Outcome::Partial;
    }
    Outcome::Complete
}

fn set_field(content: &mut ScrapedContent, field: &str, value: String) {
    match field {
        "title" => content.title = Some(value),
        "content" => content.content = Some(value),
        "author" => content.author = Some(value),
        "publishDate" => content.publish_date = Some(value),
        "language" => content.language = Some(value),
        _ => {}
    }
}

fn set_media(media: &mut MediaFiles, category: &str, urls: Vec<String>) {
    match category {
        "images" => media.images = urls,
        "videos" => media.videos = urls,
        "embeds" => media.embeds = urls,
        _ => {}
    }
}

/// What to read from a matching node when the rule has no attribute
enum TextFallback {
    /// Use the node's collapsed text
    Text,

    /// Yield nothing; the rule is a no-op without an attribute
    Skip,
}

/// Value of the first matching node, or None when nothing matches
fn select_first(
    document: &Html,
    xml: &mut XmlDocument,
    rule: &ExtractionRule,
) -> Result<Option<String>, String> {
    match rule.selector_type {
        SelectorKind::Css => {
            let selector = parse_css(&rule.selector)?;
            Ok(document.select(&selector).next().map(|element| {
                match rule.attribute.as_deref() {
                    Some(attribute) => element
                        .value()
                        .attr(attribute)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    None => collapse_whitespace(&element.text().collect::<String>()),
                }
            })
            .filter(|v| !v.is_empty()))
        }
        SelectorKind::Xpath => {
            let nodes = xml.select(&rule.selector)?;
            Ok(nodes
                .into_iter()
                .next()
                .and_then(|node| xml_node_value(&node, rule.attribute.as_deref()))
                .filter(|v| !v.is_empty()))
        }
    }
}

/// Values of every matching node, in document order
fn select_all(
    document: &Html,
    xml: &mut XmlDocument,
    rule: &ExtractionRule,
    fallback: TextFallback,
) -> Result<Vec<String>, String> {
    match rule.selector_type {
        SelectorKind::Css => {
            let selector = parse_css(&rule.selector)?;
            let mut values = Vec::new();
            for element in document.select(&selector) {
                match (rule.attribute.as_deref(), &fallback) {
                    (Some(attribute), _) => {
                        // nodes lacking the attribute are skipped
                        if let Some(value) = element.value().attr(attribute) {
                            values.push(value.to_string());
                        }
                    }
                    (None, TextFallback::Text) => {
                        let text = collapse_whitespace(&element.text().collect::<String>());
                        if !text.is_empty() {
                            values.push(text);
                        }
                    }
                    (None, TextFallback::Skip) => {}
                }
            }
            Ok(values)
        }
        SelectorKind::Xpath => {
            let nodes = xml.select(&rule.selector)?;
            let mut values = Vec::new();
            for node in nodes {
                match (rule.attribute.as_deref(), &fallback) {
                    (Some(_), _) | (None, TextFallback::Text) => {
                        if let Some(value) = xml_node_value(&node, rule.attribute.as_deref()) {
                            if !value.is_empty() {
                                values.push(value);
                            }
                        }
                    }
                    (None, TextFallback::Skip) => {}
                }
            }
            Ok(values)
        }
    }
}

fn parse_css(selector: &str) -> Result<Selector, String> {
    Selector::parse(selector).map_err(|e| format!("invalid css selector '{}': {}", selector, e))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn xml_node_value(node: &OwnedNodeValue, attribute: Option<&str>) -> Option<String> {
    match attribute {
        Some(name) => node.attributes.get(name).cloned(),
        None => {
            let text = collapse_whitespace(&node.text);
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
    }
}

/// Detached value of an XPath match; sxd nodes borrow from the parsed
/// package, so matches are copied out before the package is dropped
struct OwnedNodeValue {
    text: String,
    attributes: HashMap<String, String>,
}

/// Lazily parsed XML view of the page for XPath rules. Tag-soup HTML that
/// is not well-formed XML fails to parse here, which degrades every XPath
/// field of the recipe rather than the whole extraction.
struct XmlDocument<'a> {
    source: &'a str,
    parsed: Option<Result<sxd_document::Package, String>>,
}

impl<'a> XmlDocument<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            parsed: None,
        }
    }

    fn select(&mut self, selector: &str) -> Result<Vec<OwnedNodeValue>, String> {
        let source = self.source;
        let parsed = self.parsed.get_or_insert_with(|| {
            xml_parser::parse(source)
                .map_err(|e| format!("document is not well-formed XML: {}", e))
        });
        let package = match parsed {
            Ok(package) => package,
            Err(reason) => return Err(reason.clone()),
        };

        let factory = Factory::new();
        let xpath = factory
            .build(selector)
            .map_err(|e| format!("invalid xpath '{}': {}", selector, e))?
            .ok_or_else(|| format!("invalid xpath '{}': empty expression", selector))?;

        let document = package.as_document();
        let context = Context::new();
        let value = xpath
            .evaluate(&context, document.root())
            .map_err(|e| format!("xpath evaluation failed for '{}': {}", selector, e))?;

        let mut owned = Vec::new();
        if let Value::Nodeset(nodeset) = value {
            for node in nodeset.document_order() {
                let mut attributes = HashMap::new();
                if let Node::Element(element) = node {
                    for attr in element.attributes() {
                        attributes
                            .insert(attr.name().local_part().to_string(), attr.value().to_string());
                    }
                }
                owned.push(OwnedNodeValue {
                    text: node.string_value(),
                    attributes,
                });
            }
        }
        Ok(owned)
    }
}
