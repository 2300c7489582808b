use crate::error::IngestError;
use scraper::{ElementRef, Html, Selector};

const SKIP_TAGS: &[&str] = &[
    "script", "style", "template", "noscript", "svg", "nav", "header", "footer", "aside", "form",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "pre",
];

/// Payload shape as declared by the server, falling back to sniffing the
/// body when the Content-Type header is missing or unhelpful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Html,
    Xml,
    PlainText,
}

impl PayloadKind {
    pub fn detect(content_type: Option<&str>, body: &str) -> Self {
        if let Some(declared) = content_type {
            let declared = declared.to_ascii_lowercase();
            if declared.contains("html") {
                return Self::Html;
            }
            if declared.contains("xml") {
                return Self::Xml;
            }
            if declared.contains("text/plain") {
                return Self::PlainText;
            }
        }

        let head = body.trim_start().to_ascii_lowercase();
        if head.starts_with("<!doctype html") || head.starts_with("<html") {
            Self::Html
        } else if head.starts_with("<?xml") || head.starts_with('<') {
            Self::Xml
        } else {
            Self::PlainText
        }
    }
}

/// Turns one fetched payload into clean plain text for chunking. The
/// pipeline ships a markup-aware default; site-specific cleanup rules plug
/// in through this seam.
pub trait TextExtractor: Send + Sync {
    fn extract(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: &str,
    ) -> Result<String, IngestError>;
}

/// Default extractor, producing paragraph-structured text. HTML loses
/// scripts, styles, and navigation chrome; XML keeps element text as
/// paragraphs; plain text passes through with newline normalization.
#[derive(Clone)]
pub struct ScraperExtractor {
    article: Selector,
    main: Selector,
    body: Selector,
}

impl Default for ScraperExtractor {
    fn default() -> Self {
        Self {
            article: Selector::parse("article").expect("article selector"),
            main: Selector::parse("main").expect("main selector"),
            body: Selector::parse("body").expect("body selector"),
        }
    }
}

impl TextExtractor for ScraperExtractor {
    fn extract(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: &str,
    ) -> Result<String, IngestError> {
        let text = match PayloadKind::detect(content_type, body) {
            PayloadKind::Html => self.extract_html(body),
            PayloadKind::Xml => extract_xml(body),
            PayloadKind::PlainText => normalize_plain_text(body),
        };

        if text.trim().is_empty() {
            return Err(IngestError::Extract {
                url: url.to_string(),
                reason: "no readable text in payload".to_string(),
            });
        }

        Ok(text)
    }
}

impl ScraperExtractor {
    fn extract_html(&self, body: &str) -> String {
        let document = Html::parse_document(body);
        let root = document
            .select(&self.article)
            .next()
            .or_else(|| document.select(&self.main).next())
            .or_else(|| document.select(&self.body).next())
            .unwrap_or_else(|| document.root_element());

        let mut paragraphs = Vec::new();
        for element in root.descendent_elements() {
            let tag = element.value().name();
            if !BLOCK_TAGS.contains(&tag) {
                continue;
            }
            if in_subtree_of(&element, SKIP_TAGS) {
                continue;
            }
            // A block nested in another block (li > p) is already covered by
            // its ancestor's text.
            if in_subtree_of(&element, BLOCK_TAGS) {
                continue;
            }

            let text = collapse_whitespace(&element.text().collect::<String>());
            if !text.is_empty() {
                paragraphs.push(text);
            }
        }

        paragraphs.join("\n\n")
    }
}

fn in_subtree_of(element: &ElementRef<'_>, tags: &[&str]) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| tags.contains(&ancestor.value().name()))
}

/// Abstract feeds (PubMed efetch, arXiv Atom) carry their text in leaf
/// elements. Each element's direct text becomes one paragraph, in document
/// order.
fn extract_xml(body: &str) -> String {
    let document = Html::parse_document(body);
    let mut paragraphs = Vec::new();
    for element in document.root_element().descendent_elements() {
        let direct_text: String = element
            .children()
            .filter_map(|node| node.value().as_text().map(|text| text.to_string()))
            .collect();
        let text = collapse_whitespace(&direct_text);
        if !text.is_empty() {
            paragraphs.push(text);
        }
    }
    paragraphs.join("\n\n")
}

fn normalize_plain_text(body: &str) -> String {
    let unified = body.replace("\r\n", "\n");
    let mut paragraphs = Vec::new();
    for block in unified.split("\n\n") {
        let lines: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if !lines.is_empty() {
            paragraphs.push(lines.join("\n"));
        }
    }
    paragraphs.join("\n\n")
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
