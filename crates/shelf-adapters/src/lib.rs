//! Page rendering and listing seams, fixture-first implementations, and the product field extractor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shelf_core::{RawSnapshot, SnapshotField, StockStatus};
use shelf_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-adapters";

/// Provenance tag for fields taken from the embedded Product structured data.
pub const JSON_LD_STRATEGY: &str = "json_ld";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("`{selector}` not present on {url} within {timeout:?}")]
    ReadyTimeout {
        url: String,
        selector: String,
        timeout: Duration,
    },
    #[error("invalid readiness selector `{0}`")]
    Selector(String),
    #[error("renderer session: {0}")]
    Session(String),
}

impl RenderError {
    /// Transport-level failures worth another navigation attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Navigation { .. })
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid url `{url}`: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fixture: {0}")]
    Fixture(String),
}

/// One exclusively held rendering session. Product pages go through it one at a time.
#[async_trait]
pub trait PageRenderer: Send {
    async fn clear_cookies(&mut self) -> Result<(), RenderError>;
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError>;
    async fn reload(&mut self) -> Result<(), RenderError>;
    /// URL the session actually landed on after the last navigation or reload.
    fn current_url(&self) -> Option<&str>;
    async fn wait_for_ready(&mut self, selector: &str, timeout: Duration) -> Result<(), RenderError>;
    async fn page_source(&mut self) -> Result<String, RenderError>;

    async fn shutdown(&mut self) -> Result<(), RenderError> {
        Ok(())
    }
}

/// Stateless listing-page GET, safe to call from several workers at once.
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    async fn fetch_listing(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, AdapterError>;
}

#[async_trait]
impl<T: ListingFetcher + ?Sized> ListingFetcher for Arc<T> {
    async fn fetch_listing(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, AdapterError> {
        (**self).fetch_listing(run_id, url).await
    }
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
struct LoadedPage {
    final_url: String,
    body: String,
}

/// Renderer over plain HTTP with a cookie jar. No script execution: the DOM is the served HTML.
#[derive(Debug)]
pub struct HttpPageRenderer {
    config: RendererConfig,
    client: reqwest::Client,
    requested: Option<String>,
    current: Option<LoadedPage>,
}

impl HttpPageRenderer {
    pub fn new(config: RendererConfig) -> Result<Self, RenderError> {
        let client = build_session_client(&config)?;
        Ok(Self {
            config,
            client,
            requested: None,
            current: None,
        })
    }

    async fn load(&mut self, url: &str, bypass_cache: bool) -> Result<(), RenderError> {
        let mut request = self.client.get(url);
        if bypass_cache {
            request = request.header(reqwest::header::CACHE_CONTROL, "no-cache");
        }
        let navigation_error = |err: reqwest::Error| RenderError::Navigation {
            url: url.to_string(),
            message: err.to_string(),
        };

        let response = request
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(navigation_error)?;
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(navigation_error)?;

        self.requested = Some(url.to_string());
        self.current = Some(LoadedPage { final_url, body });
        Ok(())
    }

    fn loaded(&self) -> Result<&LoadedPage, RenderError> {
        self.current
            .as_ref()
            .ok_or_else(|| RenderError::Session("no page loaded".to_string()))
    }
}

fn build_session_client(config: &RendererConfig) -> Result<reqwest::Client, RenderError> {
    let mut builder = reqwest::Client::builder()
        .cookie_store(true)
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder
        .build()
        .map_err(|err| RenderError::Session(format!("building http session: {err}")))
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    async fn clear_cookies(&mut self) -> Result<(), RenderError> {
        // a fresh client is the only way to empty reqwest's jar
        self.client = build_session_client(&self.config)?;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        self.load(url, false).await
    }

    async fn reload(&mut self) -> Result<(), RenderError> {
        let url = self
            .requested
            .clone()
            .ok_or_else(|| RenderError::Session("reload before navigation".to_string()))?;
        self.load(&url, true).await
    }

    fn current_url(&self) -> Option<&str> {
        self.current.as_ref().map(|page| page.final_url.as_str())
    }

    async fn wait_for_ready(&mut self, selector: &str, timeout: Duration) -> Result<(), RenderError> {
        // served HTML never changes after load, so absence is final
        let page = self.loaded()?;
        if document_has(&page.body, selector)? {
            Ok(())
        } else {
            Err(RenderError::ReadyTimeout {
                url: page.final_url.clone(),
                selector: selector.to_string(),
                timeout,
            })
        }
    }

    async fn page_source(&mut self) -> Result<String, RenderError> {
        Ok(self.loaded()?.body.clone())
    }
}

fn document_has(html: &str, selector: &str) -> Result<bool, RenderError> {
    let sel = Selector::parse(selector).map_err(|_| RenderError::Selector(selector.to_string()))?;
    let document = Html::parse_document(html);
    let found = document.select(&sel).next().is_some();
    Ok(found)
}

#[derive(Debug)]
pub struct HttpListingFetcher {
    http: Arc<HttpFetcher>,
}

impl HttpListingFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ListingFetcher for HttpListingFetcher {
    async fn fetch_listing(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, AdapterError> {
        let response = self.http.fetch_bytes(run_id, url).await?;
        Ok(FetchedPage {
            url: url.to_string(),
            final_url: response.final_url.clone(),
            body: response.text(),
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureRedirect {
    pub to: String,
    /// Number of loads served from the redirect target before the real page shows up.
    /// `None` keeps redirecting forever.
    #[serde(default)]
    pub times: Option<usize>,
}

/// `manifest.json` of a captured site: URL to HTML file, plus scripted misbehaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureManifest {
    pub base_url: String,
    pub pages: BTreeMap<String, String>,
    #[serde(default)]
    pub redirects: BTreeMap<String, FixtureRedirect>,
    #[serde(default)]
    pub failures: BTreeSet<String>,
    /// URL -> number of navigations that fail before one succeeds.
    #[serde(default)]
    pub flaky: BTreeMap<String, usize>,
}

/// Offline copy of a catalog, served to the listing workers and to fixture renderers.
#[derive(Debug, Clone)]
pub struct FixtureSite {
    manifest: FixtureManifest,
    pages: HashMap<String, String>,
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

impl FixtureSite {
    pub const MANIFEST_FILE: &'static str = "manifest.json";

    pub fn load(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest: FixtureManifest = read_json_file(root.join(Self::MANIFEST_FILE))?;
        let mut pages = HashMap::with_capacity(manifest.pages.len());
        for (url, file) in &manifest.pages {
            let path = root.join(file);
            let html = fs::read_to_string(&path)
                .with_context(|| format!("reading fixture page {}", path.display()))?;
            pages.insert(url.clone(), html);
        }
        Ok(Self { manifest, pages })
    }

    pub fn base_url(&self) -> &str {
        &self.manifest.base_url
    }

    pub fn page(&self, url: &str) -> Option<&str> {
        self.pages.get(url).map(String::as_str)
    }

    pub fn renderer(self: &Arc<Self>) -> FixtureRenderer {
        FixtureRenderer {
            site: Arc::clone(self),
            requested: None,
            current: None,
            loads: HashMap::new(),
            navigations: HashMap::new(),
            cookie_clears: 0,
        }
    }
}

#[async_trait]
impl ListingFetcher for FixtureSite {
    async fn fetch_listing(&self, _run_id: Uuid, url: &str) -> Result<FetchedPage, AdapterError> {
        if self.manifest.failures.contains(url) {
            return Err(AdapterError::Fixture(format!("scripted failure for {url}")));
        }
        let body = self
            .page(url)
            .ok_or_else(|| AdapterError::Fixture(format!("no captured page for {url}")))?;
        Ok(FetchedPage {
            url: url.to_string(),
            final_url: url.to_string(),
            body: body.to_string(),
            fetched_at: Utc::now(),
        })
    }
}

/// Renderer session over a [`FixtureSite`]; applies the manifest's redirects, failures and flakes.
#[derive(Debug)]
pub struct FixtureRenderer {
    site: Arc<FixtureSite>,
    requested: Option<String>,
    current: Option<LoadedPage>,
    loads: HashMap<String, usize>,
    navigations: HashMap<String, usize>,
    cookie_clears: usize,
}

impl FixtureRenderer {
    pub fn cookie_clears(&self) -> usize {
        self.cookie_clears
    }

    pub fn navigations_to(&self, url: &str) -> usize {
        self.navigations.get(url).copied().unwrap_or(0)
    }

    fn load(&mut self, url: &str) -> Result<(), RenderError> {
        let manifest = &self.site.manifest;
        if manifest.failures.contains(url) {
            return Err(RenderError::Navigation {
                url: url.to_string(),
                message: "scripted failure".to_string(),
            });
        }

        let load_index = {
            let count = self.loads.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let landed = match manifest.redirects.get(url) {
            Some(redirect) if redirect.times.map_or(true, |times| load_index <= times) => {
                redirect.to.clone()
            }
            _ => url.to_string(),
        };

        let body = self.site.page(&landed).ok_or_else(|| RenderError::Navigation {
            url: url.to_string(),
            message: format!("no captured page for {landed}"),
        })?;

        self.requested = Some(url.to_string());
        self.current = Some(LoadedPage {
            final_url: landed,
            body: body.to_string(),
        });
        Ok(())
    }

    fn loaded(&self) -> Result<&LoadedPage, RenderError> {
        self.current
            .as_ref()
            .ok_or_else(|| RenderError::Session("no page loaded".to_string()))
    }
}

#[async_trait]
impl PageRenderer for FixtureRenderer {
    async fn clear_cookies(&mut self) -> Result<(), RenderError> {
        self.cookie_clears += 1;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        let attempt = {
            let count = self.navigations.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let flaky_failures = self.site.manifest.flaky.get(url).copied().unwrap_or(0);
        if attempt <= flaky_failures {
            return Err(RenderError::Navigation {
                url: url.to_string(),
                message: format!("scripted transient failure {attempt}/{flaky_failures}"),
            });
        }
        self.load(url)
    }

    async fn reload(&mut self) -> Result<(), RenderError> {
        let url = self
            .requested
            .clone()
            .ok_or_else(|| RenderError::Session("reload before navigation".to_string()))?;
        self.load(&url)
    }

    fn current_url(&self) -> Option<&str> {
        self.current.as_ref().map(|page| page.final_url.as_str())
    }

    async fn wait_for_ready(&mut self, selector: &str, timeout: Duration) -> Result<(), RenderError> {
        let page = self.loaded()?;
        if document_has(&page.body, selector)? {
            Ok(())
        } else {
            Err(RenderError::ReadyTimeout {
                url: page.final_url.clone(),
                selector: selector.to_string(),
                timeout,
            })
        }
    }

    async fn page_source(&mut self) -> Result<String, RenderError> {
        Ok(self.loaded()?.body.clone())
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(err) => {
            warn!(selector, error = %err, "skipping unparseable selector");
            None
        }
    }
}

fn parse_url(value: &str) -> Result<Url, AdapterError> {
    Url::parse(value).map_err(|source| AdapterError::Url {
        url: value.to_string(),
        source,
    })
}

fn is_navigable_href(href: &str) -> bool {
    let href = href.trim();
    let lower = href.to_ascii_lowercase();
    !(href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:"))
}

const PAGINATION_CONTAINERS: [&str; 3] = ["nav.pagination", "div.pagination", ".pagination"];

/// A listing URL in the form `discover_pages` reports it: parsed, fragment removed.
pub fn canonical_listing_url(value: &str) -> Result<String, AdapterError> {
    let mut url = parse_url(value)?;
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Listing pages to crawl, sorted: the base URL plus every pagination link on its first page.
///
/// A catalog without a pagination block is a single-page catalog, not an error. Site menus
/// and other navigation outside a pagination container are ignored.
pub fn discover_pages(base_url: &str, first_page_html: &str) -> Result<Vec<String>, AdapterError> {
    let mut base = parse_url(base_url)?;
    base.set_fragment(None);
    let document = Html::parse_document(first_page_html);
    let anchor = parse_selector("a[href]");

    let mut pages = BTreeSet::new();
    for container_selector in PAGINATION_CONTAINERS {
        let (Some(container_sel), Some(anchor_sel)) = (parse_selector(container_selector), anchor.as_ref())
        else {
            continue;
        };
        for container in document.select(&container_sel) {
            for link in container.select(anchor_sel) {
                let Some(href) = link.value().attr("href").filter(|h| is_navigable_href(h)) else {
                    continue;
                };
                if let Ok(mut resolved) = base.join(href.trim()) {
                    resolved.set_fragment(None);
                    pages.insert(resolved.to_string());
                }
            }
        }
        if !pages.is_empty() {
            debug!(container = container_selector, count = pages.len(), "pagination links found");
            break;
        }
    }

    pages.insert(base.to_string());
    Ok(pages.into_iter().collect())
}

/// Absolute product URLs on a listing page, query and fragment removed, in first-seen order.
pub fn parse_product_links(page_url: &str, html: &str) -> Result<Vec<String>, AdapterError> {
    let base = parse_url(page_url)?;
    let document = Html::parse_document(html);
    let (Some(card_sel), Some(link_sel)) = (
        parse_selector(r#"[class*="product-card"], [class*="grid-product"]"#),
        parse_selector(r#"a[href*="/products/"]"#),
    ) else {
        return Ok(Vec::new());
    };

    let mut hrefs: Vec<&str> = document
        .select(&card_sel)
        .filter_map(|card| card.select(&link_sel).next())
        .filter_map(|link| link.value().attr("href"))
        .collect();
    if hrefs.is_empty() {
        hrefs = document
            .select(&link_sel)
            .filter_map(|link| link.value().attr("href"))
            .collect();
    }

    let mut seen = BTreeSet::new();
    let mut links = Vec::new();
    for href in hrefs {
        let Ok(mut resolved) = base.join(href.trim()) else {
            continue;
        };
        resolved.set_query(None);
        resolved.set_fragment(None);
        let resolved = resolved.to_string();
        if seen.insert(resolved.clone()) {
            links.push(resolved);
        }
    }
    Ok(links)
}

/// How a selector strategy reads a value out of the matched elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Text of the first match.
    Text,
    /// Attribute of the first match.
    Attr(&'static str),
    /// Text of every match.
    AllText,
    /// Attribute of every match.
    AllAttr(&'static str),
    /// Text of a child selector inside every match.
    ChildText(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorStrategy {
    pub selector: &'static str,
    pub probe: Probe,
}

const fn strategy(selector: &'static str, probe: Probe) -> SelectorStrategy {
    SelectorStrategy { selector, probe }
}

pub const TITLE_STRATEGIES: &[SelectorStrategy] = &[
    strategy("h2.product-title", Probe::Text),
    strategy("h1.product-title", Probe::Text),
    strategy(".product-title", Probe::Text),
    strategy("h1", Probe::Text),
];

pub const PRICE_STRATEGIES: &[SelectorStrategy] = &[
    strategy("sale-price", Probe::Text),
    strategy(".price-list sale-price", Probe::Text),
    strategy(".price", Probe::Text),
    strategy(".product-price", Probe::Text),
    strategy(r#"[class*="price"]"#, Probe::Text),
];

pub const DESCRIPTION_STRATEGIES: &[SelectorStrategy] = &[
    strategy(".product-description", Probe::Text),
    strategy(".product__description", Probe::Text),
    strategy(r#"meta[name="description"]"#, Probe::Attr("content")),
];

pub const VARIANT_STRATEGIES: &[SelectorStrategy] = &[
    strategy(r#"input[name="option1"]"#, Probe::AllAttr("value")),
    strategy(r#".variant-picker input[type="radio"]"#, Probe::AllAttr("value")),
    strategy(r#"select[name="id"] option"#, Probe::AllText),
    strategy(".color-swatch", Probe::ChildText(".sr-only")),
    strategy("[data-option-value]", Probe::AllAttr("data-option-value")),
];

pub const IMAGE_STRATEGIES: &[SelectorStrategy] = &[
    strategy(".product-single__photos img", Probe::AllAttr("src")),
    strategy(".product-gallery img", Probe::AllAttr("src")),
    strategy(".product-images img", Probe::AllAttr("src")),
    strategy(r#"[class*="product"] img"#, Probe::AllAttr("src")),
];

pub const STOCK_STRATEGIES: &[SelectorStrategy] = &[
    strategy(".product-inventory", Probe::Text),
    strategy(".stock-status", Probe::Text),
    strategy(r#"[class*="stock"]"#, Probe::Text),
    strategy(r#"[class*="inventory"]"#, Probe::Text),
    strategy(".add-to-cart-button", Probe::Text),
];

/// Values produced by one strategy, de-duplicated in document order. Empty means "no result".
fn run_probe(document: &Html, strategy: &SelectorStrategy) -> Vec<String> {
    let Some(sel) = parse_selector(strategy.selector) else {
        return Vec::new();
    };
    let mut matches = document.select(&sel);
    let values: Vec<String> = match strategy.probe {
        Probe::Text => matches.next().and_then(element_text).into_iter().collect(),
        Probe::Attr(attr) => matches
            .next()
            .and_then(|el| el.value().attr(attr))
            .and_then(text_or_none)
            .into_iter()
            .collect(),
        Probe::AllText => matches.filter_map(element_text).collect(),
        Probe::AllAttr(attr) => matches
            .filter_map(|el| el.value().attr(attr))
            .filter_map(text_or_none)
            .collect(),
        Probe::ChildText(child) => {
            let Some(child_sel) = parse_selector(child) else {
                return Vec::new();
            };
            matches
                .filter_map(|el| el.select(&child_sel).next())
                .filter_map(element_text)
                .collect()
        }
    };

    let mut seen = BTreeSet::new();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

/// Folds a strategy table: the first strategy whose output passes `accept` wins.
fn first_accepted<F>(
    document: &Html,
    strategies: &[SelectorStrategy],
    accept: F,
) -> Option<(&'static str, Vec<String>)>
where
    F: Fn(&[String]) -> bool,
{
    strategies.iter().find_map(|strategy| {
        let values = run_probe(document, strategy);
        (!values.is_empty() && accept(&values)).then_some((strategy.selector, values))
    })
}

/// Classifies free stock text. Priority: out-of-stock wording, then in-stock wording, then pre-order.
pub fn classify_stock_text(text: &str) -> Option<StockStatus> {
    let lower = text.to_lowercase();
    if lower.contains("out of stock") || lower.contains("sold out") {
        Some(StockStatus::OutOfStock)
    } else if lower.contains("in stock") || lower.contains("available") || lower.contains("add to cart") {
        Some(StockStatus::InStock)
    } else if lower.contains("pre-order") {
        Some(StockStatus::PreOrder)
    } else {
        None
    }
}

fn is_product_node(node: &JsonValue) -> bool {
    match node.get("@type") {
        Some(JsonValue::String(kind)) => kind == "Product",
        Some(JsonValue::Array(kinds)) => kinds.iter().any(|k| k.as_str() == Some("Product")),
        _ => false,
    }
}

fn find_product_node(value: &JsonValue) -> Option<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().find_map(find_product_node),
        JsonValue::Object(map) => {
            if is_product_node(value) {
                return Some(value);
            }
            map.get("@graph").and_then(find_product_node)
        }
        _ => None,
    }
}

/// First `Product` object among the page's `application/ld+json` blocks. Unparseable blocks are skipped.
pub fn product_json_ld(document: &Html) -> Option<JsonValue> {
    let sel = parse_selector(r#"script[type="application/ld+json"]"#)?;
    document.select(&sel).find_map(|script| {
        let text = script.text().collect::<String>();
        match serde_json::from_str::<JsonValue>(&text) {
            Ok(value) => find_product_node(&value).cloned(),
            Err(err) => {
                debug!(error = %err, "skipping malformed ld+json block");
                None
            }
        }
    })
}

fn json_scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_images(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(s) => text_or_none(s).into_iter().collect(),
        JsonValue::Object(map) => map.get("url").map(json_images).unwrap_or_default(),
        JsonValue::Array(items) => items.iter().flat_map(json_images).collect(),
        _ => Vec::new(),
    }
}

/// Offers flattened in document order; an aggregate follows the offers nested in it.
fn flatten_offers(value: &JsonValue) -> Vec<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().flat_map(flatten_offers).collect(),
        JsonValue::Object(map) => {
            let mut offers = map.get("offers").map(flatten_offers).unwrap_or_default();
            offers.push(value);
            offers
        }
        _ => Vec::new(),
    }
}

fn apply_json_ld(raw: &mut RawSnapshot, product: &JsonValue) {
    if let Some(title) = product.get("name").and_then(json_scalar_text) {
        raw.title = Some(title);
        raw.record_source(SnapshotField::Title, JSON_LD_STRATEGY);
    }

    if let Some(description) = product
        .get("description")
        .and_then(JsonValue::as_str)
        .and_then(|d| text_or_none(&d.replace('\n', " ")))
    {
        raw.description = Some(description);
        raw.record_source(SnapshotField::Description, JSON_LD_STRATEGY);
    }

    let images = product.get("image").map(json_images).unwrap_or_default();
    if !images.is_empty() {
        raw.images = resolve_all(&raw.url, images);
        raw.record_source(SnapshotField::Images, JSON_LD_STRATEGY);
    }

    let offers = product.get("offers").map(flatten_offers).unwrap_or_default();

    let price = offers
        .iter()
        .find_map(|offer| offer.get("price").and_then(json_scalar_text))
        .or_else(|| offers.iter().find_map(|offer| offer.get("lowPrice").and_then(json_scalar_text)));
    if let Some(price) = price {
        raw.raw_price = Some(price);
        raw.record_source(SnapshotField::Price, JSON_LD_STRATEGY);
    }

    if let Some(availability) = offers
        .iter()
        .rev()
        .find_map(|offer| offer.get("availability").and_then(json_scalar_text))
    {
        raw.raw_stock_status = Some(availability);
        raw.record_source(SnapshotField::StockStatus, JSON_LD_STRATEGY);
    }

    let mut names = Vec::new();
    for name in offers
        .iter()
        .filter_map(|offer| offer.get("name").and_then(json_scalar_text))
    {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    if !names.is_empty() {
        raw.variant_labels = names;
        raw.record_source(SnapshotField::Variants, JSON_LD_STRATEGY);
    }
}

fn resolve_all(page_url: &str, srcs: Vec<String>) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return srcs;
    };
    srcs.into_iter()
        .map(|src| base.join(&src).map(|u| u.to_string()).unwrap_or(src))
        .collect()
}

/// Best-effort product record from rendered page content. Never fails: missing fields stay empty.
pub fn extract_product(url: &str, html: &str, captured_at: DateTime<Utc>) -> RawSnapshot {
    let document = Html::parse_document(html);
    let mut raw = RawSnapshot::empty(url, captured_at);

    if let Some(product) = product_json_ld(&document) {
        apply_json_ld(&mut raw, &product);
    }

    if raw.title.is_none() {
        if let Some((selector, mut values)) = first_accepted(&document, TITLE_STRATEGIES, |_| true) {
            raw.title = Some(values.swap_remove(0));
            raw.record_source(SnapshotField::Title, selector);
        }
    }

    if raw.raw_price.is_none() {
        let has_digit = |values: &[String]| values[0].chars().any(|c| c.is_ascii_digit());
        if let Some((selector, mut values)) = first_accepted(&document, PRICE_STRATEGIES, has_digit) {
            raw.raw_price = Some(values.swap_remove(0));
            raw.record_source(SnapshotField::Price, selector);
        }
    }

    if raw.description.is_none() {
        if let Some((selector, mut values)) = first_accepted(&document, DESCRIPTION_STRATEGIES, |_| true) {
            raw.description = Some(values.swap_remove(0));
            raw.record_source(SnapshotField::Description, selector);
        }
    }

    if raw.variant_labels.is_empty() {
        if let Some((selector, values)) = first_accepted(&document, VARIANT_STRATEGIES, |_| true) {
            raw.variant_labels = values;
            raw.record_source(SnapshotField::Variants, selector);
        }
    }

    if raw.images.is_empty() {
        if let Some((selector, values)) = first_accepted(&document, IMAGE_STRATEGIES, |_| true) {
            raw.images = resolve_all(url, values);
            raw.record_source(SnapshotField::Images, selector);
        }
    }

    if raw.raw_stock_status.is_none() {
        let classified = STOCK_STRATEGIES.iter().find_map(|strategy| {
            run_probe(&document, strategy)
                .first()
                .and_then(|text| classify_stock_text(text))
                .map(|status| (strategy.selector, status))
        });
        if let Some((selector, status)) = classified {
            raw.raw_stock_status = Some(status.label().to_string());
            raw.record_source(SnapshotField::StockStatus, selector);
        }
    }

    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn single_page_catalog_yields_only_base_url() {
        let html = "<html><body><div class='grid'><a href='/products/a'>A</a></div></body></html>";
        let pages = discover_pages("https://shop.test/collections/all", html).unwrap();
        assert_eq!(pages, vec!["https://shop.test/collections/all".to_string()]);
    }

    #[test]
    fn site_menu_without_pagination_is_single_page() {
        let html = r#"
            <header>
              <nav role="navigation">
                <a href="/">Home</a>
                <a href="/collections/vests">Vests</a>
                <a href="/pages/contact">Contact</a>
              </nav>
            </header>
            <div class="grid"><a href="/products/a">A</a></div>"#;
        let pages = discover_pages("https://shop.test/collections/all", html).unwrap();
        assert_eq!(pages, vec!["https://shop.test/collections/all".to_string()]);
    }

    #[test]
    fn base_url_is_reported_in_canonical_form() {
        let html = r#"<nav class="pagination"><a href="/">1</a><a href="/?page=2">2</a></nav>"#;
        let pages = discover_pages("https://shop.test", html).unwrap();
        assert_eq!(
            pages,
            vec!["https://shop.test/".to_string(), "https://shop.test/?page=2".to_string()]
        );
        assert_eq!(canonical_listing_url("https://shop.test#top").unwrap(), "https://shop.test/");
    }

    #[test]
    fn pagination_links_resolve_against_base_and_skip_non_navigating_hrefs() {
        let html = r##"
            <nav class="pagination">
              <a href="#">prev</a>
              <a href="/collections/all?page=3">3</a>
              <a href="javascript:void(0)">...</a>
              <a href="?page=2#top">2</a>
            </nav>"##;
        let pages = discover_pages("https://shop.test/collections/all", html).unwrap();
        assert_eq!(
            pages,
            vec![
                "https://shop.test/collections/all".to_string(),
                "https://shop.test/collections/all?page=2".to_string(),
                "https://shop.test/collections/all?page=3".to_string(),
            ]
        );
    }

    #[test]
    fn product_links_are_absolute_unique_and_query_free() {
        let html = r#"
            <div class="product-card"><a href="/products/vest?variant=1">Vest</a></div>
            <div class="grid-product__wrap"><a href="/products/belt">Belt</a></div>
            <div class="product-card"><a href="/products/vest#reviews">Vest again</a></div>
            <a href="/products/outside-card">ignored when cards exist</a>"#;
        let links = parse_product_links("https://shop.test/collections/all?page=2", html).unwrap();
        assert_eq!(
            links,
            vec![
                "https://shop.test/products/vest".to_string(),
                "https://shop.test/products/belt".to_string(),
            ]
        );
    }

    #[test]
    fn product_links_fall_back_to_bare_anchors() {
        let html = r#"<ul><li><a href="https://shop.test/products/hat">Hat</a></li></ul>"#;
        let links = parse_product_links("https://shop.test/collections/all", html).unwrap();
        assert_eq!(links, vec!["https://shop.test/products/hat".to_string()]);
    }

    #[test]
    fn json_ld_fields_take_priority_over_selectors() {
        let html = r#"
            <script type="application/ld+json">{"@context":"https://schema.org","@type":"BreadcrumbList"}</script>
            <script type="application/ld+json">
            {"@type":"Product","name":"Ranger Carrier","description":"line one\nline two",
             "image":[{"url":"https://cdn.test/1.jpg"},"//cdn.test/2.jpg"],
             "offers":[
               {"@type":"Offer","name":"Black / M","price":"899.00","availability":"http://schema.org/InStock"},
               {"@type":"Offer","name":"Black / L","price":"949.00","availability":"http://schema.org/OutOfStock"}
             ]}
            </script>
            <h1 class="product-title">Selector title</h1>"#;
        let raw = extract_product("https://shop.test/products/ranger", html, at());
        assert_eq!(raw.title.as_deref(), Some("Ranger Carrier"));
        assert_eq!(raw.description.as_deref(), Some("line one line two"));
        assert_eq!(raw.raw_price.as_deref(), Some("899.00"));
        assert_eq!(raw.raw_stock_status.as_deref(), Some("http://schema.org/OutOfStock"));
        assert_eq!(raw.variant_labels, vec!["Black / M", "Black / L"]);
        assert_eq!(
            raw.images,
            vec!["https://cdn.test/1.jpg", "https://cdn.test/2.jpg"]
        );
        assert_eq!(raw.source_of(SnapshotField::Title), Some(JSON_LD_STRATEGY));
    }

    #[test]
    fn aggregate_offer_falls_back_to_low_price() {
        let html = r#"<script type="application/ld+json">
            {"@graph":[{"@type":["Product","Thing"],"name":"Glove",
              "offers":{"@type":"AggregateOffer","lowPrice":120,"highPrice":150}}]}
            </script>"#;
        let raw = extract_product("https://shop.test/products/glove", html, at());
        assert_eq!(raw.title.as_deref(), Some("Glove"));
        assert_eq!(raw.raw_price.as_deref(), Some("120"));
    }

    #[test]
    fn selector_chain_records_the_winning_strategy() {
        let html = r#"
            <h1 class="product-title">  Tactical
                Belt </h1>
            <div class="price">Call us</div>
            <div class="product-price">₪ 349,90</div>
            <div class="color-swatch"><span class="sr-only">Coyote</span></div>
            <div class="color-swatch"><span class="sr-only">Black</span></div>
            <div class="color-swatch"><span class="sr-only">Coyote</span></div>
            <span class="stock-status">Only a few available</span>"#;
        let raw = extract_product("https://shop.test/products/belt", html, at());
        assert_eq!(raw.title.as_deref(), Some("Tactical Belt"));
        assert_eq!(raw.source_of(SnapshotField::Title), Some("h1.product-title"));
        assert_eq!(raw.raw_price.as_deref(), Some("₪ 349,90"));
        assert_eq!(raw.source_of(SnapshotField::Price), Some(".product-price"));
        assert_eq!(raw.variant_labels, vec!["Coyote", "Black"]);
        assert_eq!(raw.raw_stock_status.as_deref(), Some("In Stock"));
        assert_eq!(raw.source_of(SnapshotField::StockStatus), Some(".stock-status"));
        assert!(raw.images.is_empty());
        assert_eq!(raw.source_of(SnapshotField::Images), None);
    }

    #[test]
    fn missing_everything_is_an_empty_snapshot_not_an_error() {
        let raw = extract_product("https://shop.test/products/x", "<html><body></body></html>", at());
        assert_eq!(raw, RawSnapshot::empty("https://shop.test/products/x", at()));
    }

    #[test]
    fn stock_text_priority_prefers_out_of_stock() {
        assert_eq!(classify_stock_text("Sold out - available soon"), Some(StockStatus::OutOfStock));
        assert_eq!(classify_stock_text("ADD TO CART"), Some(StockStatus::InStock));
        assert_eq!(classify_stock_text("Pre-order now"), Some(StockStatus::PreOrder));
        assert_eq!(classify_stock_text("Ships in 3 days"), None);
    }

    #[test]
    fn unclassified_stock_text_falls_through_to_next_strategy() {
        let html = r#"
            <div class="product-inventory">Ships in 3 days</div>
            <button class="add-to-cart-button">Add to cart</button>"#;
        let raw = extract_product("https://shop.test/products/x", html, at());
        assert_eq!(raw.raw_stock_status.as_deref(), Some("In Stock"));
        assert_eq!(raw.source_of(SnapshotField::StockStatus), Some(".add-to-cart-button"));
    }

    fn scripted_site() -> Arc<FixtureSite> {
        let mut manifest = FixtureManifest {
            base_url: "https://shop.test/collections/all".to_string(),
            ..FixtureManifest::default()
        };
        manifest
            .pages
            .insert("https://shop.test/products/a".into(), "a.html".into());
        manifest
            .pages
            .insert("https://shop.test/products/b".into(), "b.html".into());
        manifest.redirects.insert(
            "https://shop.test/products/a".into(),
            FixtureRedirect {
                to: "https://shop.test/products/b".into(),
                times: Some(1),
            },
        );
        manifest.flaky.insert("https://shop.test/products/b".into(), 1);

        let pages = HashMap::from([
            ("https://shop.test/products/a".to_string(), "<body>a</body>".to_string()),
            ("https://shop.test/products/b".to_string(), "<body>b</body>".to_string()),
        ]);
        Arc::new(FixtureSite { manifest, pages })
    }

    #[tokio::test]
    async fn fixture_renderer_serves_redirect_until_reload() {
        let site = scripted_site();
        let mut renderer = site.renderer();
        renderer.navigate("https://shop.test/products/a").await.unwrap();
        assert_eq!(renderer.current_url(), Some("https://shop.test/products/b"));
        renderer.reload().await.unwrap();
        assert_eq!(renderer.current_url(), Some("https://shop.test/products/a"));
        assert_eq!(renderer.page_source().await.unwrap(), "<body>a</body>");
        renderer
            .wait_for_ready("body", Duration::from_secs(1))
            .await
            .unwrap();
        let missing = renderer
            .wait_for_ready("main.product", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(missing, RenderError::ReadyTimeout { .. }));
    }

    #[tokio::test]
    async fn fixture_renderer_flaky_navigation_recovers() {
        let site = scripted_site();
        let mut renderer = site.renderer();
        let first = renderer.navigate("https://shop.test/products/b").await.unwrap_err();
        assert!(first.is_transient());
        renderer.navigate("https://shop.test/products/b").await.unwrap();
        assert_eq!(renderer.navigations_to("https://shop.test/products/b"), 2);
    }
}
