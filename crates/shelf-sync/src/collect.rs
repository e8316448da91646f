//! Product discovery and the one-at-a-time rendering loop of a collection run.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use shelf_adapters::{
    canonical_listing_url, discover_pages, extract_product, parse_product_links, AdapterError,
    ListingFetcher, PageRenderer, RenderError,
};
use shelf_core::{url_slug, RawSnapshot, RunStatus};
use shelf_storage::StoreError;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Retry, settle and pacing knobs for one run.
#[derive(Debug, Clone)]
pub struct CollectionPolicy {
    pub nav_attempts: usize,
    pub nav_backoff: Duration,
    pub verify_attempts: usize,
    pub verify_settle: Duration,
    pub reload_settle: Duration,
    pub ready_selector: String,
    pub ready_timeout: Duration,
    pub cooldown: Duration,
    pub listing_workers: usize,
    pub max_products: Option<usize>,
    pub first_page_only: bool,
}

impl Default for CollectionPolicy {
    fn default() -> Self {
        Self {
            nav_attempts: 3,
            nav_backoff: Duration::from_secs(2),
            verify_attempts: 3,
            verify_settle: Duration::from_secs(2),
            reload_settle: Duration::from_secs(3),
            ready_selector: "body".to_string(),
            ready_timeout: Duration::from_secs(15),
            cooldown: Duration::from_secs(3),
            listing_workers: 5,
            max_products: None,
            first_page_only: false,
        }
    }
}

impl CollectionPolicy {
    /// Same retry counts, no waiting. Used for fixture runs.
    pub fn without_delays(mut self) -> Self {
        self.nav_backoff = Duration::ZERO;
        self.verify_settle = Duration::ZERO;
        self.reload_settle = Duration::ZERO;
        self.cooldown = Duration::ZERO;
        self
    }
}

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("navigation failed after {attempts} attempts: {source}")]
    TransientNavigation {
        attempts: usize,
        #[source]
        source: RenderError,
    },
    #[error("expected `{expected}` but landed on `{landed}` after {attempts} checks")]
    VerificationMismatch {
        expected: String,
        landed: String,
        attempts: usize,
    },
    #[error("`{selector}` not ready within {timeout:?}")]
    ReadinessTimeout { selector: String, timeout: Duration },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("storing snapshot: {0}")]
    StoreWrite(#[from] StoreError),
}

impl ProductError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNavigation { .. } => "navigation",
            Self::VerificationMismatch { .. } => "verification",
            Self::ReadinessTimeout { .. } => "readiness",
            Self::Render(_) => "render",
            Self::StoreWrite(_) => "store",
        }
    }
}

/// Failures that stop a run before any product is attempted.
#[derive(Debug, Error)]
pub enum RunSetupError {
    #[error("listing discovery failed for {url}: {source}")]
    Discovery {
        url: String,
        #[source]
        source: AdapterError,
    },
    #[error("renderer could not start: {0}")]
    Renderer(#[source] RenderError),
    #[error("run aborted before completion")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductFailure {
    pub url: String,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ProductFailure>,
    pub status: RunStatus,
}

impl RunSummary {
    const SUMMARY_LINES: usize = 10;

    pub fn error_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let mut lines: Vec<String> = self
            .failures
            .iter()
            .take(Self::SUMMARY_LINES)
            .map(|f| format!("{}: {}", f.url, f.reason))
            .collect();
        if self.failures.len() > Self::SUMMARY_LINES {
            lines.push(format!("... and {} more", self.failures.len() - Self::SUMMARY_LINES));
        }
        Some(lines.join("\n"))
    }
}

/// Receives every successfully extracted product, in collection order.
#[async_trait]
pub trait ProductSink: Send {
    /// Called once per product before any navigation for it starts.
    fn begin(&mut self, _url: &str) {}

    async fn accept(&mut self, raw: &RawSnapshot) -> Result<(), StoreError>;
}

#[async_trait]
impl ProductSink for Vec<RawSnapshot> {
    async fn accept(&mut self, raw: &RawSnapshot) -> Result<(), StoreError> {
        self.push(raw.clone());
        Ok(())
    }
}

pub struct CollectionEngine<'a> {
    listings: &'a dyn ListingFetcher,
    policy: CollectionPolicy,
    run_id: Uuid,
}

impl<'a> CollectionEngine<'a> {
    pub fn new(listings: &'a dyn ListingFetcher, policy: CollectionPolicy, run_id: Uuid) -> Self {
        Self {
            listings,
            policy,
            run_id,
        }
    }

    /// Listing pages reachable from `base_url` followed by the unique product URLs, first-seen order.
    pub async fn discover_products(&self, base_url: &str) -> Result<Vec<String>, RunSetupError> {
        let discovery_error = |source| RunSetupError::Discovery {
            url: base_url.to_string(),
            source,
        };
        let base = canonical_listing_url(base_url).map_err(discovery_error)?;
        let first = self
            .listings
            .fetch_listing(self.run_id, base_url)
            .await
            .map_err(discovery_error)?;
        let pages = if self.policy.first_page_only {
            vec![base.clone()]
        } else {
            discover_pages(base_url, &first.body).map_err(discovery_error)?
        };
        let first_links = parse_product_links(base_url, &first.body).map_err(discovery_error)?;
        info!(run_id = %self.run_id, pages = pages.len(), "listing pages discovered");

        let run_id = self.run_id;
        let listings = self.listings;
        let first_links = &first_links;
        let base = base.as_str();
        let harvest: Pin<Box<dyn Future<Output = Vec<(usize, Vec<String>)>> + Send + '_>> = Box::pin(stream::iter(pages.iter().enumerate())
            .map(|(index, page)| async move {
                if page == base {
                    return (index, first_links.clone());
                }
                let links = match listings.fetch_listing(run_id, page).await {
                    Ok(fetched) => parse_product_links(page, &fetched.body).unwrap_or_else(|err| {
                        warn!(page = %page, error = %err, "unparseable listing page");
                        Vec::new()
                    }),
                    Err(err) => {
                        warn!(page = %page, error = %err, "listing page fetch failed; skipping");
                        Vec::new()
                    }
                };
                (index, links)
            })
            .buffer_unordered(self.policy.listing_workers.max(1))
            .collect());
        let mut harvested = harvest.await;
        harvested.sort_by_key(|(index, _)| *index);

        let mut seen = HashSet::new();
        let mut products: Vec<String> = harvested
            .into_iter()
            .flat_map(|(_, links)| links)
            .filter(|link| seen.insert(link.clone()))
            .collect();
        if let Some(max) = self.policy.max_products {
            products.truncate(max);
        }
        info!(run_id = %self.run_id, products = products.len(), "product urls harvested");
        Ok(products)
    }

    /// Collects the whole catalog into memory, in processing order.
    pub async fn collect<R>(
        &self,
        base_url: &str,
        renderer: &mut R,
    ) -> Result<(Vec<RawSnapshot>, RunSummary), RunSetupError>
    where
        R: PageRenderer + ?Sized,
    {
        let mut batch = Vec::new();
        let summary = self.collect_with(base_url, renderer, &mut batch).await?;
        Ok((batch, summary))
    }

    pub async fn collect_with<R, S>(
        &self,
        base_url: &str,
        renderer: &mut R,
        sink: &mut S,
    ) -> Result<RunSummary, RunSetupError>
    where
        R: PageRenderer + ?Sized,
        S: ProductSink + ?Sized,
    {
        let started_at = Utc::now();
        let products = self.discover_products(base_url).await?;

        let mut succeeded = 0;
        let mut failures = Vec::new();
        for (index, url) in products.iter().enumerate() {
            let span = info_span!("product", run_id = %self.run_id, url = %url);
            sink.begin(url);
            match self.collect_product(renderer, sink, url).instrument(span).await {
                Ok(()) => succeeded += 1,
                Err(err) => {
                    warn!(url = %url, kind = err.kind(), error = %err, "product failed");
                    failures.push(ProductFailure {
                        url: url.clone(),
                        kind: err.kind().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
            if index + 1 < products.len() && !self.policy.cooldown.is_zero() {
                tokio::time::sleep(self.policy.cooldown).await;
            }
        }

        let status = if failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        Ok(RunSummary {
            run_id: self.run_id,
            started_at,
            ended_at: Utc::now(),
            attempted: products.len(),
            succeeded,
            failures,
            status,
        })
    }

    async fn collect_product<R, S>(&self, renderer: &mut R, sink: &mut S, url: &str) -> Result<(), ProductError>
    where
        R: PageRenderer + ?Sized,
        S: ProductSink + ?Sized,
    {
        if let Err(err) = renderer.clear_cookies().await {
            warn!(error = %err, "cookie reset failed; continuing with existing session");
        }
        self.navigate_with_retry(renderer, url).await?;
        self.verify_landing(renderer, url).await?;
        self.wait_until_ready(renderer).await?;

        let html = renderer.page_source().await?;
        let raw = extract_product(url, &html, Utc::now());
        debug!(fields = raw.sources.len(), "product extracted");
        sink.accept(&raw).await?;
        Ok(())
    }

    async fn navigate_with_retry<R>(&self, renderer: &mut R, url: &str) -> Result<(), ProductError>
    where
        R: PageRenderer + ?Sized,
    {
        let attempts = self.policy.nav_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match renderer.navigate(url).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %err, "navigation failed; retrying");
                    tokio::time::sleep(self.policy.nav_backoff).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(ProductError::TransientNavigation {
                        attempts: attempt,
                        source: err,
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn verify_landing<R>(&self, renderer: &mut R, url: &str) -> Result<(), ProductError>
    where
        R: PageRenderer + ?Sized,
    {
        let expected = url_slug(url);
        let attempts = self.policy.verify_attempts.max(1);
        for check in 1..=attempts {
            let landed = renderer.current_url().unwrap_or_default().to_string();
            if url_slug(&landed) == expected {
                return Ok(());
            }
            if check == attempts {
                return Err(ProductError::VerificationMismatch {
                    expected: expected.to_string(),
                    landed,
                    attempts,
                });
            }
            warn!(check, landed = %landed, "landed on a different product; reloading");
            tokio::time::sleep(self.policy.verify_settle).await;
            renderer.reload().await?;
            tokio::time::sleep(self.policy.reload_settle).await;
        }
        Ok(())
    }

    async fn wait_until_ready<R>(&self, renderer: &mut R) -> Result<(), ProductError>
    where
        R: PageRenderer + ?Sized,
    {
        let selector = self.policy.ready_selector.as_str();
        let timeout = self.policy.ready_timeout;
        let timed_out = || ProductError::ReadinessTimeout {
            selector: selector.to_string(),
            timeout,
        };
        match tokio::time::timeout(timeout, renderer.wait_for_ready(selector, timeout)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(RenderError::ReadyTimeout { .. })) | Err(_) => Err(timed_out()),
            Ok(Err(err)) => Err(err.into()),
        }
    }
}
