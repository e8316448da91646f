//! Read-only derivations over the full snapshot history.
//!
//! Every function takes the complete history as returned by one `query_all` call and keeps no state
//! between invocations.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use shelf_core::{Category, NormalizedSnapshot, StockStatus, VariantType};

pub const CRATE_NAME: &str = "shelf-analytics";

/// Default bucket width for the time series.
pub fn hourly() -> Duration {
    Duration::hours(1)
}

/// Floors `ts` to a multiple of `width` since the Unix epoch. Non-positive widths leave `ts` as is.
pub fn bucket_start(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds();
    if width_ms <= 0 {
        return ts;
    }
    let millis = ts.timestamp_millis();
    DateTime::from_timestamp_millis(millis - millis.rem_euclid(width_ms)).unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevelBucket {
    pub bucket_start: DateTime<Utc>,
    pub total_in_stock: usize,
    pub category_in_stock_counts: BTreeMap<Category, usize>,
}

/// A single bucket is a valid answer that still cannot show a trend.
///
/// Serializes as `{"state": ..., "buckets": [...]}` in every state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockLevelSeries {
    Empty,
    Insufficient(StockLevelBucket),
    Trend(Vec<StockLevelBucket>),
}

impl StockLevelSeries {
    pub fn state(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Insufficient(_) => "insufficient",
            Self::Trend(_) => "trend",
        }
    }

    pub fn buckets(&self) -> &[StockLevelBucket] {
        match self {
            Self::Empty => &[],
            Self::Insufficient(bucket) => std::slice::from_ref(bucket),
            Self::Trend(buckets) => buckets,
        }
    }
}

impl Serialize for StockLevelSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("StockLevelSeries", 2)?;
        out.serialize_field("state", self.state())?;
        out.serialize_field("buckets", self.buckets())?;
        out.end()
    }
}

pub fn stock_level_series(snapshots: &[NormalizedSnapshot], width: Duration) -> StockLevelSeries {
    let mut buckets: BTreeMap<DateTime<Utc>, StockLevelBucket> = BTreeMap::new();
    for snapshot in snapshots
        .iter()
        .filter(|s| s.stock_status == StockStatus::InStock)
    {
        let start = bucket_start(snapshot.processing_timestamp, width);
        let bucket = buckets.entry(start).or_insert_with(|| StockLevelBucket {
            bucket_start: start,
            total_in_stock: 0,
            category_in_stock_counts: BTreeMap::new(),
        });
        bucket.total_in_stock += 1;
        *bucket
            .category_in_stock_counts
            .entry(snapshot.category)
            .or_default() += 1;
    }

    let mut buckets: Vec<StockLevelBucket> = buckets.into_values().collect();
    match buckets.len() {
        0 => StockLevelSeries::Empty,
        1 => StockLevelSeries::Insufficient(buckets.remove(0)),
        _ => StockLevelSeries::Trend(buckets),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemandScore {
    pub title: String,
    pub url: String,
    pub category: Category,
    pub demand_score: u32,
}

/// `InsufficientHistory` means fewer than two capture times exist store-wide, which is
/// different from a ranking where nothing sold out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "items", rename_all = "snake_case")]
pub enum DemandReport {
    InsufficientHistory,
    Ranked(Vec<DemandScore>),
}

fn group_by_product(snapshots: &[NormalizedSnapshot]) -> BTreeMap<&str, Vec<&NormalizedSnapshot>> {
    let mut groups: BTreeMap<&str, Vec<&NormalizedSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        groups
            .entry(snapshot.product_url.as_str())
            .or_default()
            .push(snapshot);
    }
    for group in groups.values_mut() {
        // stable: equal timestamps keep insertion order
        group.sort_by_key(|s| s.processing_timestamp);
    }
    groups
}

/// Count of InStock -> OutOfStock transitions between consecutive snapshots of one product.
pub fn sold_out_transitions(history: &[&NormalizedSnapshot]) -> u32 {
    history
        .windows(2)
        .filter(|pair| {
            pair[0].stock_status == StockStatus::InStock
                && pair[1].stock_status == StockStatus::OutOfStock
        })
        .count() as u32
}

pub fn demand_scores(snapshots: &[NormalizedSnapshot]) -> DemandReport {
    let distinct_times: BTreeSet<DateTime<Utc>> =
        snapshots.iter().map(|s| s.processing_timestamp).collect();
    if distinct_times.len() < 2 {
        return DemandReport::InsufficientHistory;
    }

    let mut scores: Vec<DemandScore> = group_by_product(snapshots)
        .into_iter()
        .filter_map(|(url, history)| {
            let score = sold_out_transitions(&history);
            let latest = history.last()?;
            (score > 0).then(|| DemandScore {
                title: latest.title.clone(),
                url: url.to_string(),
                category: latest.category,
                demand_score: score,
            })
        })
        .collect();
    scores.sort_by(|a, b| b.demand_score.cmp(&a.demand_score).then_with(|| a.url.cmp(&b.url)));
    DemandReport::Ranked(scores)
}

/// Current state per product: its snapshot with the greatest processing time. Sorted by URL.
pub fn latest_snapshots(snapshots: &[NormalizedSnapshot]) -> Vec<&NormalizedSnapshot> {
    let mut latest: HashMap<&str, &NormalizedSnapshot> = HashMap::new();
    for snapshot in snapshots {
        latest
            .entry(snapshot.product_url.as_str())
            .and_modify(|current| {
                if snapshot.processing_timestamp >= current.processing_timestamp {
                    *current = snapshot;
                }
            })
            .or_insert(snapshot);
    }
    let mut latest: Vec<&NormalizedSnapshot> = latest.into_values().collect();
    latest.sort_by(|a, b| a.product_url.cmp(&b.product_url));
    latest
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductState {
    pub title: String,
    pub url: String,
    pub category: Category,
    pub price: f64,
    pub stock_status: StockStatus,
    pub last_seen: DateTime<Utc>,
}

impl From<&NormalizedSnapshot> for ProductState {
    fn from(snapshot: &NormalizedSnapshot) -> Self {
        Self {
            title: snapshot.title.clone(),
            url: snapshot.product_url.clone(),
            category: snapshot.category,
            price: snapshot.price,
            stock_status: snapshot.stock_status,
            last_seen: snapshot.processing_timestamp,
        }
    }
}

pub fn currently_out_of_stock(snapshots: &[NormalizedSnapshot]) -> Vec<ProductState> {
    latest_snapshots(snapshots)
        .into_iter()
        .filter(|s| s.stock_status == StockStatus::OutOfStock)
        .map(ProductState::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStockout {
    pub category: Category,
    pub in_stock: usize,
    pub out_of_stock: usize,
    pub stockout_rate_percent: f64,
}

pub fn stockout_rates_by_category(snapshots: &[NormalizedSnapshot]) -> Vec<CategoryStockout> {
    let mut counts: BTreeMap<Category, (usize, usize)> = BTreeMap::new();
    for snapshot in latest_snapshots(snapshots) {
        let entry = counts.entry(snapshot.category).or_default();
        match snapshot.stock_status {
            StockStatus::InStock => entry.0 += 1,
            StockStatus::OutOfStock => entry.1 += 1,
            StockStatus::PreOrder | StockStatus::Unknown => {}
        }
    }

    let mut rates: Vec<CategoryStockout> = counts
        .into_iter()
        .filter(|(_, (in_stock, out_of_stock))| in_stock + out_of_stock > 0)
        .map(|(category, (in_stock, out_of_stock))| CategoryStockout {
            category,
            in_stock,
            out_of_stock,
            stockout_rate_percent: out_of_stock as f64 * 100.0 / (in_stock + out_of_stock) as f64,
        })
        .collect();
    rates.sort_by(|a, b| {
        b.stockout_rate_percent
            .total_cmp(&a.stockout_rate_percent)
            .then_with(|| a.category.cmp(&b.category))
    });
    rates
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantTypeBucket {
    pub bucket_start: DateTime<Utc>,
    pub products_with_color: usize,
    pub products_with_size: usize,
}

pub fn variant_type_series(snapshots: &[NormalizedSnapshot], width: Duration) -> Vec<VariantTypeBucket> {
    let mut buckets: BTreeMap<DateTime<Utc>, (BTreeSet<&str>, BTreeSet<&str>)> = BTreeMap::new();
    for snapshot in snapshots {
        let (colors, sizes) = buckets
            .entry(bucket_start(snapshot.processing_timestamp, width))
            .or_default();
        if snapshot.variant_types.contains(&VariantType::Color) {
            colors.insert(snapshot.product_url.as_str());
        }
        if snapshot.variant_types.contains(&VariantType::Size) {
            sizes.insert(snapshot.product_url.as_str());
        }
    }
    buckets
        .into_iter()
        .map(|(bucket_start, (colors, sizes))| VariantTypeBucket {
            bucket_start,
            products_with_color: colors.len(),
            products_with_size: sizes.len(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogStatistics {
    pub total_products: usize,
    /// Price figures ignore unparsed (0.0) prices; `None` when no product has a known price.
    pub average_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub products_with_variants: usize,
    pub average_variants_per_product: f64,
    pub products_with_images: usize,
    pub average_images_per_product: f64,
}

pub fn catalog_statistics(snapshots: &[NormalizedSnapshot]) -> CatalogStatistics {
    let latest = latest_snapshots(snapshots);
    let total = latest.len();
    let prices: Vec<f64> = latest
        .iter()
        .filter(|s| s.has_known_price())
        .map(|s| s.price)
        .collect();
    let mean = |sum: usize| if total == 0 { 0.0 } else { sum as f64 / total as f64 };

    CatalogStatistics {
        total_products: total,
        average_price: (!prices.is_empty()).then(|| prices.iter().sum::<f64>() / prices.len() as f64),
        min_price: prices.iter().copied().reduce(f64::min),
        max_price: prices.iter().copied().reduce(f64::max),
        products_with_variants: latest.iter().filter(|s| s.variant_count > 0).count(),
        average_variants_per_product: mean(latest.iter().map(|s| s.variant_count).sum()),
        products_with_images: latest.iter().filter(|s| s.image_count > 0).count(),
        average_images_per_product: mean(latest.iter().map(|s| s.image_count).sum()),
    }
}
