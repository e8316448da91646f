//! Core domain model for Shelf Watch: raw and normalized product snapshots plus run metadata.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-core";

/// Snapshot fields the extractor can populate from more than one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotField {
    Title,
    Price,
    Description,
    Images,
    Variants,
    StockStatus,
}

/// Provenance pointer: which strategy produced a populated raw field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSource {
    pub field: SnapshotField,
    pub strategy: String,
}

/// One extraction attempt for one product page. Empty fields are extraction gaps, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub url: String,
    pub title: Option<String>,
    pub raw_price: Option<String>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub variant_labels: Vec<String>,
    pub raw_stock_status: Option<String>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub sources: Vec<FieldSource>,
}

impl RawSnapshot {
    pub fn empty(url: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            title: None,
            raw_price: None,
            description: None,
            images: Vec::new(),
            variant_labels: Vec::new(),
            raw_stock_status: None,
            captured_at,
            sources: Vec::new(),
        }
    }

    pub fn source_of(&self, field: SnapshotField) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.field == field)
            .map(|s| s.strategy.as_str())
    }

    pub fn record_source(&mut self, field: SnapshotField, strategy: impl Into<String>) {
        self.sources.retain(|s| s.field != field);
        self.sources.push(FieldSource {
            field,
            strategy: strategy.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    OutOfStock,
    PreOrder,
    #[default]
    Unknown,
}

impl StockStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::InStock => "In Stock",
            Self::OutOfStock => "Out of Stock",
            Self::PreOrder => "Pre-order",
            Self::Unknown => "Unknown",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InStock => "in_stock",
            Self::OutOfStock => "out_of_stock",
            Self::PreOrder => "pre_order",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "in_stock" => Some(Self::InStock),
            "out_of_stock" => Some(Self::OutOfStock),
            "pre_order" => Some(Self::PreOrder),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Catalog categories derived from product titles. `Other` is the total fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    PlateCarriers,
    Belts,
    Pouches,
    Gloves,
    Hats,
    Glasses,
    Panels,
    Patches,
    Sleeves,
    Medical,
    Plates,
    Systems,
    #[default]
    Other,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::PlateCarriers,
        Category::Belts,
        Category::Pouches,
        Category::Gloves,
        Category::Hats,
        Category::Glasses,
        Category::Panels,
        Category::Patches,
        Category::Sleeves,
        Category::Medical,
        Category::Plates,
        Category::Systems,
        Category::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::PlateCarriers => "Plate Carriers",
            Self::Belts => "Belts",
            Self::Pouches => "Pouches",
            Self::Gloves => "Gloves",
            Self::Hats => "Hats",
            Self::Glasses => "Glasses",
            Self::Panels => "Panels",
            Self::Patches => "Patches",
            Self::Sleeves => "Sleeves",
            Self::Medical => "Medical",
            Self::Plates => "Plates",
            Self::Systems => "Systems",
            Self::Other => "Other",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlateCarriers => "plate_carriers",
            Self::Belts => "belts",
            Self::Pouches => "pouches",
            Self::Gloves => "gloves",
            Self::Hats => "hats",
            Self::Glasses => "glasses",
            Self::Panels => "panels",
            Self::Patches => "patches",
            Self::Sleeves => "sleeves",
            Self::Medical => "medical",
            Self::Plates => "plates",
            Self::Systems => "systems",
            Self::Other => "other",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantType {
    Color,
    Size,
}

impl VariantType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Size => "size",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "color" => Some(Self::Color),
            "size" => Some(Self::Size),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub name: String,
    pub types: BTreeSet<VariantType>,
}

/// Durable historical unit. Append-only: a product's current state is its latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSnapshot {
    pub id: Uuid,
    pub product_url: String,
    pub title: String,
    pub description: String,
    /// 0.0 means the price was unparseable, not that the product is free.
    pub price: f64,
    pub category: Category,
    pub stock_status: StockStatus,
    pub variants: Vec<VariantRecord>,
    pub variant_count: usize,
    pub variant_types: BTreeSet<VariantType>,
    pub image_urls: Vec<String>,
    pub image_count: usize,
    pub first_image_url: Option<String>,
    pub processing_timestamp: DateTime<Utc>,
}

impl NormalizedSnapshot {
    pub fn has_known_price(&self) -> bool {
        self.price > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Metadata for one end-to-end collection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempted_count: usize,
    pub succeeded_count: usize,
    pub status: RunStatus,
    pub error_summary: Option<String>,
}

impl CollectionRun {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            ended_at: None,
            attempted_count: 0,
            succeeded_count: 0,
            status: RunStatus::Running,
            error_summary: None,
        }
    }

    pub fn finish(
        &self,
        ended_at: DateTime<Utc>,
        attempted_count: usize,
        succeeded_count: usize,
        status: RunStatus,
        error_summary: Option<String>,
    ) -> Self {
        Self {
            id: self.id,
            started_at: self.started_at,
            ended_at: Some(ended_at),
            attempted_count,
            succeeded_count,
            status,
            error_summary,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Last non-empty path segment of a URL with query and fragment removed.
///
/// Used as the product handle when checking that the renderer landed on the requested page.
pub fn url_slug(url: &str) -> &str {
    let without_fragment = url.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}
