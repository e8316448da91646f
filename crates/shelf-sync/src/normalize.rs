//! Pure, total conversion of raw extraction output into typed history records.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_core::{Category, NormalizedSnapshot, RawSnapshot, StockStatus, VariantRecord, VariantType};
use tracing::info;
use uuid::Uuid;

/// Digits, `.` and `,` only; `,` read as the decimal point. Anything unparseable is 0.0.
pub fn clean_price(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return 0.0;
    };
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => value,
        _ => 0.0,
    }
}

/// Maps schema.org availability URIs (any scheme, any case) and extractor labels onto the enum.
pub fn normalize_stock_token(raw: Option<&str>) -> StockStatus {
    let Some(raw) = raw else {
        return StockStatus::Unknown;
    };
    let tail = raw.trim().rsplit('/').next().unwrap_or_default();
    let token: String = tail
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    match token.as_str() {
        "instock" => StockStatus::InStock,
        "outofstock" | "soldout" => StockStatus::OutOfStock,
        "preorder" | "presale" => StockStatus::PreOrder,
        _ => StockStatus::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub keyword: String,
    pub category: Category,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

/// Keyword table scanned longest keyword first; equal lengths keep table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRules {
    rules: Vec<CategoryRule>,
}

const BUILTIN_CATEGORY_KEYWORDS: &[(&str, Category)] = &[
    ("קרמון", Category::PlateCarriers),
    ("חגורת", Category::Belts),
    ("פאוץ", Category::Pouches),
    ("כפפות", Category::Gloves),
    ("כובע", Category::Hats),
    ("משקפי", Category::Glasses),
    ("פאנל", Category::Panels),
    ("פאץ", Category::Patches),
    ("שרוול", Category::Sleeves),
    ("ער\"ד", Category::Medical),
    ("פלטה", Category::Plates),
    ("מערכת", Category::Systems),
    ("plate carrier", Category::PlateCarriers),
    ("belt", Category::Belts),
    ("pouch", Category::Pouches),
    ("glove", Category::Gloves),
    ("goggles", Category::Glasses),
    ("glasses", Category::Glasses),
    ("panel", Category::Panels),
    ("patch", Category::Patches),
    ("sleeve", Category::Sleeves),
    ("tourniquet", Category::Medical),
    ("ifak", Category::Medical),
    ("plate", Category::Plates),
    ("system", Category::Systems),
];

impl CategoryRules {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        let mut rules: Vec<CategoryRule> = rules
            .into_iter()
            .filter(|rule| !rule.keyword.trim().is_empty())
            .map(|rule| CategoryRule {
                keyword: rule.keyword.trim().to_lowercase(),
                category: rule.category,
            })
            .collect();
        // stable: ties keep their table position
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.keyword.chars().count()));
        Self { rules }
    }

    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_CATEGORY_KEYWORDS
                .iter()
                .map(|(keyword, category)| CategoryRule {
                    keyword: (*keyword).to_string(),
                    category: *category,
                })
                .collect(),
        )
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    pub fn categorize(&self, title: &str) -> Category {
        let title = title.to_lowercase();
        self.rules
            .iter()
            .find(|rule| title.contains(&rule.keyword))
            .map(|rule| rule.category)
            .unwrap_or(Category::Other)
    }
}

/// Keyword lists for variant typing; both match as case-insensitive substrings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRules {
    pub colors: Vec<String>,
    pub sizes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct VariantRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(flatten)]
    rules: VariantRules,
}

impl VariantRules {
    pub fn builtin() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect();
        Self {
            colors: words(&[
                "black", "white", "red", "blue", "green", "coyote", "olive", "khaki", "multicam",
            ]),
            sizes: words(&["xs", "s", "m", "l", "xl", "xxl", "xxxl"]),
        }
    }

    pub fn classify(&self, label: &str) -> BTreeSet<VariantType> {
        let lower = label.to_lowercase();
        let mut types = BTreeSet::new();
        if contains_any(&lower, &self.colors) {
            types.insert(VariantType::Color);
        }
        if contains_any(&lower, &self.sizes) {
            types.insert(VariantType::Size);
        }
        types
    }
}

fn contains_any(haystack: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && haystack.contains(&keyword.to_lowercase()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerRules {
    pub categories: CategoryRules,
    pub variants: VariantRules,
}

impl Default for NormalizerRules {
    fn default() -> Self {
        Self {
            categories: CategoryRules::builtin(),
            variants: VariantRules::builtin(),
        }
    }
}

impl NormalizerRules {
    /// Loads `rules/categories.yaml` and `rules/variants.yaml`; each missing file keeps its builtin table.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let mut rules = Self::default();

        let categories_path = rules_dir.join("categories.yaml");
        if categories_path.exists() {
            let text = std::fs::read_to_string(&categories_path)
                .with_context(|| format!("reading {}", categories_path.display()))?;
            let file: CategoryRulesFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", categories_path.display()))?;
            rules.categories = CategoryRules::new(file.rules);
            info!(count = rules.categories.rules().len(), "loaded category rules");
        }

        let variants_path = rules_dir.join("variants.yaml");
        if variants_path.exists() {
            let text = std::fs::read_to_string(&variants_path)
                .with_context(|| format!("reading {}", variants_path.display()))?;
            let file: VariantRulesFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", variants_path.display()))?;
            rules.variants = file.rules;
        }

        Ok(rules)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    rules: NormalizerRules,
}

impl Normalizer {
    pub fn new(rules: NormalizerRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &NormalizerRules {
        &self.rules
    }

    /// Never fails. Unparseable fields fall back to price 0.0, `Other`, `Unknown`.
    pub fn normalize(&self, raw: &RawSnapshot, processed_at: DateTime<Utc>) -> NormalizedSnapshot {
        let title = raw.title.as_deref().map(str::trim).unwrap_or_default().to_string();
        let variants: Vec<VariantRecord> = raw
            .variant_labels
            .iter()
            .map(|label| VariantRecord {
                name: label.clone(),
                types: self.rules.variants.classify(label),
            })
            .collect();
        let variant_types = variants
            .iter()
            .flat_map(|variant| variant.types.iter().copied())
            .collect();

        NormalizedSnapshot {
            id: Uuid::new_v4(),
            product_url: raw.url.clone(),
            category: self.rules.categories.categorize(&title),
            title,
            description: raw.description.as_deref().map(str::trim).unwrap_or_default().to_string(),
            price: clean_price(raw.raw_price.as_deref()),
            stock_status: normalize_stock_token(raw.raw_stock_status.as_deref()),
            variant_count: variants.len(),
            variants,
            variant_types,
            image_count: raw.images.len(),
            first_image_url: raw.images.first().cloned(),
            image_urls: raw.images.clone(),
            processing_timestamp: processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn price_cleaning_matches_catalog_formats() {
        assert_eq!(clean_price(Some("₪ 349,90")), 349.9);
        assert_eq!(clean_price(Some("1290.00")), 1290.0);
        assert_eq!(clean_price(Some("189")), 189.0);
        assert_eq!(clean_price(Some("Price on request")), 0.0);
        assert_eq!(clean_price(Some("1,290.00")), 0.0);
        assert_eq!(clean_price(Some("-5")), 5.0);
        assert_eq!(clean_price(None), 0.0);
    }

    #[test]
    fn stock_tokens_accept_uris_and_labels() {
        assert_eq!(normalize_stock_token(Some("http://schema.org/InStock")), StockStatus::InStock);
        assert_eq!(normalize_stock_token(Some("https://SCHEMA.org/OutOfStock")), StockStatus::OutOfStock);
        assert_eq!(normalize_stock_token(Some("https://schema.org/SoldOut")), StockStatus::OutOfStock);
        assert_eq!(normalize_stock_token(Some("https://schema.org/PreSale")), StockStatus::PreOrder);
        assert_eq!(normalize_stock_token(Some("Out of Stock")), StockStatus::OutOfStock);
        assert_eq!(normalize_stock_token(Some("Pre-order")), StockStatus::PreOrder);
        assert_eq!(normalize_stock_token(Some("https://schema.org/Discontinued")), StockStatus::Unknown);
        assert_eq!(normalize_stock_token(None), StockStatus::Unknown);
    }

    #[test]
    fn longest_keyword_wins_and_unmatched_is_other() {
        let rules = CategoryRules::builtin();
        assert_eq!(rules.categorize("קרמון Ranger Plate Carrier"), Category::PlateCarriers);
        assert_eq!(rules.categorize("Ceramic Plate Insert"), Category::Plates);
        assert_eq!(rules.categorize("פאוץ למחסניות"), Category::Pouches);
        assert_eq!(rules.categorize("ערכת ער\"ד אישית"), Category::Medical);
        assert_eq!(rules.categorize("Gift card"), Category::Other);
        assert_eq!(rules.categorize(""), Category::Other);
    }

    #[test]
    fn equal_length_keywords_keep_table_order() {
        let rules = CategoryRules::new(vec![
            CategoryRule {
                keyword: "pouch".into(),
                category: Category::Pouches,
            },
            CategoryRule {
                keyword: "plate".into(),
                category: Category::Plates,
            },
        ]);
        assert_eq!(rules.categorize("plate pouch"), Category::Pouches);
    }

    #[test]
    fn variant_keywords_match_as_substrings() {
        let rules = VariantRules::builtin();
        assert_eq!(
            rules.classify("Black / M"),
            BTreeSet::from([VariantType::Color, VariantType::Size])
        );
        assert_eq!(rules.classify("Small"), BTreeSet::from([VariantType::Size]));
        assert_eq!(rules.classify("XL-Tall"), BTreeSet::from([VariantType::Size]));
        assert_eq!(rules.classify("Ranger Green"), BTreeSet::from([VariantType::Color]));
        assert_eq!(rules.classify("Navy"), BTreeSet::new());
        assert_eq!(rules.classify(""), BTreeSet::new());
    }

    fn raw_fixture() -> RawSnapshot {
        let mut raw = RawSnapshot::empty(
            "https://shop.test/products/ranger",
            DateTime::parse_from_rfc3339("2026-02-24T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        raw.title = Some(" קרמון Ranger ".into());
        raw.raw_price = Some("1290.00".into());
        raw.images = vec!["https://cdn.test/1.jpg".into(), "https://cdn.test/2.jpg".into()];
        raw.variant_labels = vec!["Black / M".into(), "Coyote / L".into(), "Navy".into()];
        raw.raw_stock_status = Some("http://schema.org/InStock".into());
        raw
    }

    #[test]
    fn normalize_fills_counts_and_types() {
        let normalizer = Normalizer::default();
        let snapshot = normalizer.normalize(&raw_fixture(), Utc::now());
        assert_eq!(snapshot.title, "קרמון Ranger");
        assert_eq!(snapshot.category, Category::PlateCarriers);
        assert_eq!(snapshot.price, 1290.0);
        assert_eq!(snapshot.stock_status, StockStatus::InStock);
        assert_eq!(snapshot.variant_count, 3);
        assert_eq!(
            snapshot.variant_types,
            BTreeSet::from([VariantType::Color, VariantType::Size])
        );
        assert!(snapshot.variants[2].types.is_empty());
        assert_eq!(snapshot.image_count, 2);
        assert_eq!(snapshot.first_image_url.as_deref(), Some("https://cdn.test/1.jpg"));
    }

    #[test]
    fn normalizing_twice_differs_only_in_identity_and_time() {
        let normalizer = Normalizer::default();
        let raw = raw_fixture();
        let first = normalizer.normalize(&raw, Utc::now());
        let mut second = normalizer.normalize(&raw, Utc::now() + chrono::Duration::seconds(5));
        assert_ne!(first.id, second.id);
        second.id = first.id;
        second.processing_timestamp = first.processing_timestamp;
        assert_eq!(first, second);
    }

    #[test]
    fn yaml_rules_override_builtin_tables() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/categories.yaml"),
            "version: 1\nrules:\n  - keyword: vest\n    category: plate_carriers\n",
        )
        .unwrap();
        let rules = NormalizerRules::from_workspace_root(dir.path()).unwrap();
        assert_eq!(rules.categories.categorize("Light Vest"), Category::PlateCarriers);
        assert_eq!(rules.categories.categorize("Tactical Belt"), Category::Other);
        assert_eq!(rules.variants, VariantRules::builtin());
    }

    #[test]
    fn shipped_rule_files_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let rules = NormalizerRules::from_workspace_root(&root).unwrap();
        assert_eq!(rules.categories.categorize("חגורת Tactical Belt"), Category::Belts);
        assert!(rules.variants.sizes.iter().any(|s| s == "xl"));
    }

    proptest! {
        #[test]
        fn price_is_total_and_non_negative(raw in ".*") {
            let price = clean_price(Some(&raw));
            prop_assert!(price.is_finite());
            prop_assert!(price >= 0.0);
        }

        #[test]
        fn category_lookup_is_deterministic(title in "\\PC*") {
            let rules = CategoryRules::builtin();
            prop_assert_eq!(rules.categorize(&title), rules.categorize(&title));
        }

        #[test]
        fn normalize_never_panics(
            title in proptest::option::of("\\PC*"),
            price in proptest::option::of("\\PC*"),
            stock in proptest::option::of("\\PC*"),
            labels in proptest::collection::vec("\\PC{0,12}", 0..6),
        ) {
            let mut raw = RawSnapshot::empty("https://shop.test/products/p", Utc::now());
            raw.title = title;
            raw.raw_price = price;
            raw.raw_stock_status = stock;
            raw.variant_labels = labels.clone();
            let snapshot = Normalizer::default().normalize(&raw, Utc::now());
            prop_assert_eq!(snapshot.variant_count, labels.len());
            prop_assert!(snapshot.price >= 0.0);
        }
    }
}
