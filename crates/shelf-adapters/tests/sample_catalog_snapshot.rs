use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shelf_adapters::{
    discover_pages, extract_product, parse_product_links, read_json_file, FixtureSite,
    ListingFetcher, PageRenderer,
};
use shelf_core::RawSnapshot;
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn catalog_dir() -> PathBuf {
    workspace_root().join("fixtures").join("sample-catalog")
}

fn captured_at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-02-24T09:00:00Z")
        .expect("ts")
        .with_timezone(&Utc)
}

const PRODUCTS: [&str; 5] = [
    "https://shop.test/products/ranger-plate-carrier",
    "https://shop.test/products/tactical-belt",
    "https://shop.test/products/glove-pro",
    "https://shop.test/products/patch-pack",
    "https://shop.test/products/field-cap",
];

#[test]
fn golden_extraction_snapshot_sample_catalog() {
    let site = FixtureSite::load(catalog_dir()).expect("load fixture site");
    let actual: Vec<RawSnapshot> = PRODUCTS
        .iter()
        .map(|url| {
            let html = site.page(url).expect("captured product page");
            extract_product(url, html, captured_at())
        })
        .collect();
    let expected: Vec<RawSnapshot> =
        read_json_file(catalog_dir().join("snapshot.json")).expect("golden snapshot");
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn listing_pages_and_links_cover_the_catalog() {
    let site = FixtureSite::load(catalog_dir()).expect("load fixture site");
    let run_id = Uuid::new_v4();
    let first = site
        .fetch_listing(run_id, site.base_url())
        .await
        .expect("first listing page");
    let pages = discover_pages(site.base_url(), &first.body).expect("discover");
    assert_eq!(
        pages,
        vec![
            "https://shop.test/collections/all",
            "https://shop.test/collections/all?page=2",
            "https://shop.test/collections/all?page=3",
        ]
    );

    let mut links = Vec::new();
    for page in &pages {
        let fetched = site.fetch_listing(run_id, page).await.expect("listing page");
        links.extend(parse_product_links(page, &fetched.body).expect("links"));
    }
    assert_eq!(
        links,
        vec![
            "https://shop.test/products/ranger-plate-carrier",
            "https://shop.test/products/tactical-belt",
            "https://shop.test/products/stale-redirect",
            "https://shop.test/products/glove-pro",
            "https://shop.test/products/patch-pack",
            "https://shop.test/products/broken",
            "https://shop.test/products/field-cap",
            "https://shop.test/products/ranger-plate-carrier",
        ]
    );
}

#[tokio::test]
async fn fixture_renderer_applies_manifest_misbehaviour() {
    let site = Arc::new(FixtureSite::load(catalog_dir()).expect("load fixture site"));
    let mut renderer = site.renderer();

    renderer
        .navigate("https://shop.test/products/stale-redirect")
        .await
        .expect("redirected navigation");
    assert_eq!(
        renderer.current_url(),
        Some("https://shop.test/products/tactical-belt")
    );

    let err = renderer
        .navigate("https://shop.test/products/broken")
        .await
        .expect_err("scripted failure");
    assert!(err.is_transient());
}
