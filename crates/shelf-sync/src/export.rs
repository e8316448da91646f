//! Parquet export of a run's snapshots with a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shelf_core::NormalizedSnapshot;
use tokio::fs;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `snapshots/{snapshots,snapshot_images,snapshot_variants}.parquet` under `reports_dir`
/// and returns the path of the accompanying `manifest.json`.
pub async fn export_parquet_snapshots(reports_dir: &Path, snapshots: &[NormalizedSnapshot]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let snapshots_path = snapshot_dir.join("snapshots.parquet");
    let images_path = snapshot_dir.join("snapshot_images.parquet");
    let variants_path = snapshot_dir.join("snapshot_variants.parquet");

    let snapshot_rows = write_snapshots_parquet(&snapshots_path, snapshots)?;
    let image_rows = write_images_parquet(&images_path, snapshots)?;
    let variant_rows = write_variants_parquet(&variants_path, snapshots)?;

    let manifest = ParquetManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        files: vec![
            manifest_entry("snapshots", reports_dir, &snapshots_path, snapshot_rows)?,
            manifest_entry("snapshot_images", reports_dir, &images_path, image_rows)?,
            manifest_entry("snapshot_variants", reports_dir, &variants_path, variant_rows)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_snapshots_parquet(path: &Path, snapshots: &[NormalizedSnapshot]) -> Result<usize> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("product_url", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, false),
        ArrowField::new("price_known", DataType::Boolean, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("stock_status", DataType::Utf8, false),
        ArrowField::new("variant_count", DataType::UInt32, false),
        ArrowField::new("image_count", DataType::UInt32, false),
        ArrowField::new("first_image_url", DataType::Utf8, true),
        ArrowField::new("processing_timestamp", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(snapshots.iter().map(|s| Some(s.id.to_string())).collect::<Vec<_>>());
    let urls = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.product_url.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(snapshots.iter().map(|s| Some(s.title.as_str())).collect::<Vec<_>>());
    let prices = Float64Array::from(snapshots.iter().map(|s| s.price).collect::<Vec<_>>());
    let known = BooleanArray::from(snapshots.iter().map(|s| s.has_known_price()).collect::<Vec<_>>());
    let categories = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.category.as_str()))
            .collect::<Vec<_>>(),
    );
    let stock = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.stock_status.as_str()))
            .collect::<Vec<_>>(),
    );
    let variant_counts = UInt32Array::from(
        snapshots
            .iter()
            .map(|s| s.variant_count as u32)
            .collect::<Vec<_>>(),
    );
    let image_counts = UInt32Array::from(snapshots.iter().map(|s| s.image_count as u32).collect::<Vec<_>>());
    let first_images = StringArray::from(
        snapshots
            .iter()
            .map(|s| s.first_image_url.as_deref())
            .collect::<Vec<_>>(),
    );
    let processed = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.processing_timestamp.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(urls),
            Arc::new(titles),
            Arc::new(prices),
            Arc::new(known),
            Arc::new(categories),
            Arc::new(stock),
            Arc::new(variant_counts),
            Arc::new(image_counts),
            Arc::new(first_images),
            Arc::new(processed),
        ],
    )
    .context("building snapshots record batch")?;
    write_parquet(path, batch)?;
    Ok(snapshots.len())
}

fn write_images_parquet(path: &Path, snapshots: &[NormalizedSnapshot]) -> Result<usize> {
    let rows = snapshots
        .iter()
        .flat_map(|s| {
            s.image_urls
                .iter()
                .enumerate()
                .map(move |(position, url)| (s.id.to_string(), position as u32, url.as_str()))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("snapshot_id", DataType::Utf8, false),
        ArrowField::new("position", DataType::UInt32, false),
        ArrowField::new("image_url", DataType::Utf8, false),
    ]));
    let ids = StringArray::from(rows.iter().map(|(id, _, _)| Some(id.as_str())).collect::<Vec<_>>());
    let positions = UInt32Array::from(rows.iter().map(|(_, p, _)| *p).collect::<Vec<_>>());
    let urls = StringArray::from(rows.iter().map(|(_, _, url)| Some(*url)).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(positions), Arc::new(urls)])
        .context("building snapshot_images record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn write_variants_parquet(path: &Path, snapshots: &[NormalizedSnapshot]) -> Result<usize> {
    let rows = snapshots
        .iter()
        .flat_map(|s| {
            s.variants.iter().enumerate().map(move |(position, variant)| {
                let types = variant
                    .types
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                (s.id.to_string(), position as u32, variant.name.as_str(), types)
            })
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("snapshot_id", DataType::Utf8, false),
        ArrowField::new("position", DataType::UInt32, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("types", DataType::Utf8, false),
    ]));
    let ids = StringArray::from(rows.iter().map(|(id, ..)| Some(id.as_str())).collect::<Vec<_>>());
    let positions = UInt32Array::from(rows.iter().map(|(_, p, ..)| *p).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|(_, _, name, _)| Some(*name)).collect::<Vec<_>>());
    let types = StringArray::from(rows.iter().map(|(.., t)| Some(t.as_str())).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(ids), Arc::new(positions), Arc::new(names), Arc::new(types)],
    )
    .context("building snapshot_variants record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
        rows,
    })
}
