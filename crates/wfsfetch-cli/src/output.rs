//! Parquet output for fetched datasets.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::parquet::file::metadata::KeyValue;
use datafusion::parquet::file::properties::WriterProperties;
use tracing::info;

use wfsfetch_core::ResultDataset;

/// Write `dataset` to `path` with WKB geometry.
///
/// The geometry column name and CRS are stored as file key-value metadata
/// under `geometry_column` and `crs`.
///
/// # Errors
///
/// Returns an error if the geometry cannot be encoded or the file cannot be written.
pub fn write_parquet(dataset: &ResultDataset, path: &Path) -> Result<()> {
    let batch = dataset.to_wkb_batch()?;

    let properties = WriterProperties::builder()
        .set_key_value_metadata(Some(vec![
            KeyValue::new("geometry_column".to_string(), dataset.geometry_column.clone()),
            KeyValue::new("crs".to_string(), dataset.crs.clone()),
        ]))
        .build();

    let file = File::create(path).with_context(|| format!("Failed to create '{}'", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(properties))?;
    writer.write(&batch)?;
    writer.close()?;

    info!("Wrote {} row(s) to {}", batch.num_rows(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::parquet::file::reader::{FileReader, SerializedFileReader};
    use geojson::JsonValue;
    use serde_json::json;
    use wfsfetch_core::columnar::encode_native_batch;
    use wfsfetch_core::{Feature, FetchStats, SessionSchema};

    fn dataset() -> ResultDataset {
        let attributes = Arc::new(Schema::new(vec![Field::new("NAME", DataType::Utf8, true)]));
        let schema = SessionSchema::new("shape", "EPSG:3005", attributes);

        let JsonValue::Object(properties) = json!({"NAME": "Airport"}) else {
            unreachable!()
        };
        let feature = Feature {
            id: Some("f.1".to_string()),
            properties,
            geometry: Some(
                serde_json::from_value(json!({"type": "Point", "coordinates": [1_200_000.0, 450_000.0]}))
                    .unwrap(),
            ),
            geometry_name: Some("SHAPE".to_string()),
        };

        let batch = encode_native_batch(&schema, &[feature]).unwrap().batch;
        ResultDataset {
            stats: FetchStats {
                pages_fetched: 1,
                rows: 1,
                ..FetchStats::default()
            },
            batch,
            geometry_column: "shape".to_string(),
            crs: "EPSG:3005".to_string(),
        }
    }

    #[test]
    fn test_write_parquet_records_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("airports.parquet");

        write_parquet(&dataset(), &path)?;

        let reader = SerializedFileReader::new(File::open(&path)?)?;
        let metadata = reader.metadata().file_metadata();
        assert_eq!(metadata.num_rows(), 1);

        let kv = metadata.key_value_metadata().expect("key-value metadata");
        let lookup = |key: &str| {
            kv.iter()
                .find(|entry| entry.key == key)
                .and_then(|entry| entry.value.clone())
        };
        assert_eq!(lookup("geometry_column").as_deref(), Some("shape"));
        assert_eq!(lookup("crs").as_deref(), Some("EPSG:3005"));
        Ok(())
    }
}
