//! Assembly of the final dataset.
//!
//! Without spills the pending features are converted directly. With spills,
//! every spill file is loaded through DataFusion in the order it was written,
//! the batches are concatenated, and the WKB column is decoded in a single
//! pass.

use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{Array, ArrayRef, BooleanArray, RecordBatch};
use datafusion::arrow::compute::{concat_batches, filter};
use datafusion::prelude::{ParquetReadOptions, SessionConfig, SessionContext};
use geozero::ToGeo;
use geozero::wkb::Wkb;
use log::{debug, warn};
use wfs_geojson::Feature;

use crate::columnar::{EncodedBatch, encode_native_batch, geometry_column};
use crate::error::{MergeError, Result};
use crate::schema::SessionSchema;
use crate::spill::SpillFile;

/// Builds result batches for one session schema.
#[derive(Debug, Clone, Copy)]
pub struct Merger<'a> {
    schema: &'a SessionSchema,
}

impl<'a> Merger<'a> {
    #[must_use]
    pub fn new(schema: &'a SessionSchema) -> Self {
        Self { schema }
    }

    /// Convert in-memory features to the result layout.
    ///
    /// # Errors
    ///
    /// Propagates geometry builder and batch assembly failures.
    pub fn merge_in_memory(&self, features: &[Feature]) -> Result<EncodedBatch> {
        debug!("Merging {} in-memory feature(s)", features.len());
        encode_native_batch(self.schema, features)
    }

    /// Load every spill file and decode the combined WKB column.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Read`] if the files cannot be loaded and
    /// [`MergeError::Arrow`] if the loaded batches cannot be combined.
    pub async fn merge_spilled(&self, files: &[SpillFile]) -> Result<EncodedBatch> {
        let combined = self.load(files).await?;
        debug!(
            "Loaded {} row(s) from {} spill file(s)",
            combined.num_rows(),
            files.len()
        );
        self.decode(&combined)
    }

    /// Read the files one at a time. A multi-file scan lists its files by
    /// path, which puts `cache_10` before `cache_2`.
    async fn load(&self, files: &[SpillFile]) -> Result<RecordBatch> {
        let spill_schema = self.schema.spill_schema();

        let config = SessionConfig::new()
            .with_target_partitions(1)
            .set_bool("datafusion.execution.parquet.schema_force_view_types", false);
        let ctx = SessionContext::new_with_config(config);

        let mut batches = Vec::new();
        for file in files {
            let options = ParquetReadOptions::default().schema(&spill_schema);
            let df = ctx
                .read_parquet(file.path.to_string_lossy().into_owned(), options)
                .await
                .map_err(MergeError::from)?;
            let loaded = df.collect().await.map_err(MergeError::from)?;
            debug!(
                "Loaded {} of {} row(s) from {}",
                loaded.iter().map(RecordBatch::num_rows).sum::<usize>(),
                file.rows,
                file.path.display()
            );
            batches.extend(loaded);
        }

        let combined = concat_batches(&spill_schema, &batches).map_err(MergeError::from)?;
        Ok(combined)
    }

    /// Decode the WKB column of a spill-layout batch, dropping rows whose
    /// geometry does not decode.
    fn decode(&self, batch: &RecordBatch) -> Result<EncodedBatch> {
        let geometry_index = batch.num_columns() - 1;
        let wkb = batch.column(geometry_index).as_binary::<i32>();

        let mut keep = Vec::with_capacity(batch.num_rows());
        let mut geometries = Vec::with_capacity(batch.num_rows());
        for row in 0..wkb.len() {
            if wkb.is_null(row) {
                keep.push(true);
                geometries.push(None);
                continue;
            }
            match Wkb(wkb.value(row).to_vec()).to_geo() {
                Ok(geometry) => {
                    keep.push(true);
                    geometries.push(Some(geometry));
                },
                Err(err) => {
                    warn!(
                        "Rejecting row {row}: failed to decode '{}' geometry: {err}",
                        self.schema.geometry_column()
                    );
                    keep.push(false);
                },
            }
        }

        let rejected = keep.iter().filter(|kept| !**kept).count();
        let mask = BooleanArray::from(keep);

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
        for column in &batch.columns()[..geometry_index] {
            if rejected == 0 {
                columns.push(Arc::clone(column));
            } else {
                columns.push(filter(column.as_ref(), &mask).map_err(MergeError::from)?);
            }
        }
        columns.push(geometry_column(self.schema, &geometries)?);

        let batch =
            RecordBatch::try_new(self.schema.result_schema(), columns).map_err(MergeError::from)?;
        Ok(EncodedBatch {
            batch,
            rejected,
            coerced: 0,
        })
    }
}
