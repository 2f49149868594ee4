//! The dataset returned by a fetch session.

use std::fmt;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use geoarrow_array::GeoArrowArray;
use geoarrow_array::array::GeometryArray;
use geoarrow_array::cast::to_wkb;

use crate::error::{MergeError, Result};

/// Counters collected while a session runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Page requests issued, including stalled retries.
    pub pages_fetched: usize,
    /// Spill files written.
    pub spill_files: usize,
    /// Rows in the final dataset.
    pub rows: usize,
    /// Features dropped because their geometry could not be decoded.
    pub rejected_rows: usize,
    /// Attribute values nulled because they did not fit the column type
    /// fixed by the first page.
    pub coerced_values: usize,
}

impl fmt::Display for FetchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} row(s) from {} page(s), {} spill file(s), {} rejected, {} value(s) coerced",
            self.rows, self.pages_fetched, self.spill_files, self.rejected_rows, self.coerced_values
        )
    }
}

/// A geospatial table: attribute columns plus one native geometry column.
#[derive(Debug, Clone)]
pub struct ResultDataset {
    pub batch: RecordBatch,
    pub geometry_column: String,
    pub crs: String,
    pub stats: FetchStats,
}

impl ResultDataset {
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    /// Names of the non-geometry columns, in order.
    #[must_use]
    pub fn attribute_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .filter(|field| field.name() != &self.geometry_column)
            .map(|field| field.name().clone())
            .collect()
    }

    /// The geometry column as a GeoArrow array.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Geometry`] if the column is missing or is not a
    /// GeoArrow geometry array.
    pub fn geometry_array(&self) -> Result<GeometryArray> {
        let schema = self.batch.schema();
        let index = schema
            .index_of(&self.geometry_column)
            .map_err(|err| self.geometry_error(err))?;
        let field = schema.field(index);
        let array = GeometryArray::try_from((self.batch.column(index).as_ref(), field))
            .map_err(|err| self.geometry_error(err))?;
        Ok(array)
    }

    /// Copy of the batch with the geometry column re-encoded as plain WKB.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Geometry`] if the geometry cannot be encoded.
    pub fn to_wkb_batch(&self) -> Result<RecordBatch> {
        let geometry = self.geometry_array()?;
        let wkb = to_wkb::<i32>(&geometry).map_err(|err| self.geometry_error(err))?;

        let schema = self.batch.schema();
        let mut fields = Vec::with_capacity(schema.fields().len());
        let mut columns = Vec::with_capacity(schema.fields().len());
        for (field, column) in schema.fields().iter().zip(self.batch.columns()) {
            if field.name() == &self.geometry_column {
                fields.push(Field::new(field.name(), DataType::Binary, true));
                columns.push(wkb.to_array_ref());
            } else {
                fields.push(field.as_ref().clone());
                columns.push(Arc::clone(column));
            }
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(MergeError::from)?;
        Ok(batch)
    }

    fn geometry_error(&self, err: impl fmt::Display) -> MergeError {
        MergeError::Geometry {
            column: self.geometry_column.clone(),
            message: err.to_string(),
        }
    }
}
