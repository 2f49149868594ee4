//! Display utilities for formatting CLI output.
//!
//! This module provides table row structures and formatting functions
//! for presenting a fetched dataset in a human-readable format.

use tabled::{Table, Tabled};

use wfsfetch_core::ResultDataset;

/// Table row representation for displaying the geometry column.
#[derive(Tabled)]
pub struct GeometryRow {
    /// Name of the geometry column.
    #[tabled(rename = "Column")]
    pub name: String,
    /// `GeoArrow` extension name for the geometry type.
    #[tabled(rename = "Extension")]
    pub extension: String,
    /// Coordinate Reference System information.
    #[tabled(rename = "CRS")]
    pub crs: String,
}

/// Table row representation for displaying field/column information.
#[derive(Tabled)]
pub struct FieldRow {
    /// Name of the field.
    #[tabled(rename = "Field")]
    pub name: String,
    /// Data type of the field.
    #[tabled(rename = "Type")]
    pub data_type: String,
    /// Whether the field can contain null values.
    #[tabled(rename = "Nullable")]
    pub nullable: String,
}

/// Table row for the session counters.
#[derive(Tabled)]
pub struct StatsRow {
    #[tabled(rename = "Rows")]
    pub rows: usize,
    #[tabled(rename = "Pages")]
    pub pages: usize,
    #[tabled(rename = "Spill Files")]
    pub spill_files: usize,
    #[tabled(rename = "Rejected")]
    pub rejected: usize,
    #[tabled(rename = "Coerced")]
    pub coerced: usize,
}

/// Geometry row for a dataset.
#[must_use]
pub fn geometry_row(dataset: &ResultDataset) -> GeometryRow {
    let schema = dataset.schema();
    let extension = schema
        .field_with_name(&dataset.geometry_column)
        .ok()
        .and_then(|field| field.metadata().get("ARROW:extension:name").cloned())
        .unwrap_or_else(|| "N/A".to_string());

    GeometryRow {
        name: dataset.geometry_column.clone(),
        extension,
        crs: dataset.crs.clone(),
    }
}

/// Field rows for every attribute column.
#[must_use]
pub fn field_rows(dataset: &ResultDataset) -> Vec<FieldRow> {
    dataset
        .schema()
        .fields()
        .iter()
        .filter(|f| f.name() != &dataset.geometry_column)
        .map(|f| FieldRow {
            name: f.name().clone(),
            data_type: f.data_type().to_string(),
            nullable: if f.is_nullable() { "Yes" } else { "No" }.to_string(),
        })
        .collect()
}

/// Display a fetched dataset as summary, geometry and field tables.
pub fn display_dataset_summary(dataset_id: &str, dataset: &ResultDataset) {
    println!("\nDataset: {dataset_id}");

    let stats = StatsRow {
        rows: dataset.stats.rows,
        pages: dataset.stats.pages_fetched,
        spill_files: dataset.stats.spill_files,
        rejected: dataset.stats.rejected_rows,
        coerced: dataset.stats.coerced_values,
    };
    println!("{}", Table::new([stats]));

    println!("\n=== Geometry Column ===");
    println!("{}", Table::new([geometry_row(dataset)]));

    let fields = field_rows(dataset);
    if !fields.is_empty() {
        println!("\n=== Fields ===");
        println!("{}", Table::new(fields));
    }
}
