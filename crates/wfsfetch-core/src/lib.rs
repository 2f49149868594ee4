//! `wfsfetch-core` downloads complete feature datasets from a paginated WFS
//! endpoint while bounding memory use.
//!
//! This crate includes:
//! - **Query execution**: GetFeature request building and the [`QueryExecutor`] seam.
//! - **Schema discovery**: the geometry column, CRS and attribute types fixed by the first page.
//! - **Memory pressure**: a rate-based check deciding when accumulated features go to disk.
//! - **Spill cache**: session-scoped Parquet files with WKB geometry.
//! - **Merge**: one Arrow record batch with a native GeoArrow geometry column.
//!
//! [`get_data`] runs a whole [`FeatureFetchSession`] and returns a [`ResultDataset`].

pub mod columnar;
pub mod dataset;
pub mod error;
pub mod memory;
pub mod merge;
pub mod options;
pub mod query;
pub mod schema;
pub mod session;
pub mod spill;

pub use dataset::{FetchStats, ResultDataset};
pub use error::{Result, WfsFetchError};
pub use memory::{MemoryPressureMonitor, MemoryProbe, SystemMemoryProbe};
pub use options::{FetchOptions, MemoryPolicy, WfsOptions};
pub use query::{BoundingBox, FeatureQuery, PageRequest, QueryExecutor, WfsQueryExecutor, request_url};
pub use schema::SessionSchema;
pub use session::{FeatureFetchSession, SessionState, get_data, get_data_with_probe};
pub use wfs_geojson::{Feature, PageResponse};
