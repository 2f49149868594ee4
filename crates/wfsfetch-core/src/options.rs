//! Options controlling WFS requests and fetch sessions.

use std::path::PathBuf;

use url::Url;

use crate::error::{ConfigError, Result};

/// Default British Columbia open-data WFS endpoint.
pub const DEFAULT_SERVICE_URL: &str = "https://openmaps.gov.bc.ca/geo/pub/ows";

/// Default number of features requested per page.
pub const DEFAULT_PAGE_SIZE: u64 = 10_000;

/// Options describing how GetFeature requests are built.
#[derive(Debug, Clone)]
pub struct WfsOptions {
    /// Endpoint receiving the GetFeature requests.
    pub service_url: String,
    /// WFS protocol version.
    pub version: String,
    /// Workspace prefix joined to the dataset name in `typeName`.
    pub type_name_prefix: String,
    /// Response encoding requested from the service.
    pub output_format: String,
    /// CRS the service should reproject features into.
    pub srs_name: String,
    /// Attribute used to keep paging stable.
    pub sort_by: Option<String>,
    /// Geometry attribute referenced by a combined `BBOX(...)` filter.
    pub bbox_geometry_field: String,
}

impl Default for WfsOptions {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            version: "2.0.0".to_string(),
            type_name_prefix: "pub".to_string(),
            output_format: "json".to_string(),
            srs_name: "EPSG:3005".to_string(),
            sort_by: Some("OBJECTID".to_string()),
            bbox_geometry_field: "GEOMETRY".to_string(),
        }
    }
}

impl WfsOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = url.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_type_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_name_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_srs_name(mut self, srs_name: impl Into<String>) -> Self {
        self.srs_name = srs_name.into();
        self
    }

    #[must_use]
    pub fn with_sort_by(mut self, sort_by: Option<String>) -> Self {
        self.sort_by = sort_by;
        self
    }

    #[must_use]
    pub fn with_bbox_geometry_field(mut self, field: impl Into<String>) -> Self {
        self.bbox_geometry_field = field.into();
        self
    }

    /// Parse the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if the URL does not parse.
    pub fn parsed_service_url(&self) -> Result<Url> {
        Url::parse(&self.service_url).map_err(|err| {
            ConfigError::InvalidOption {
                option: "service_url".to_string(),
                message: format!("'{}': {err}", self.service_url),
            }
            .into()
        })
    }
}

/// Memory-pressure policy for a fetch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPolicy {
    /// Available memory (bytes) that must remain if consumption continues at
    /// the rate observed since the last baseline.
    pub reserve_bytes: u64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            reserve_bytes: 512 * 1024 * 1024,
        }
    }
}

impl MemoryPolicy {
    /// A policy that never spills.
    #[must_use]
    pub fn never_spill() -> Self {
        Self { reserve_bytes: 0 }
    }

    /// A policy that spills as soon as any consumption is observed.
    #[must_use]
    pub fn always_spill() -> Self {
        Self {
            reserve_bytes: u64::MAX,
        }
    }
}

/// Options controlling one fetch session.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Features requested per page.
    pub page_size: u64,
    /// Consecutive empty pages tolerated at one offset before giving up.
    pub max_stalled_pages: u32,
    /// When accumulated features are spilled to disk.
    pub memory: MemoryPolicy,
    /// Parent directory for the session spill directory (system temp when `None`).
    pub spill_dir: Option<PathBuf>,
    /// Geometry column name used when no feature declares one.
    pub default_geometry_column: String,
    /// CRS used when the response carries no CRS declaration.
    pub default_crs: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_stalled_pages: 3,
            memory: MemoryPolicy::default(),
            spill_dir: None,
            default_geometry_column: "geometry".to_string(),
            default_crs: None,
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_max_stalled_pages(mut self, attempts: u32) -> Self {
        self.max_stalled_pages = attempts;
        self
    }

    #[must_use]
    pub fn with_memory_policy(mut self, memory: MemoryPolicy) -> Self {
        self.memory = memory;
        self
    }

    #[must_use]
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_default_geometry_column(mut self, name: impl Into<String>) -> Self {
        self.default_geometry_column = name.into();
        self
    }

    #[must_use]
    pub fn with_default_crs(mut self, crs: impl Into<String>) -> Self {
        self.default_crs = Some(crs.into());
        self
    }

    /// Check option values before a session starts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for a zero page size, a zero
    /// stall budget or an empty default geometry column name.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(invalid("page_size", "must be greater than zero"));
        }
        if self.max_stalled_pages == 0 {
            return Err(invalid("max_stalled_pages", "must be greater than zero"));
        }
        if self.default_geometry_column.trim().is_empty() {
            return Err(invalid("default_geometry_column", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(option: &str, message: &str) -> crate::error::WfsFetchError {
    ConfigError::InvalidOption {
        option: option.to_string(),
        message: message.to_string(),
    }
    .into()
}
