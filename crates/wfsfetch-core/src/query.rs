//! GetFeature requests against a paginated WFS endpoint.
//!
//! [`QueryExecutor`] is the seam between a fetch session and the network: the
//! session only ever asks for one page at a time. [`WfsQueryExecutor`] is the
//! HTTP implementation; tests substitute scripted executors.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use log::debug;
use url::Url;
use wfs_geojson::{PageResponse, parse_page_response};

use crate::error::{ConfigError, Result, TransportError, WfsFetchError};
use crate::options::WfsOptions;

/// Rectangular spatial constraint in the service's native units.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    /// CRS tag of the bounds, e.g. `urn:ogc:def:crs:EPSG:3005`.
    pub crs: Option<String>,
}

impl BoundingBox {
    #[must_use]
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            crs: None,
        }
    }

    #[must_use]
    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    /// `BBOX(field,x1,y1,x2,y2[,'crs'])` predicate in CQL.
    #[must_use]
    pub fn to_cql(&self, geometry_field: &str) -> String {
        let mut cql = format!(
            "BBOX({geometry_field},{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y
        );
        if let Some(crs) = &self.crs {
            cql.push_str(&format!(",'{crs}'"));
        }
        cql.push(')');
        cql
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y
        )?;
        if let Some(crs) = &self.crs {
            write!(f, ",{crs}")?;
        }
        Ok(())
    }
}

impl FromStr for BoundingBox {
    type Err = WfsFetchError;

    /// Parse `x1,y1,x2,y2[,crs]`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if !(4..=5).contains(&parts.len()) {
            return Err(ConfigError::InvalidOption {
                option: "bbox".to_string(),
                message: format!("expected 'x1,y1,x2,y2[,crs]', got '{s}'"),
            }
            .into());
        }

        let mut bounds = [0.0_f64; 4];
        for (slot, raw) in bounds.iter_mut().zip(&parts) {
            *slot = raw.parse().map_err(|_| ConfigError::InvalidOption {
                option: "bbox".to_string(),
                message: format!("'{raw}' is not a number"),
            })?;
        }

        let bbox = Self::new(bounds[0], bounds[1], bounds[2], bounds[3]);
        Ok(match parts.get(4) {
            Some(crs) if !crs.is_empty() => bbox.with_crs(*crs),
            _ => bbox,
        })
    }
}

/// What to fetch: dataset, attribute filter, projection and spatial bounds.
#[derive(Debug, Clone, Default)]
pub struct FeatureQuery {
    /// Dataset identifier, e.g. `WHSE_IMAGERY_AND_BASE_MAPS.GSR_AIRPORTS_SVW`.
    pub dataset: String,
    /// CQL predicate.
    pub filter: Option<String>,
    /// Attribute names to project; empty means all.
    pub fields: Vec<String>,
    pub bbox: Option<BoundingBox>,
}

impl FeatureQuery {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

/// Page selection; both members are omitted from the request when `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub start_index: Option<u64>,
    pub count: Option<u64>,
}

/// Issues one paginated request and returns the decoded page.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Fetch a single page.
    ///
    /// # Errors
    ///
    /// Transport and decode failures are returned as-is; executors do not retry.
    async fn fetch(&self, query: &FeatureQuery, page: PageRequest) -> Result<PageResponse>;

    /// CRS the executor asks the service to reproject into, if any.
    fn srs_name(&self) -> Option<&str> {
        None
    }
}

/// Build the GetFeature query string parameters.
///
/// When both a bounding box and a filter are given, the box is folded into
/// the CQL filter, since the service rejects `bbox` together with `CQL_FILTER`.
#[must_use]
pub fn build_query_params(
    query: &FeatureQuery,
    page: PageRequest,
    options: &WfsOptions,
) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = vec![
        ("service".into(), "WFS".into()),
        ("version".into(), options.version.clone()),
        ("request".into(), "GetFeature".into()),
        (
            "typeName".into(),
            format!("{}:{}", options.type_name_prefix, query.dataset),
        ),
        ("outputFormat".into(), options.output_format.clone()),
        ("srsName".into(), options.srs_name.clone()),
    ];

    if let Some(sort_by) = &options.sort_by {
        params.push(("sortBy".into(), sort_by.clone()));
    }

    match (&query.bbox, &query.filter) {
        (Some(bbox), Some(filter)) => {
            let combined = format!(
                "{} AND ({filter})",
                bbox.to_cql(&options.bbox_geometry_field)
            );
            params.push(("CQL_FILTER".into(), combined));
        },
        (Some(bbox), None) => params.push(("bbox".into(), bbox.to_string())),
        (None, Some(filter)) => params.push(("CQL_FILTER".into(), filter.clone())),
        (None, None) => {},
    }

    if !query.fields.is_empty() {
        params.push(("propertyName".into(), query.fields.join(",").to_uppercase()));
    }

    if let Some(start_index) = page.start_index
        && start_index > 0
    {
        params.push(("startIndex".into(), start_index.to_string()));
    }
    if let Some(count) = page.count {
        params.push(("count".into(), count.to_string()));
    }

    params
}

/// Full GetFeature URL for one page.
///
/// # Errors
///
/// Returns a configuration error if the service URL does not parse.
pub fn request_url(query: &FeatureQuery, page: PageRequest, options: &WfsOptions) -> Result<Url> {
    let mut url = options.parsed_service_url()?;
    url.query_pairs_mut()
        .extend_pairs(build_query_params(query, page, options));
    Ok(url)
}

/// [`QueryExecutor`] backed by an HTTP client.
#[derive(Debug, Clone)]
pub struct WfsQueryExecutor {
    client: reqwest::Client,
    options: WfsOptions,
}

impl WfsQueryExecutor {
    pub fn new(options: WfsOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            options,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn options(&self) -> &WfsOptions {
        &self.options
    }
}

#[async_trait]
impl QueryExecutor for WfsQueryExecutor {
    async fn fetch(&self, query: &FeatureQuery, page: PageRequest) -> Result<PageResponse> {
        let url = request_url(query, page, &self.options)?;
        debug!("WFS URL request: {url}");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            }
            .into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let response = parse_page_response(&body, query.dataset.as_str()).map_err(|err| {
            err.with_additional_context(format!("startIndex={}", page.start_index.unwrap_or(0)))
        })?;
        Ok(response)
    }

    fn srs_name(&self) -> Option<&str> {
        Some(&self.options.srs_name)
    }
}
