//! Schema discovery for a fetch session.
//!
//! The service's schema is only known once the first page arrives. Discovery
//! fixes the geometry column name, the CRS and the attribute columns from that
//! page; every later page is validated against the fixed values.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use geoarrow_schema::{CoordType, Crs, GeometryType, Metadata};
use geojson::JsonValue;
use log::{debug, warn};
use wfs_geojson::PageResponse;

use crate::error::{Result, SchemaError};
use crate::options::FetchOptions;
use crate::query::FeatureQuery;

/// CRS assumed for `GeoJSON` without a CRS declaration or a requested `srsName`.
pub const GEOJSON_DEFAULT_CRS: &str = "OGC:CRS84";

/// Schema fixed by the first page of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSchema {
    geometry_column: String,
    crs: String,
    attributes: SchemaRef,
}

impl SessionSchema {
    /// Derive the session schema from the first page.
    ///
    /// The geometry column is the first declared `geometry_name`, lower-cased.
    /// Attribute columns are the properties of the first feature, typed from
    /// every feature on the page. An empty page yields the requested fields as
    /// text columns.
    ///
    /// The CRS is the page declaration, else `options.default_crs`, else the
    /// `srsName` the executor requested.
    #[must_use]
    pub fn discover(
        first: &PageResponse,
        query: &FeatureQuery,
        options: &FetchOptions,
        requested_srs: Option<&str>,
    ) -> Self {
        let geometry_column = first
            .declared_geometry_name()
            .map_or_else(|| options.default_geometry_column.clone(), str::to_lowercase);

        let crs = first
            .crs
            .as_deref()
            .and_then(normalize_crs)
            .or_else(|| options.default_crs.as_deref().and_then(normalize_crs))
            .or_else(|| requested_srs.and_then(normalize_crs))
            .unwrap_or_else(|| GEOJSON_DEFAULT_CRS.to_string());

        let attributes = match first.features.first() {
            Some(_) => infer_attributes(first, &geometry_column),
            None => requested_attributes(query, &geometry_column),
        };

        debug!(
            "Session schema fixed: geometry column '{geometry_column}', CRS {crs}, {} attribute(s)",
            attributes.fields().len()
        );

        Self {
            geometry_column,
            crs,
            attributes,
        }
    }

    /// Build a schema directly, bypassing discovery.
    #[must_use]
    pub fn new(geometry_column: impl Into<String>, crs: impl Into<String>, attributes: SchemaRef) -> Self {
        Self {
            geometry_column: geometry_column.into(),
            crs: crs.into(),
            attributes,
        }
    }

    /// Check that a page agrees with the fixed geometry column and CRS.
    ///
    /// Also run on the first page, where it catches features that disagree
    /// with each other.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Inconsistent`] on the first disagreement.
    pub fn validate(&self, page: &PageResponse, page_index: usize) -> Result<()> {
        if let Some(found) = page
            .features
            .iter()
            .filter_map(|feature| feature.geometry_name.as_deref())
            .map(str::to_lowercase)
            .find(|name| *name != self.geometry_column)
        {
            return Err(SchemaError::Inconsistent {
                page: page_index,
                what: "geometry column",
                expected: self.geometry_column.clone(),
                found,
            }
            .into());
        }

        if let Some(raw) = page.crs.as_deref() {
            match normalize_crs(raw) {
                Some(found) if found != self.crs => {
                    return Err(SchemaError::Inconsistent {
                        page: page_index,
                        what: "CRS",
                        expected: self.crs.clone(),
                        found,
                    }
                    .into());
                },
                Some(_) => {},
                None => debug!("Page {page_index} declares unrecognised CRS '{raw}'; not compared"),
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn geometry_column(&self) -> &str {
        &self.geometry_column
    }

    #[must_use]
    pub fn crs(&self) -> &str {
        &self.crs
    }

    /// Attribute columns, excluding geometry.
    #[must_use]
    pub fn attributes(&self) -> &SchemaRef {
        &self.attributes
    }

    /// Native geometry type tagged with the session CRS.
    #[must_use]
    pub fn geometry_type(&self) -> GeometryType {
        let metadata = Metadata::new(Crs::from_authority_code(self.crs.clone()), None);
        GeometryType::new(Arc::new(metadata)).with_coord_type(CoordType::Interleaved)
    }

    /// Layout of spill files: attributes plus a WKB geometry column.
    #[must_use]
    pub fn spill_schema(&self) -> SchemaRef {
        let mut fields: Vec<Field> = self
            .attributes
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.push(Field::new(&self.geometry_column, DataType::Binary, true));
        Arc::new(Schema::new(fields))
    }

    /// Layout of the final dataset: attributes plus a native geometry column.
    #[must_use]
    pub fn result_schema(&self) -> SchemaRef {
        let mut fields: Vec<Field> = self
            .attributes
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.push(
            self.geometry_type()
                .to_field(self.geometry_column.clone(), true),
        );
        Arc::new(Schema::new(fields))
    }
}

/// Normalize a CRS declaration to `AUTHORITY:CODE`.
///
/// Accepts `EPSG:3005`, `urn:ogc:def:crs:EPSG::3005`,
/// `urn:ogc:def:crs:EPSG:6.3:3005` and
/// `http://www.opengis.net/def/crs/EPSG/0/3005`.
#[must_use]
pub fn normalize_crs(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (authority, code) = if let Some(rest) = raw
        .strip_prefix("http://www.opengis.net/def/crs/")
        .or_else(|| raw.strip_prefix("https://www.opengis.net/def/crs/"))
    {
        let parts: Vec<&str> = rest.split('/').filter(|p| !p.is_empty()).collect();
        (*parts.first()?, *parts.last()?)
    } else if raw.to_ascii_lowercase().starts_with("urn:ogc:def:crs:") {
        let parts: Vec<&str> = raw.split(':').collect();
        (*parts.get(4)?, *parts.last()?)
    } else {
        let parts: Vec<&str> = raw.split(':').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [authority, code] => (*authority, *code),
            _ => return None,
        }
    };

    if authority.is_empty() || code.is_empty() {
        return None;
    }
    Some(format!("{}:{code}", authority.to_ascii_uppercase()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InferredScalarType {
    Null,
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl InferredScalarType {
    fn update(self, value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => self,
            JsonValue::Bool(_) => match self {
                Self::Null | Self::Boolean => Self::Boolean,
                _ => Self::Utf8,
            },
            JsonValue::Number(n) => match self {
                Self::Null | Self::Int64 if n.is_i64() => Self::Int64,
                Self::Null | Self::Int64 | Self::Float64 => Self::Float64,
                _ => Self::Utf8,
            },
            JsonValue::String(_) | JsonValue::Array(_) | JsonValue::Object(_) => Self::Utf8,
        }
    }

    fn to_datatype(self) -> DataType {
        match self {
            Self::Null | Self::Utf8 => DataType::Utf8,
            Self::Boolean => DataType::Boolean,
            Self::Int64 => DataType::Int64,
            Self::Float64 => DataType::Float64,
        }
    }
}

fn infer_attributes(page: &PageResponse, geometry_column: &str) -> SchemaRef {
    let Some(first) = page.features.first() else {
        return Arc::new(Schema::empty());
    };

    let mut inferred: BTreeMap<&str, InferredScalarType> = BTreeMap::new();
    for key in first.properties.keys() {
        if key.to_lowercase() == geometry_column {
            warn!("Property '{key}' collides with the geometry column and is ignored");
            continue;
        }
        inferred.insert(key.as_str(), InferredScalarType::Null);
    }

    for feature in &page.features {
        for (key, ty) in &mut inferred {
            if let Some(value) = feature.properties.get(*key) {
                *ty = ty.update(value);
            }
        }
    }

    // Keep the property order of the first feature.
    let fields: Vec<Field> = first
        .properties
        .keys()
        .filter_map(|key| {
            inferred
                .get(key.as_str())
                .map(|ty| Field::new(key.clone(), ty.to_datatype(), true))
        })
        .collect();

    Arc::new(Schema::new(fields))
}

fn requested_attributes(query: &FeatureQuery, geometry_column: &str) -> SchemaRef {
    let fields: Vec<Field> = query
        .fields
        .iter()
        .map(|name| name.to_uppercase())
        .filter(|name| name.to_lowercase() != geometry_column)
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    Arc::new(Schema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wfs_geojson::Feature;

    fn feature(properties: JsonValue, geometry_name: Option<&str>) -> Feature {
        let JsonValue::Object(properties) = properties else {
            panic!("properties must be an object")
        };
        Feature {
            id: None,
            properties,
            geometry: None,
            geometry_name: geometry_name.map(str::to_owned),
        }
    }

    fn page(features: Vec<Feature>, crs: Option<&str>) -> PageResponse {
        PageResponse {
            number_matched: features.len() as u64,
            number_returned: features.len() as u64,
            crs: crs.map(str::to_owned),
            features,
        }
    }

    #[test]
    fn normalize_crs_forms() {
        assert_eq!(normalize_crs("EPSG:3005").as_deref(), Some("EPSG:3005"));
        assert_eq!(
            normalize_crs("urn:ogc:def:crs:EPSG::3005").as_deref(),
            Some("EPSG:3005")
        );
        assert_eq!(
            normalize_crs("urn:ogc:def:crs:EPSG:6.3:26910").as_deref(),
            Some("EPSG:26910")
        );
        assert_eq!(
            normalize_crs("http://www.opengis.net/def/crs/EPSG/0/4326").as_deref(),
            Some("EPSG:4326")
        );
        assert_eq!(normalize_crs("epsg:4326").as_deref(), Some("EPSG:4326"));
        assert_eq!(normalize_crs(""), None);
        assert_eq!(normalize_crs("nonsense"), None);
    }

    #[test]
    fn discover_from_first_page() {
        let first = page(
            vec![
                feature(json!({"NAME": "A", "AREA": 1, "ACTIVE": true}), Some("SHAPE")),
                feature(json!({"NAME": "B", "AREA": 2.5, "ACTIVE": null}), Some("SHAPE")),
            ],
            Some("urn:ogc:def:crs:EPSG::3005"),
        );

        let schema = SessionSchema::discover(
            &first,
            &FeatureQuery::new("X"),
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );

        assert_eq!(schema.geometry_column(), "shape");
        assert_eq!(schema.crs(), "EPSG:3005");
        let attributes = schema.attributes();
        assert_eq!(attributes.fields().len(), 3);
        assert_eq!(
            attributes.field_with_name("AREA").unwrap().data_type(),
            &DataType::Float64
        );
        assert_eq!(
            attributes.field_with_name("ACTIVE").unwrap().data_type(),
            &DataType::Boolean
        );
        assert_eq!(
            attributes.field_with_name("NAME").unwrap().data_type(),
            &DataType::Utf8
        );
    }

    #[test]
    fn columns_come_from_first_feature_only() {
        let first = page(
            vec![
                feature(json!({"NAME": "A"}), Some("GEOMETRY")),
                feature(json!({"NAME": "B", "EXTRA": 1}), Some("GEOMETRY")),
            ],
            None,
        );

        let schema = SessionSchema::discover(
            &first,
            &FeatureQuery::new("X"),
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );
        assert_eq!(schema.attributes().fields().len(), 1);
        // Falls back to the request srsName
        assert_eq!(schema.crs(), "EPSG:3005");
    }

    #[test]
    fn crs_fallbacks() {
        let first = page(vec![feature(json!({"A": 1}), None)], None);
        let query = FeatureQuery::new("X");

        let configured = FetchOptions::default().with_default_crs("urn:ogc:def:crs:EPSG::26910");
        let schema = SessionSchema::discover(&first, &query, &configured, Some("EPSG:3005"));
        assert_eq!(schema.crs(), "EPSG:26910");
        assert_eq!(schema.geometry_column(), "geometry");

        let schema = SessionSchema::discover(&first, &query, &FetchOptions::default(), None);
        assert_eq!(schema.crs(), GEOJSON_DEFAULT_CRS);
    }

    #[test]
    fn geometry_property_collision_is_dropped() {
        let first = page(
            vec![feature(json!({"NAME": "A", "GEOMETRY": "x"}), Some("GEOMETRY"))],
            None,
        );

        let schema = SessionSchema::discover(
            &first,
            &FeatureQuery::new("X"),
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );
        assert!(schema.attributes().field_with_name("GEOMETRY").is_err());
        assert!(schema.result_schema().field_with_name("geometry").is_ok());
    }

    #[test]
    fn empty_first_page_uses_requested_fields() {
        let first = page(vec![], Some("EPSG:3005"));
        let query = FeatureQuery::new("X").with_fields(["name", "objectid"]);

        let schema = SessionSchema::discover(
            &first,
            &query,
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );

        assert_eq!(schema.geometry_column(), "geometry");
        let result = schema.result_schema();
        assert_eq!(result.fields().len(), 3);
        assert_eq!(result.field(0).name(), "NAME");
        assert_eq!(result.field(2).name(), "geometry");
    }

    #[test]
    fn validate_rejects_new_geometry_name() {
        let first = page(vec![feature(json!({"A": 1}), Some("SHAPE"))], None);
        let schema = SessionSchema::discover(
            &first,
            &FeatureQuery::new("X"),
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );

        let same = page(vec![feature(json!({"A": 2}), Some("shape"))], None);
        assert!(schema.validate(&same, 1).is_ok());

        let changed = page(vec![feature(json!({"A": 3}), Some("GEOMETRY"))], None);
        let err = schema.validate(&changed, 1).unwrap_err();
        assert!(err.to_string().contains("geometry column 'geometry'"));
    }

    #[test]
    fn validate_rejects_new_crs() {
        let first = page(
            vec![feature(json!({"A": 1}), Some("SHAPE"))],
            Some("urn:ogc:def:crs:EPSG::3005"),
        );
        let schema = SessionSchema::discover(
            &first,
            &FeatureQuery::new("X"),
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );

        let same = page(vec![], Some("EPSG:3005"));
        assert!(schema.validate(&same, 1).is_ok());

        let changed = page(vec![], Some("urn:ogc:def:crs:EPSG::4326"));
        let err = schema.validate(&changed, 2).unwrap_err();
        assert!(err.to_string().contains("CRS 'EPSG:4326'"));
    }

    #[test]
    fn validate_rejects_mixed_names_on_first_page() {
        let first = page(
            vec![
                feature(json!({"A": 1}), Some("SHAPE")),
                feature(json!({"A": 2}), Some("GEOMETRY")),
            ],
            Some("urn:ogc:def:crs:EPSG::3005"),
        );
        let schema = SessionSchema::discover(
            &first,
            &FeatureQuery::new("X"),
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );

        let err = schema.validate(&first, 0).unwrap_err();
        assert!(matches!(
            err,
            crate::error::WfsFetchError::Schema(SchemaError::Inconsistent {
                page: 0,
                what: "geometry column",
                ..
            })
        ));
    }

    #[test]
    fn unrecognised_crs_is_not_compared() {
        let first = page(vec![feature(json!({"A": 1}), Some("SHAPE"))], Some("nonsense"));
        let schema = SessionSchema::discover(
            &first,
            &FeatureQuery::new("X"),
            &FetchOptions::default(),
            Some("EPSG:3005"),
        );
        assert_eq!(schema.crs(), "EPSG:3005");
        assert!(schema.validate(&first, 0).is_ok());
    }

    #[test]
    fn spill_and_result_layouts() {
        let attributes = Arc::new(Schema::new(vec![Field::new("NAME", DataType::Utf8, true)]));
        let schema = SessionSchema::new("shape", "EPSG:3005", attributes);

        let spill = schema.spill_schema();
        assert_eq!(spill.field(1).name(), "shape");
        assert_eq!(spill.field(1).data_type(), &DataType::Binary);

        let result = schema.result_schema();
        assert_eq!(result.field(1).name(), "shape");
        assert_ne!(result.field(1).data_type(), &DataType::Binary);
    }

    #[test]
    fn type_widening() {
        use InferredScalarType as T;
        assert_eq!(T::Null.update(&json!(1)), T::Int64);
        assert_eq!(T::Int64.update(&json!(1.5)), T::Float64);
        assert_eq!(T::Float64.update(&json!(2)), T::Float64);
        assert_eq!(T::Int64.update(&json!("x")), T::Utf8);
        assert_eq!(T::Boolean.update(&json!(1)), T::Utf8);
        assert_eq!(T::Boolean.update(&JsonValue::Null), T::Boolean);
    }
}
