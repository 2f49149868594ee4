//! `GeoJSON` page parsing for WFS `GetFeature` responses.

use std::convert::TryInto;
use std::fmt;

use geo_types::Geometry;
use geojson::feature::Id;
use geojson::{FeatureCollection, GeoJson, Geometry as GeoJsonGeometry, JsonObject, JsonValue};

use crate::error::{ResponseError, ResponseResult};

/// One feature of a WFS page.
///
/// The geometry stays in its structured `GeoJSON` form until the feature is
/// converted to a columnar batch.
#[derive(Debug, Clone, Default)]
pub struct Feature {
    pub id: Option<String>,
    pub properties: JsonObject,
    pub geometry: Option<GeoJsonGeometry>,
    /// Attribute name the service reports for the geometry (`geometry_name`).
    pub geometry_name: Option<String>,
}

impl Feature {
    /// Convert the structured geometry into a `geo-types` geometry.
    ///
    /// Returns `Ok(None)` for features without geometry.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseError::Parse`] if the `GeoJSON` geometry is not representable.
    pub fn to_geo(&self) -> ResponseResult<Option<Geometry<f64>>> {
        let Some(geometry) = &self.geometry else {
            return Ok(None);
        };
        let converted: Geometry<f64> =
            geometry
                .clone()
                .try_into()
                .map_err(|err| ResponseError::Parse {
                    message: format!("Failed to convert GeoJSON geometry: {err}"),
                    context: self.id.as_ref().map(|id| format!("feature {id}")),
                })?;
        Ok(Some(converted))
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let geom = if self.geometry.is_some() {
            "Some(Geometry)"
        } else {
            "None"
        };
        write!(
            f,
            "Feature(id={}, properties={} keys, geometry={geom})",
            self.id.as_deref().unwrap_or("-"),
            self.properties.len()
        )
    }
}

/// A single page returned by the service.
#[derive(Debug, Clone, Default)]
pub struct PageResponse {
    pub features: Vec<Feature>,
    /// Total features matching the query across all pages.
    pub number_matched: u64,
    /// Features carried by this page.
    pub number_returned: u64,
    /// Raw CRS declaration (`crs.properties.name`), if the service sent one.
    pub crs: Option<String>,
}

impl PageResponse {
    /// Geometry attribute name declared by the first feature that carries one.
    #[must_use]
    pub fn declared_geometry_name(&self) -> Option<&str> {
        self.features
            .iter()
            .find_map(|feature| feature.geometry_name.as_deref())
    }
}

/// Parse a response body into a [`PageResponse`].
///
/// # Errors
///
/// Returns [`ResponseError::Parse`] when the body is not a `GeoJSON` feature
/// collection (OGC exception reports are recognised and echoed), and
/// [`ResponseError::MissingField`] when the service sent no match count.
pub fn parse_page_response(bytes: &[u8], context: impl Into<String>) -> ResponseResult<PageResponse> {
    let context = context.into();

    let geojson = match GeoJson::from_reader(std::io::Cursor::new(bytes)) {
        Ok(geojson) => geojson,
        Err(err) => {
            return Err(ResponseError::Parse {
                message: describe_unparseable(bytes, &err.to_string()),
                context: Some(context),
            });
        },
    };

    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(ResponseError::Parse {
            message: "expected a FeatureCollection".to_string(),
            context: Some(context),
        });
    };

    collection_to_page(collection, &context)
}

fn collection_to_page(collection: FeatureCollection, context: &str) -> ResponseResult<PageResponse> {
    let members = collection.foreign_members.as_ref();

    let number_matched = count_member(members, "numberMatched")
        .or_else(|| count_member(members, "totalFeatures"))
        .ok_or_else(|| ResponseError::MissingField {
            field: "numberMatched".to_string(),
            context: Some(context.to_string()),
        })?;

    let crs = members
        .and_then(|m| m.get("crs"))
        .and_then(|crs| crs.get("properties"))
        .and_then(|props| props.get("name"))
        .and_then(JsonValue::as_str)
        .map(str::to_owned);

    let number_returned = count_member(members, "numberReturned");

    let features: Vec<Feature> = collection
        .features
        .into_iter()
        .map(|feature| {
            let geometry_name = feature
                .foreign_members
                .as_ref()
                .and_then(|m| m.get("geometry_name"))
                .and_then(JsonValue::as_str)
                .map(str::to_owned);
            Feature {
                id: feature.id.map(|id| match id {
                    Id::String(s) => s,
                    Id::Number(n) => n.to_string(),
                }),
                properties: feature.properties.unwrap_or_default(),
                geometry: feature.geometry,
                geometry_name,
            }
        })
        .collect();

    Ok(PageResponse {
        number_returned: number_returned.unwrap_or(features.len() as u64),
        number_matched,
        crs,
        features,
    })
}

/// Read a paging count that may be encoded as a number or a numeric string.
fn count_member(members: Option<&JsonObject>, key: &str) -> Option<u64> {
    match members?.get(key)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn describe_unparseable(bytes: &[u8], parse_err: &str) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_start();
    if trimmed.starts_with('<') {
        let snippet: String = trimmed.chars().take(200).collect();
        format!("service returned an XML document (likely an OGC exception report): {snippet}")
    } else {
        parse_err.to_string()
    }
}
