//! Conversion of row-oriented features into Arrow columns.
//!
//! Attribute values are coerced to the session column types. Integral floats
//! fit integer columns and any value fits a text column; a value that still
//! does not fit becomes null and is counted as coerced. Geometry is emitted
//! either as WKB (spill layout) or as a native GeoArrow geometry array
//! (result layout).

use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field};
use geo_types::Geometry;
use geoarrow_array::GeoArrowArray;
use geoarrow_array::builder::GeometryBuilder;
use geojson::JsonValue;
use geozero::{CoordDimensions, ToWkb};
use log::warn;
use wfs_geojson::Feature;

use crate::error::{MergeError, Result};
use crate::schema::SessionSchema;

/// Features converted to a record batch, minus the rows that were rejected.
#[derive(Debug)]
pub struct EncodedBatch {
    pub batch: RecordBatch,
    /// Features dropped because their geometry could not be converted.
    pub rejected: usize,
    /// Attribute values replaced by null because they did not fit their column.
    pub coerced: usize,
}

/// Encode features in the spill layout: attribute columns plus WKB geometry.
///
/// # Errors
///
/// Returns [`MergeError::Arrow`] if the columns do not match the spill schema.
pub fn encode_spill_batch(schema: &SessionSchema, features: &[Feature]) -> Result<EncodedBatch> {
    let mut accepted = Vec::with_capacity(features.len());
    let mut wkb: Vec<Option<Vec<u8>>> = Vec::with_capacity(features.len());

    for feature in features {
        match feature_to_wkb(feature) {
            Ok(bytes) => {
                accepted.push(feature);
                wkb.push(bytes);
            },
            Err(message) => warn!("Rejecting {feature}: {message}"),
        }
    }

    let (mut columns, coerced) = attribute_columns(schema, &accepted);
    let geometry: BinaryArray = wkb.iter().map(Option::as_deref).collect();
    columns.push(Arc::new(geometry));

    let batch = RecordBatch::try_new(schema.spill_schema(), columns).map_err(MergeError::from)?;
    Ok(EncodedBatch {
        batch,
        rejected: features.len() - accepted.len(),
        coerced,
    })
}

/// Convert features straight into the result layout with native geometry.
///
/// # Errors
///
/// Returns [`MergeError::Geometry`] if the geometry builder refuses a value and
/// [`MergeError::Arrow`] if the columns do not match the result schema.
pub fn encode_native_batch(schema: &SessionSchema, features: &[Feature]) -> Result<EncodedBatch> {
    let mut accepted = Vec::with_capacity(features.len());
    let mut geometries = Vec::with_capacity(features.len());

    for feature in features {
        match feature.to_geo() {
            Ok(geometry) => {
                accepted.push(feature);
                geometries.push(geometry);
            },
            Err(err) => warn!("Rejecting {feature}: {err}"),
        }
    }

    let (mut columns, coerced) = attribute_columns(schema, &accepted);
    columns.push(geometry_column(schema, &geometries)?);

    let batch = RecordBatch::try_new(schema.result_schema(), columns).map_err(MergeError::from)?;
    Ok(EncodedBatch {
        batch,
        rejected: features.len() - accepted.len(),
        coerced,
    })
}

/// Build the native geometry column for the session geometry type.
///
/// # Errors
///
/// Returns [`MergeError::Geometry`] if a geometry cannot be appended.
pub fn geometry_column(schema: &SessionSchema, geometries: &[Option<Geometry<f64>>]) -> Result<ArrayRef> {
    let mut builder = GeometryBuilder::new(schema.geometry_type());
    for geometry in geometries {
        builder
            .push_geometry(geometry.as_ref())
            .map_err(|err| MergeError::Geometry {
                column: schema.geometry_column().to_string(),
                message: err.to_string(),
            })?;
    }
    Ok(builder.finish().into_array_ref())
}

fn feature_to_wkb(feature: &Feature) -> std::result::Result<Option<Vec<u8>>, String> {
    let Some(geometry) = feature.to_geo().map_err(|err| err.to_string())? else {
        return Ok(None);
    };
    geometry
        .to_wkb(CoordDimensions::xy())
        .map(Some)
        .map_err(|err| format!("Failed to encode WKB: {err}"))
}

fn attribute_columns(schema: &SessionSchema, features: &[&Feature]) -> (Vec<ArrayRef>, usize) {
    let mut coerced = 0;
    let columns = schema
        .attributes()
        .fields()
        .iter()
        .map(|field| {
            let values: Vec<Option<&JsonValue>> = features
                .iter()
                .map(|feature| feature.properties.get(field.name()))
                .collect();
            let array = build_array(field, &values);

            let lost = values
                .iter()
                .filter(|v| v.is_some_and(|v| !v.is_null()))
                .count()
                - (array.len() - array.null_count());
            if lost > 0 {
                warn!(
                    "{lost} value(s) of '{}' do not fit {} and were replaced by null",
                    field.name(),
                    field.data_type()
                );
                coerced += lost;
            }
            array
        })
        .collect();
    (columns, coerced)
}

fn build_array(field: &Field, values: &[Option<&JsonValue>]) -> ArrayRef {
    match field.data_type() {
        DataType::Boolean => {
            let array: BooleanArray = values.iter().map(|v| v.and_then(JsonValue::as_bool)).collect();
            Arc::new(array)
        },
        DataType::Int64 => {
            let array: Int64Array = values.iter().map(|v| v.and_then(value_to_i64)).collect();
            Arc::new(array)
        },
        DataType::Float64 => {
            let array: Float64Array = values.iter().map(|v| v.and_then(JsonValue::as_f64)).collect();
            Arc::new(array)
        },
        _ => {
            let array: StringArray = values.iter().map(|v| v.and_then(value_to_text)).collect();
            Arc::new(array)
        },
    }
}

#[allow(clippy::cast_possible_truncation)]
fn value_to_i64(value: &JsonValue) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    // 2.0 fits, 2.5 does not
    let f = value.as_f64()?;
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.fract() == 0.0 && in_range).then_some(f as i64)
}

fn value_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::cast::AsArray;
    use arrow_schema::Schema;
    use geo_traits::{CoordTrait, GeometryTrait, PointTrait};
    use geoarrow_array::GeoArrowArrayAccessor;
    use geoarrow_array::array::GeometryArray;
    use serde_json::json;

    fn schema() -> SessionSchema {
        let attributes = Arc::new(Schema::new(vec![
            Field::new("NAME", DataType::Utf8, true),
            Field::new("COUNT", DataType::Int64, true),
            Field::new("AREA", DataType::Float64, true),
            Field::new("ACTIVE", DataType::Boolean, true),
        ]));
        SessionSchema::new("geometry", "EPSG:3005", attributes)
    }

    fn feature(id: &str, properties: JsonValue, geometry: Option<JsonValue>) -> Feature {
        let JsonValue::Object(properties) = properties else {
            panic!("properties must be an object")
        };
        Feature {
            id: Some(id.to_string()),
            properties,
            geometry: geometry.map(|g| serde_json::from_value(g).unwrap()),
            geometry_name: Some("GEOMETRY".to_string()),
        }
    }

    fn point(x: f64, y: f64) -> Option<JsonValue> {
        Some(json!({"type": "Point", "coordinates": [x, y]}))
    }

    #[test]
    fn spill_batch_has_wkb_geometry() {
        let features = vec![
            feature("a", json!({"NAME": "A", "COUNT": 1}), point(1.0, 2.0)),
            feature("b", json!({"NAME": "B"}), None),
        ];

        let encoded = encode_spill_batch(&schema(), &features).unwrap();
        assert_eq!(encoded.rejected, 0);
        assert_eq!(encoded.batch.num_rows(), 2);
        assert_eq!(encoded.batch.num_columns(), 5);

        let geometry = encoded.batch.column(4).as_binary::<i32>();
        assert!(geometry.is_valid(0));
        assert!(geometry.is_null(1));
    }

    #[test]
    fn incompatible_and_missing_values_become_null() {
        let features = vec![feature(
            "a",
            json!({"NAME": ["x", 1], "COUNT": 2.5, "AREA": 3, "ACTIVE": "yes", "EXTRA": 1}),
            point(0.0, 0.0),
        )];

        let encoded = encode_spill_batch(&schema(), &features).unwrap();
        let batch = &encoded.batch;
        assert_eq!(batch.column(0).as_string::<i32>().value(0), r#"["x",1]"#);
        assert!(batch.column(1).is_null(0));
        assert!(
            (batch
                .column(2)
                .as_primitive::<arrow_array::types::Float64Type>()
                .value(0)
                - 3.0)
                .abs()
                < f64::EPSILON
        );
        assert!(batch.column(3).is_null(0));
        // the array for COUNT and the string for ACTIVE
        assert_eq!(encoded.coerced, 2);
    }

    #[test]
    fn integral_floats_fit_integer_columns() {
        let features = vec![
            feature("a", json!({"COUNT": 2.0}), point(0.0, 0.0)),
            feature("b", json!({"COUNT": 2.5}), point(0.0, 0.0)),
            feature("c", json!({"COUNT": null}), point(0.0, 0.0)),
        ];

        let encoded = encode_native_batch(&schema(), &features).unwrap();
        let counts = encoded
            .batch
            .column(1)
            .as_primitive::<arrow_array::types::Int64Type>();
        assert_eq!(counts.value(0), 2);
        assert!(counts.is_null(1));
        assert!(counts.is_null(2));
        assert_eq!(encoded.coerced, 1);
    }

    #[test]
    fn native_batch_carries_crs_and_geometry() {
        let features = vec![
            feature("a", json!({"NAME": "A"}), point(1.0, 2.0)),
            feature("b", json!({"NAME": "B"}), None),
        ];

        let encoded = encode_native_batch(&schema(), &features).unwrap();
        let batch = encoded.batch;
        let result_schema = batch.schema();
        let field = result_schema.field_with_name("geometry").unwrap();
        let column = batch.column(result_schema.index_of("geometry").unwrap());

        let geometries = GeometryArray::try_from((column.as_ref(), field)).unwrap();
        assert_eq!(geometries.len(), 2);
        assert!(geometries.is_null(1));

        let first = geometries.value(0).unwrap();
        let geo_traits::GeometryType::Point(point) = first.as_type() else {
            panic!("Expected point geometry")
        };
        let coord = point.coord().expect("point should have coordinates");
        assert!((coord.x() - 1.0).abs() < 1e-9);
        assert!((coord.y() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_input_keeps_columns() {
        let encoded = encode_native_batch(&schema(), &[]).unwrap();
        assert_eq!(encoded.batch.num_rows(), 0);
        assert_eq!(encoded.batch.num_columns(), 5);
    }
}
