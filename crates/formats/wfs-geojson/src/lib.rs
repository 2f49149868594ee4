//! Decoding of WFS `GetFeature` responses encoded as `GeoJSON`.
//!
//! A WFS 2.0 server answering with `outputFormat=json` returns a `GeoJSON`
//! `FeatureCollection` extended with paging members (`numberMatched`,
//! `numberReturned`, `totalFeatures`), a legacy `crs` member and a per-feature
//! `geometry_name` tag. This crate turns one such body into a [`PageResponse`].

pub mod error;
pub mod parser;

pub use error::{ResponseError, ResponseResult};
pub use parser::{Feature, PageResponse, parse_page_response};
