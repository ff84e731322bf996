//! Search filters and the bounds at which they stop restricting anything.
//!
//! The explorer UI exposes the size and shape-count filters as sliders whose
//! ceilings mean "no limit". A bound sitting at its default is never turned
//! into a query predicate; the accessors below return `Some` only for bounds
//! that actually narrow the result set.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// File-size slider ceiling (50 MiB). A max-size at or above it is no filter.
pub const MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// Shape-count slider ceiling. A max-shapes at or above it is no filter.
pub const MAX_SHAPE_COUNT: u32 = 500;

/// Sparse set of optional search predicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Only shapes that are favorited, or whose stencil is.
    pub favorites_only: bool,

    /// Stencil modified on or after this day.
    pub date_start: Option<NaiveDate>,

    /// Stencil modified on or before this day.
    pub date_end: Option<NaiveDate>,

    /// Stencil file size bounds in bytes.
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,

    /// Stencil shape-count bounds.
    pub min_shapes: Option<u32>,
    pub max_shapes: Option<u32>,

    /// Shape dimension bounds; a zero max means "no limit".
    pub min_width: Option<f64>,
    pub max_width: Option<f64>,
    pub min_height: Option<f64>,
    pub max_height: Option<f64>,

    /// Only shapes with a non-empty property map.
    pub has_properties: bool,

    /// Substring matched against the serialized property map.
    pub property_name: Option<String>,
    pub property_value: Option<String>,
}

impl SearchFilters {
    pub fn min_size_bound(&self) -> Option<u64> {
        self.min_size.filter(|&v| v > 0)
    }

    pub fn max_size_bound(&self) -> Option<u64> {
        self.max_size.filter(|&v| v > 0 && v < MAX_FILE_SIZE_BYTES)
    }

    pub fn min_shapes_bound(&self) -> Option<u32> {
        self.min_shapes.filter(|&v| v > 0)
    }

    pub fn max_shapes_bound(&self) -> Option<u32> {
        self.max_shapes.filter(|&v| v > 0 && v < MAX_SHAPE_COUNT)
    }

    pub fn min_width_bound(&self) -> Option<f64> {
        self.min_width.filter(|&v| v > 0.0)
    }

    pub fn max_width_bound(&self) -> Option<f64> {
        self.max_width.filter(|&v| v > 0.0)
    }

    pub fn min_height_bound(&self) -> Option<f64> {
        self.min_height.filter(|&v| v > 0.0)
    }

    pub fn max_height_bound(&self) -> Option<f64> {
        self.max_height.filter(|&v| v > 0.0)
    }

    pub fn property_name_bound(&self) -> Option<&str> {
        non_blank(self.property_name.as_deref())
    }

    pub fn property_value_bound(&self) -> Option<&str> {
        non_blank(self.property_value.as_deref())
    }

    /// True when no filter would narrow the result set.
    pub fn is_unrestricted(&self) -> bool {
        !self.favorites_only
            && self.date_start.is_none()
            && self.date_end.is_none()
            && self.min_size_bound().is_none()
            && self.max_size_bound().is_none()
            && self.min_shapes_bound().is_none()
            && self.max_shapes_bound().is_none()
            && self.min_width_bound().is_none()
            && self.max_width_bound().is_none()
            && self.min_height_bound().is_none()
            && self.max_height_bound().is_none()
            && !self.has_properties
            && self.property_name_bound().is_none()
            && self.property_value_bound().is_none()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
