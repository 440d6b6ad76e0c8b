//! Rectangular regions of interest on a map.
//!
//! Coordinates are map-local tile coordinates. Spans are inclusive, so a
//! region covering a single tile has an X span and Y span of 1.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A bounded rectangle `(min_x, min_y) - (max_x, max_y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Region {
    /// Create a region from its corners, normalizing reversed corners.
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// Full bounds of a map of the given size, anchored at `(1, 1)`.
    pub fn from_size(width: i32, height: i32) -> Self {
        Self::new(1, 1, width.max(1), height.max(1))
    }

    pub fn span_x(&self) -> i32 {
        self.max_x - self.min_x + 1
    }

    pub fn span_y(&self) -> i32 {
        self.max_y - self.min_y + 1
    }

    pub fn contains(&self, other: &Region) -> bool {
        other.min_x >= self.min_x && other.max_x <= self.max_x && other.min_y >= self.min_y && other.max_y <= self.max_y
    }

    /// Grow undersized axes toward `min_diameter`, never leaving `bounds`.
    ///
    /// Each undersized axis grows one tile at a time, alternating between the
    /// max edge and the min edge. An edge already sitting on the bound is
    /// skipped. Growth stops once the span reaches `min_diameter` or both
    /// edges of the axis sit on the bound.
    pub fn expand_to_minimum(&self, min_diameter: i32, bounds: &Region) -> Region {
        let (min_x, max_x) = expand_axis(self.min_x, self.max_x, min_diameter, bounds.min_x, bounds.max_x);
        let (min_y, max_y) = expand_axis(self.min_y, self.max_y, min_diameter, bounds.min_y, bounds.max_y);
        Region {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Format a corner for the tool's `--min`/`--max` arguments.
    pub fn min_arg(&self) -> String {
        format!("{},{},1", self.min_x, self.min_y)
    }

    pub fn max_arg(&self) -> String {
        format!("{},{},1", self.max_x, self.max_y)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) - ({}, {})", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

impl FromStr for Region {
    type Err = String;

    /// Parse `min_x,min_y,max_x,max_y`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid region {:?}: {}", s, e))?;
        match parts.as_slice() {
            [min_x, min_y, max_x, max_y] => Ok(Region::new(*min_x, *min_y, *max_x, *max_y)),
            _ => Err(format!("invalid region {:?}: expected min_x,min_y,max_x,max_y", s)),
        }
    }
}

fn expand_axis(lo: i32, hi: i32, min_span: i32, lower: i32, upper: i32) -> (i32, i32) {
    if lower > upper {
        return (lo, hi);
    }
    let mut lo = lo.clamp(lower, upper);
    let mut hi = hi.clamp(lower, upper);
    let mut grow_max = true;

    while hi - lo + 1 < min_span && (lo > lower || hi < upper) {
        if grow_max {
            if hi < upper {
                hi += 1;
            }
        } else if lo > lower {
            lo -= 1;
        }
        grow_max = !grow_max;
    }

    (lo, hi)
}

/// Accumulates coordinates into a bounding [`Region`].
///
/// Starts at sentinel extremes and stays unset until the first point.
#[derive(Debug, Clone, Copy)]
pub struct RegionAccumulator {
    min_x: i32,
    min_y: i32,
    max_x: i32,
    max_y: i32,
}

impl RegionAccumulator {
    pub fn new() -> Self {
        Self {
            min_x: i32::MAX,
            min_y: i32::MAX,
            max_x: i32::MIN,
            max_y: i32::MIN,
        }
    }

    pub fn include(&mut self, x: i32, y: i32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn is_set(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    pub fn finish(self) -> Option<Region> {
        self.is_set().then(|| Region {
            min_x: self.min_x,
            min_y: self.min_y,
            max_x: self.max_x,
            max_y: self.max_y,
        })
    }
}

impl Default for RegionAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_corners() {
        let region = Region::new(10, 8, 2, 3);
        assert_eq!(region, Region::new(2, 3, 10, 8));
        assert_eq!(region.span_x(), 9);
        assert_eq!(region.span_y(), 6);
    }

    #[test]
    fn test_from_size() {
        let region = Region::from_size(255, 120);
        assert_eq!(region, Region::new(1, 1, 255, 120));
    }

    #[test]
    fn test_expand_single_tile_within_large_bounds() {
        let bounds = Region::new(1, 1, 10, 10);
        let expanded = Region::new(5, 5, 5, 5).expand_to_minimum(4, &bounds);

        assert!(expanded.span_x() >= 4);
        assert!(expanded.span_y() >= 4);
        assert!(bounds.contains(&expanded));
        assert_eq!(expanded, Region::new(4, 4, 7, 7));
    }

    #[test]
    fn test_expand_saturates_at_bounds() {
        let bounds = Region::new(1, 1, 3, 3);
        let expanded = Region::new(2, 2, 2, 2).expand_to_minimum(4, &bounds);
        assert_eq!(expanded, bounds);
    }

    #[test]
    fn test_expand_at_corner_grows_away_from_edge() {
        let bounds = Region::new(1, 1, 10, 10);
        let expanded = Region::new(1, 10, 1, 10).expand_to_minimum(4, &bounds);
        assert_eq!(expanded, Region::new(1, 7, 4, 10));
    }

    #[test]
    fn test_expand_only_undersized_axis() {
        let bounds = Region::new(1, 1, 100, 100);
        let region = Region::new(10, 20, 30, 20);
        let expanded = region.expand_to_minimum(4, &bounds);
        assert_eq!(expanded.min_x, 10);
        assert_eq!(expanded.max_x, 30);
        assert_eq!(expanded.span_y(), 4);
    }

    #[test]
    fn test_expand_leaves_large_region_alone() {
        let bounds = Region::new(1, 1, 100, 100);
        let region = Region::new(10, 10, 20, 20);
        assert_eq!(region.expand_to_minimum(4, &bounds), region);
    }

    #[test]
    fn test_expand_clamps_region_outside_bounds() {
        let bounds = Region::new(1, 1, 5, 5);
        let expanded = Region::new(4, 4, 9, 9).expand_to_minimum(4, &bounds);
        assert!(bounds.contains(&expanded));
    }

    #[test]
    fn test_accumulator_unset_until_first_point() {
        let acc = RegionAccumulator::new();
        assert!(!acc.is_set());
        assert!(acc.finish().is_none());
    }

    #[test]
    fn test_accumulator_bounds_points() {
        let mut acc = RegionAccumulator::new();
        acc.include(12, 40);
        acc.include(3, 41);
        acc.include(7, 38);
        assert_eq!(acc.finish(), Some(Region::new(3, 38, 12, 41)));
    }

    #[test]
    fn test_tool_args() {
        let region = Region::new(3, 4, 20, 30);
        assert_eq!(region.min_arg(), "3,4,1");
        assert_eq!(region.max_arg(), "20,30,1");
        assert_eq!(region.to_string(), "(3, 4) - (20, 30)");
    }

    #[test]
    fn test_parse_region() {
        assert_eq!("8, 9, 2, 3".parse::<Region>(), Ok(Region::new(2, 3, 8, 9)));
        assert!("1,2,3".parse::<Region>().is_err());
        assert!("a,b,c,d".parse::<Region>().is_err());
    }
}
