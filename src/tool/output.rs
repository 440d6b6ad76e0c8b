//! Parsing of map tool output text.
//!
//! Unparseable output never errors here; callers get `None` and decide
//! whether that is a failure.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::domain::{Region, RegionAccumulator};

static COORDINATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+),\s*(\d+),\s*(\d+)\)").expect("coordinate pattern is valid"));

/// Reduce every `(x, y, z)` triple in `output` to a bounding region.
pub fn parse_diff_region(output: &str) -> Option<Region> {
    let mut acc = RegionAccumulator::new();
    for caps in COORDINATE_RE.captures_iter(output) {
        let (Ok(x), Ok(y)) = (caps[1].parse::<i32>(), caps[2].parse::<i32>()) else {
            continue;
        };
        acc.include(x, y);
    }
    acc.finish()
}

/// Find the file named by the last `saving <file>.<ext>` token pair.
pub fn parse_saved_image(output: &str, image_extension: &str) -> Option<PathBuf> {
    let suffix = format!(".{}", image_extension.trim_start_matches('.').to_ascii_lowercase());
    let tokens: Vec<&str> = output.split_whitespace().collect();

    tokens
        .windows(2)
        .rev()
        .filter(|pair| pair[0].eq_ignore_ascii_case("saving"))
        .map(|pair| pair[1].trim_matches(|c| c == '"' || c == '\''))
        .find(|file| file.to_ascii_lowercase().ends_with(&suffix))
        .map(PathBuf::from)
}

/// Extract map bounds from `{"<path>": {"size": [x, y, ...]}}` output.
pub fn parse_map_size(output: &str, input_path: &str) -> Option<Region> {
    let start = output.find('{')?;
    let value: Value = match serde_json::from_str(&output[start..]) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable map size output");
            return None;
        }
    };
    let object = value.as_object()?;

    let info = object
        .get(input_path)
        .or_else(|| (object.len() == 1).then(|| object.values().next()).flatten())?;
    let size = info.get("size")?.as_array()?;
    if size.len() < 2 {
        return None;
    }

    let width = i32::try_from(size[0].as_i64()?).ok()?;
    let height = i32::try_from(size[1].as_i64()?).ok()?;
    Some(Region::from_size(width, height))
}
