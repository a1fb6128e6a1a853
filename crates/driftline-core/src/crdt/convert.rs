//! Conversion between lines and Loro values.

use kurbo::Point;
use loro::{LoroList, LoroMap, LoroMapValue, LoroResult, LoroValue};

use crate::line::{Color, Line};

pub(crate) const KEY_ID: &str = "id";
pub(crate) const KEY_POINTS: &str = "points";
pub(crate) const KEY_USER_COLOR: &str = "user_color";
pub(crate) const KEY_IS_COMPLETE: &str = "is_complete";

fn get_string(map: &LoroMapValue, key: &str) -> Option<String> {
    match map.get(key)? {
        LoroValue::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn get_bool(map: &LoroMapValue, key: &str) -> Option<bool> {
    match map.get(key)? {
        LoroValue::Bool(b) => Some(*b),
        _ => None,
    }
}

fn as_double(value: &LoroValue) -> Option<f64> {
    match value {
        LoroValue::Double(d) => Some(*d),
        LoroValue::I64(i) => Some(*i as f64),
        _ => None,
    }
}

/// Write a line into an empty Loro map and return the handle of its points list.
pub fn line_to_loro(line: &Line, map: &LoroMap) -> LoroResult<LoroList> {
    map.insert(KEY_ID, line.id.as_str())?;
    map.insert(KEY_USER_COLOR, line.user_color.to_hex())?;
    map.insert(KEY_IS_COMPLETE, line.is_complete)?;

    // Points are stored as a list of [x, y] pairs
    let points = map.insert_container(KEY_POINTS, LoroList::new())?;
    for point in &line.points {
        push_point(&points, *point)?;
    }
    Ok(points)
}

/// Append one point to a points list.
pub fn push_point(points: &LoroList, point: Point) -> LoroResult<()> {
    let pair = points.insert_container(points.len(), LoroList::new())?;
    pair.push(point.x)?;
    pair.push(point.y)?;
    Ok(())
}

fn point_from_loro(value: &LoroValue) -> Option<Point> {
    let LoroValue::List(coords) = value else {
        return None;
    };
    let x = as_double(coords.first()?)?;
    let y = as_double(coords.get(1)?)?;
    Some(Point::new(x, y))
}

/// Convert a Loro map value to a line.
///
/// Returns `None` for maps missing their identity or color.
pub fn line_from_loro(map: &LoroMapValue) -> Option<Line> {
    let id = get_string(map, KEY_ID)?;
    let user_color = Color::from_hex(&get_string(map, KEY_USER_COLOR)?)?;
    let is_complete = get_bool(map, KEY_IS_COMPLETE).unwrap_or(false);

    let points = match map.get(KEY_POINTS) {
        Some(LoroValue::List(list)) => list.iter().filter_map(point_from_loro).collect(),
        _ => Vec::new(),
    };

    Some(Line {
        id,
        points,
        user_color,
        is_complete,
    })
}
