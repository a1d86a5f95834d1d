//! Viewport computation for GeoJSON-like feature collections.
//!
//! Coordinates arrive `[longitude, latitude, ...]`; the box is reported latitude-first.
//! Anything that does not look like a coordinate pair is skipped, never an error.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (
            (self.south + self.north) / 2.0,
            (self.west + self.east) / 2.0,
        )
    }

    /// True for a single point (or collinear points on one axis).
    pub fn is_degenerate(&self) -> bool {
        self.south == self.north || self.west == self.east
    }
}

/// Running min/max over the pairs seen so far.
#[derive(Debug, Default)]
struct Extent {
    bounds: Option<BoundingBox>,
}

impl Extent {
    fn push(&mut self, lng: f64, lat: f64) {
        self.bounds = Some(match self.bounds {
            None => BoundingBox {
                south: lat,
                west: lng,
                north: lat,
                east: lng,
            },
            Some(b) => BoundingBox {
                south: b.south.min(lat),
                west: b.west.min(lng),
                north: b.north.max(lat),
                east: b.east.max(lng),
            },
        });
    }
}

/// Bounding box of every coordinate pair in a feature collection, or `None` when there is none.
pub fn bounds_of(collection: &Value) -> Option<BoundingBox> {
    let mut extent = Extent::default();
    let features = collection.get("features").and_then(Value::as_array)?;
    for feature in features {
        if let Some(geometry) = feature.get("geometry") {
            walk_geometry(geometry, &mut extent);
        }
    }
    extent.bounds
}

fn walk_geometry(geometry: &Value, extent: &mut Extent) {
    let mut pending = vec![geometry];
    while let Some(g) = pending.pop() {
        if let Some(coords) = g.get("coordinates") {
            walk_coordinates(coords, extent);
        }
        if let Some(children) = g.get("geometries").and_then(Value::as_array) {
            pending.extend(children.iter());
        }
    }
}

fn walk_coordinates(root: &Value, extent: &mut Extent) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let Some(items) = node.as_array() else {
            continue;
        };
        if items.first().is_some_and(Value::is_number) {
            if items.len() >= 2 {
                if let (Some(lng), Some(lat)) = (items[0].as_f64(), items[1].as_f64()) {
                    if lng.is_finite() && lat.is_finite() {
                        extent.push(lng, lat);
                    }
                }
            }
            continue;
        }
        stack.extend(items.iter().rev());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fc(geometries: Vec<Value>) -> Value {
        json!({
            "type": "FeatureCollection",
            "features": geometries
                .into_iter()
                .map(|g| json!({"type": "Feature", "geometry": g, "properties": {}}))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn no_coordinates_is_none() {
        assert_eq!(bounds_of(&json!({})), None);
        assert_eq!(bounds_of(&json!({"features": []})), None);
        assert_eq!(bounds_of(&fc(vec![json!(null)])), None);
        assert_eq!(
            bounds_of(&fc(vec![json!({"type": "Point", "coordinates": ["a", "b"]})])),
            None
        );
    }

    #[test]
    fn single_point_is_degenerate_box() {
        let b = bounds_of(&fc(vec![json!({"type": "Point", "coordinates": [-73.9, 40.7]})]))
            .unwrap();
        assert_eq!(
            b,
            BoundingBox {
                south: 40.7,
                west: -73.9,
                north: 40.7,
                east: -73.9
            }
        );
        assert!(b.is_degenerate());
    }

    #[test]
    fn polygon_ring_bounds() {
        let expected = BoundingBox {
            south: 40.70,
            west: -74.0,
            north: 40.80,
            east: -73.9,
        };
        let polygon = json!({"type": "Polygon", "coordinates": [[[-74.0, 40.70], [-73.9, 40.80]]]});
        assert_eq!(bounds_of(&fc(vec![polygon])), Some(expected));

        let multi = json!({
            "type": "MultiPolygon",
            "coordinates": [[[[[[-74.0, 40.70]]], [[-73.9, 40.80]]]]]
        });
        assert_eq!(bounds_of(&fc(vec![multi])), Some(expected));
    }

    #[test]
    fn malformed_leaves_are_skipped() {
        let g = json!({
            "type": "LineString",
            "coordinates": [[-74.0, 40.70], [1.0], "x", [2.0, "y"], null, [-73.9, 40.80, 12.0]]
        });
        let b = bounds_of(&fc(vec![g])).unwrap();
        assert_eq!(b.west, -74.0);
        assert_eq!(b.east, -73.9);
        assert_eq!(b.north, 40.80);
    }

    #[test]
    fn features_without_geometry_are_skipped() {
        let value = json!({
            "features": [
                {"type": "Feature"},
                "not a feature",
                {"geometry": {"type": "Point"}},
                {"geometry": {"type": "Point", "coordinates": [10.0, 20.0]}}
            ]
        });
        assert_eq!(
            bounds_of(&value),
            Some(BoundingBox {
                south: 20.0,
                west: 10.0,
                north: 20.0,
                east: 10.0
            })
        );
    }

    #[test]
    fn geometry_collection_members_are_walked() {
        let g = json!({
            "type": "GeometryCollection",
            "geometries": [
                {"type": "Point", "coordinates": [1.0, 2.0]},
                {"type": "Point", "coordinates": [3.0, -4.0]}
            ]
        });
        let b = bounds_of(&fc(vec![g])).unwrap();
        assert_eq!(b.south, -4.0);
        assert_eq!(b.north, 2.0);
        assert_eq!(b.center(), (-1.0, 2.0));
    }

    #[test]
    fn deep_nesting_does_not_overflow() {
        let mut coords = json!([5.0, 6.0]);
        for _ in 0..2_000 {
            coords = Value::Array(vec![coords]);
        }
        let value = json!({"features": [{"geometry": {"coordinates": coords}}]});
        let b = bounds_of(&value).unwrap();
        assert_eq!((b.south, b.west), (6.0, 5.0));
    }
}
