use geocluster::Options;
use geojson::{Feature, Geometry, JsonObject, Value};
use serde_json::json;

/// The whole-world bounding box.
pub const WORLD: [f64; 4] = [-180.0, -90.0, 180.0, 90.0];

pub fn get_options(radius: f64, extent: f64, min_points: u32, max_zoom: u8) -> Options {
    Options {
        radius,
        extent,
        max_zoom,
        min_zoom: 0,
        min_points,
        ..Default::default()
    }
}

/// A bare point feature at `(lng, lat)`.
pub fn point(lng: f64, lat: f64) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Point(vec![lng, lat]))),
        id: None,
        properties: None,
        foreign_members: None,
    }
}

/// A point feature carrying an explicit property map.
pub fn point_with_properties(lng: f64, lat: f64, properties: JsonObject) -> Feature {
    Feature {
        properties: Some(properties),
        ..point(lng, lat)
    }
}

/// A point feature carrying a `name` property.
pub fn named_point(lng: f64, lat: f64, name: &str) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("name".to_owned(), json!(name));

    point_with_properties(lng, lat, properties)
}

/// A deterministic scatter of named points over the inhabited latitudes,
/// kept away from the antimeridian so whole-world tile sums stay exact.
pub fn scattered_points(count: usize) -> Vec<Feature> {
    // xorshift with a fixed seed, so every run sees the same scatter
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 11) as f64 / (1u64 << 53) as f64
    };

    (0..count)
        .map(|i| {
            let lng = next() * 280.0 - 140.0;
            let lat = next() * 140.0 - 70.0;

            named_point(lng, lat, &format!("place-{i}"))
        })
        .collect()
}

/// Number of stacks produced by [`grid_groups`].
pub const GRID_GROUP_COUNT: usize = 24;

/// Points per stack for group `g` of [`grid_groups`].
pub fn grid_group_size(g: usize) -> usize {
    g % 8 + 1
}

/// Clusters by construction: tight stacks of 1 to 8 points on a coarse
/// world grid, spaced so widely that stacks never merge with each other at
/// any zoom. Every point of group `g` is named `g<g>-p<j>`.
pub fn grid_groups() -> Vec<Feature> {
    let longitudes = [-150.0, -90.0, -30.0, 30.0, 90.0, 150.0];
    let latitudes = [-60.0, -20.0, 20.0, 60.0];

    let mut features = Vec::new();
    let mut g = 0;

    for lat in latitudes {
        for lng in longitudes {
            for j in 0..grid_group_size(g) {
                // spread members by a hair so stacks stay inside the
                // finest clustering radius
                features.push(named_point(
                    lng + j as f64 * 1e-5,
                    lat,
                    &format!("g{g}-p{j}"),
                ));
            }
            g += 1;
        }
    }

    features
}
