#![forbid(unsafe_code)]

//! Hierarchical, zoom-indexed clustering of geographic point features.
//!
//! [`GeoCluster`] projects input GeoJSON points onto the unit square with a
//! spherical Web-Mercator projection and precomputes one KD-tree-indexed
//! cluster layer per integer zoom between `min_zoom` and `max_zoom + 1`.
//! Each coarser layer is built by a single greedy pass that collapses
//! records lying within a zoom-dependent pixel radius into weighted-center
//! cluster points. Queries read the precomputed stack: clusters by slippy
//! tile or bounding box, a cluster's children and paginated leaves, and the
//! zoom at which a cluster first splits.
//!
//! ```
//! use geocluster::{GeoCluster, Options};
//! use geojson::{Feature, Geometry, Value};
//!
//! let features = vec![Feature {
//!     bbox: None,
//!     geometry: Some(Geometry::new(Value::Point(vec![-73.99, 40.73]))),
//!     id: None,
//!     properties: None,
//!     foreign_members: None,
//! }];
//!
//! let mut index = GeoCluster::new(Options::default());
//! index.load(features);
//!
//! let tile = index.get_tile(0, 0, 0).expect("tile is not empty");
//! assert_eq!(tile.features.len(), 1);
//! ```

mod cluster;
mod kdtree;
mod mercator;

pub mod error;

pub use error::{ClusterError, Result};

use std::fmt;
use std::time::Instant;

use geojson::feature::Id;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue, Value};
use log::{debug, warn};
use serde_json::json;

use cluster::{decode_cluster_id, encode_cluster_id, ClusterData, Layer, MAX_LAYER_LEN};
use mercator::{lat_y, lng_x, x_lng, y_lat};

/// Property transform applied once to every input feature when aggregation
/// is configured. Absent, the input properties are carried as-is.
pub type MapFn = Box<dyn Fn(&JsonObject) -> JsonObject + Send + Sync>;

/// Fold combining a child's aggregated properties into its cluster's
/// accumulator during a coarsening pass. Must be associative over repeated
/// map outputs; children are folded in neighbor-visit order.
pub type ReduceFn = Box<dyn Fn(&mut JsonObject, &JsonObject) + Send + Sync>;

/// Clustering configuration.
pub struct Options {
    /// Coarsest zoom level to generate clusters on.
    pub min_zoom: u8,

    /// Finest zoom level to cluster the points on; leaf singletons live at
    /// `max_zoom + 1`.
    pub max_zoom: u8,

    /// Cluster radius in tile pixels.
    pub radius: f64,

    /// Tile extent in pixels; together with `radius` it fixes the projected
    /// clustering radius `radius / (extent * 2^zoom)`.
    pub extent: f64,

    /// Minimum number of original points required to admit a cluster;
    /// smaller neighborhoods pass through unclustered.
    pub min_points: u32,

    /// Give singleton tile features their input index as the feature id.
    pub generate_id: bool,

    /// Size of the KD-tree leaf node, affects indexing performance only.
    pub node_size: usize,

    /// Optional property transform run once per input feature.
    pub map: Option<MapFn>,

    /// Optional fold combining child properties during clustering; property
    /// aggregation is active only when this is set.
    pub reduce: Option<ReduceFn>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            min_zoom: 0,
            max_zoom: 16,
            radius: 40.0,
            extent: 512.0,
            min_points: 2,
            generate_id: false,
            node_size: 64,
            map: None,
            reduce: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("min_zoom", &self.min_zoom)
            .field("max_zoom", &self.max_zoom)
            .field("radius", &self.radius)
            .field("extent", &self.extent)
            .field("min_points", &self.min_points)
            .field("generate_id", &self.generate_id)
            .field("node_size", &self.node_size)
            .field("map", &self.map.is_some())
            .field("reduce", &self.reduce.is_some())
            .finish()
    }
}

/// A precomputed stack of cluster layers over a set of point features.
pub struct GeoCluster {
    /// Configuration settings.
    options: Options,

    /// Input features in load order; singleton records refer back by index.
    points: Vec<Feature>,

    /// One layer per zoom in `[0, max_zoom + 1]`. Zooms below `min_zoom`
    /// stay empty and are never addressed thanks to `limit_zoom`.
    layers: Vec<Layer>,
}

impl GeoCluster {
    /// Create an engine with the given configuration. Queries issued before
    /// [`load`](Self::load) behave as if an empty collection had been
    /// loaded.
    ///
    /// # Panics
    ///
    /// Panics when `min_zoom > max_zoom`, when `max_zoom > 30` (the id
    /// codec packs `zoom + 1` into 5 bits), or when `min_points < 2`
    /// (singletons must keep their input index as id).
    pub fn new(options: Options) -> Self {
        assert!(
            options.min_zoom <= options.max_zoom,
            "min_zoom must not exceed max_zoom"
        );
        assert!(
            options.max_zoom <= 30,
            "max_zoom above 30 cannot be encoded in cluster ids"
        );
        assert!(options.min_points >= 2, "clusters need at least two points");

        let layers = (0..options.max_zoom as usize + 2)
            .map(|_| Layer::default())
            .collect();

        GeoCluster {
            options,
            points: Vec::new(),
            layers,
        }
    }

    /// Project the input features and build the cluster hierarchy, from the
    /// leaf layer at `max_zoom + 1` down to `min_zoom`. After this the
    /// structure is read-only; no query mutates it.
    ///
    /// Features without point geometry are skipped; the indices of the
    /// remaining singletons keep matching their input positions.
    pub fn load(&mut self, features: Vec<Feature>) -> &mut Self {
        let started = Instant::now();

        self.points = features;
        assert!(
            self.points.len() < MAX_LAYER_LEN,
            "too many input features for 32-bit cluster ids"
        );

        // Generate a leaf record for each point and index them into a
        // KD-tree.
        let aggregate = self.options.reduce.is_some();
        let mut leaves = Vec::with_capacity(self.points.len());

        for (i, feature) in self.points.iter().enumerate() {
            let (lng, lat) = match point_coordinates(feature) {
                Some(position) => position,
                None => {
                    warn!("skipping feature {i}: geometry is not a point");
                    continue;
                }
            };

            let properties = aggregate.then(|| self.map_properties(feature));
            leaves.push(ClusterData::leaf(i as u32, lng_x(lng), lat_y(lat), properties));
        }

        debug!(
            "indexed {} leaf points at zoom {}",
            leaves.len(),
            self.options.max_zoom + 1
        );

        let leaf_zoom = self.options.max_zoom as usize + 1;
        self.layers[leaf_zoom] = Layer::build(leaves, self.options.node_size);

        // Cluster the leaves on max_zoom, then cluster the results on the
        // next coarser zoom, and so on down to min_zoom.
        for zoom in (self.options.min_zoom..=self.options.max_zoom).rev() {
            let z = zoom as usize;
            let next = self.coarsen(z + 1, zoom);

            debug!("built {} clusters at zoom {zoom}", next.len());
            self.layers[z] = Layer::build(next, self.options.node_size);
        }

        debug!("cluster hierarchy ready in {:?}", started.elapsed());
        self
    }

    /// Clusters and singletons inside `bbox` (`[west, south, east, north]`
    /// in degrees) at the given zoom, rendered back to GeoJSON.
    ///
    /// A box whose eastern edge ends up west of its western edge after
    /// longitude normalization crosses the antimeridian and is queried in
    /// two halves.
    ///
    /// # Errors
    ///
    /// [`ClusterError::LatitudeOutOfRange`] when `south` or `north` is
    /// outside `[-90, 90]`.
    pub fn get_clusters(&self, bbox: [f64; 4], zoom: u8) -> Result<Vec<Feature>> {
        for lat in [bbox[1], bbox[3]] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ClusterError::LatitudeOutOfRange(lat));
            }
        }

        let mut min_lng = ((bbox[0] + 180.0) % 360.0 + 360.0) % 360.0 - 180.0;
        let min_lat = bbox[1];
        let mut max_lng = if bbox[2] == 180.0 {
            180.0
        } else {
            ((bbox[2] + 180.0) % 360.0 + 360.0) % 360.0 - 180.0
        };
        let max_lat = bbox[3];

        if bbox[2] - bbox[0] >= 360.0 {
            min_lng = -180.0;
            max_lng = 180.0;
        } else if min_lng > max_lng {
            let eastern = self.get_clusters([min_lng, min_lat, 180.0, max_lat], zoom)?;
            let western = self.get_clusters([-180.0, min_lat, max_lng, max_lat], zoom)?;

            return Ok(eastern.into_iter().chain(western).collect());
        }

        let layer = &self.layers[self.limit_zoom(zoom)];
        let mut clusters = Vec::new();

        layer.tree.range(
            lng_x(min_lng),
            lat_y(max_lat),
            lng_x(max_lng),
            lat_y(min_lat),
            |i| clusters.push(self.feature_for(&layer.clusters[i])),
        );

        Ok(clusters)
    }

    /// Features intersecting slippy-map tile `(zoom, x, y)`, with point
    /// coordinates in tile-local integer space scaled to `extent`.
    ///
    /// Tiles in the first and last columns are additionally queried on the
    /// wrapped side of the antimeridian; those features land just outside
    /// the canonical tile so the seam renders without a gap. Returns `None`
    /// when nothing intersects the tile.
    pub fn get_tile(&self, zoom: u8, x: u32, y: u32) -> Option<FeatureCollection> {
        let layer = &self.layers[self.limit_zoom(zoom)];
        let z2 = 2f64.powi(i32::from(zoom));
        let p = self.options.radius / self.options.extent;
        let tx = f64::from(x);
        let ty = f64::from(y);
        let top = (ty - p) / z2;
        let bottom = (ty + 1.0 + p) / z2;

        let mut features = Vec::new();

        let bounds = [(tx - p) / z2, top, (tx + 1.0 + p) / z2, bottom];
        self.tile_features(layer, bounds, tx, ty, z2, &mut features);

        if x == 0 {
            let bounds = [1.0 - p / z2, top, 1.0, bottom];
            self.tile_features(layer, bounds, z2, ty, z2, &mut features);
        }
        if tx == z2 - 1.0 {
            let bounds = [0.0, top, p / z2, bottom];
            self.tile_features(layer, bounds, -1.0, ty, z2, &mut features);
        }

        if features.is_empty() {
            return None;
        }

        Some(FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        })
    }

    /// The direct children of a cluster: the records of the next-finer
    /// layer that were absorbed into it.
    ///
    /// # Errors
    ///
    /// [`ClusterError::MalformedClusterId`] when the id cannot carry a
    /// cluster's zoom field, [`ClusterError::ClusterNotFound`] when it does
    /// not resolve to a cluster record.
    pub fn get_children(&self, cluster_id: u32) -> Result<Vec<Feature>> {
        let mut children = Vec::new();

        self.each_child(cluster_id, |c| children.push(self.feature_for(c)))?;

        Ok(children)
    }

    /// Up to `limit` of the original input features inside a cluster,
    /// skipping the first `offset` in depth-first child order. UI callers
    /// typically page with `limit = 10` from `offset = 0` upward.
    ///
    /// # Errors
    ///
    /// Propagates the [`get_children`](Self::get_children) errors for an
    /// unresolvable `cluster_id`.
    pub fn get_leaves(&self, cluster_id: u32, limit: u32, offset: u32) -> Result<Vec<Feature>> {
        let mut leaves = Vec::new();

        self.append_leaves(&mut leaves, cluster_id, limit as usize, offset as usize, &mut 0)?;

        Ok(leaves)
    }

    /// The first zoom at which a cluster splits into more than one entity.
    ///
    /// Walks single-child chains down from the cluster's origin zoom; a
    /// cluster that never splits within the built range reports
    /// `max_zoom + 1`.
    ///
    /// # Errors
    ///
    /// Propagates the [`get_children`](Self::get_children) errors for an
    /// unresolvable `cluster_id`.
    pub fn get_cluster_expansion_zoom(&self, cluster_id: u32) -> Result<u8> {
        let (_, origin_zoom) = decode_cluster_id(cluster_id);
        if origin_zoom == 0 {
            return Err(ClusterError::MalformedClusterId(cluster_id));
        }

        let mut cluster_id = cluster_id;
        let mut expansion_zoom = origin_zoom as u8 - 1;

        while expansion_zoom <= self.options.max_zoom {
            let children = self.get_children(cluster_id)?;

            expansion_zoom += 1;

            if children.len() != 1 {
                break;
            }

            match cluster_summary(&children[0]) {
                Some((child_id, _)) => cluster_id = child_id,
                // the lone child is an original point; nothing left to expand
                None => break,
            }
        }

        Ok(expansion_zoom)
    }

    /// One greedy coarsening pass: collapse the records of layer
    /// `prev_index` into the records of `zoom`, assigning parent ids along
    /// the way. The first unvisited record in index order wins its
    /// neighborhood.
    fn coarsen(&mut self, prev_index: usize, zoom: u8) -> Vec<ClusterData> {
        let r = self.options.radius / (self.options.extent * 2f64.powi(i32::from(zoom)));
        let min_points = self.options.min_points;
        let reduce = self.options.reduce.as_ref();
        let prev = &mut self.layers[prev_index];

        let mut next: Vec<ClusterData> = Vec::new();
        // Traversal state lives in a per-pass bitset, keeping the records
        // themselves free of scratch fields.
        let mut visited = vec![false; prev.clusters.len()];
        let mut neighbors: Vec<usize> = Vec::new();

        for i in 0..prev.clusters.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;

            let seed_x = prev.clusters[i].x;
            let seed_y = prev.clusters[i].y;
            let seed_points = prev.clusters[i].num_points;

            neighbors.clear();
            prev.tree.within(seed_x, seed_y, r, |id| {
                if !visited[id] {
                    neighbors.push(id);
                }
            });

            let total = seed_points
                + neighbors
                    .iter()
                    .map(|&n| prev.clusters[n].num_points)
                    .sum::<u32>();

            // Too few points in the neighborhood: pass the record through
            // untouched and leave its neighbors for a later seed.
            if total < min_points {
                next.push(prev.clusters[i].clone());
                continue;
            }

            assert!(
                next.len() < MAX_LAYER_LEN,
                "zoom {zoom} holds more records than cluster ids can address"
            );
            let id = encode_cluster_id(next.len(), zoom);

            let mut wx = seed_x * f64::from(seed_points);
            let mut wy = seed_y * f64::from(seed_points);
            let mut properties = prev.clusters[i].properties.clone();

            for &n in &neighbors {
                visited[n] = true;

                let b = &mut prev.clusters[n];
                b.parent_id = id;
                wx += b.x * f64::from(b.num_points);
                wy += b.y * f64::from(b.num_points);

                if let (Some(accumulated), Some(reduce)) = (properties.as_mut(), reduce) {
                    if let Some(addend) = b.properties.as_ref() {
                        reduce(accumulated, addend);
                    }
                }
            }

            prev.clusters[i].parent_id = id;

            let total_f = f64::from(total);
            next.push(ClusterData {
                x: wx / total_f,
                y: wy / total_f,
                num_points: total,
                id,
                parent_id: 0,
                properties,
            });
        }

        next
    }

    /// Resolve a cluster id and invoke `visit` with each record of the
    /// next-finer layer whose parent it is.
    fn each_child<F>(&self, cluster_id: u32, mut visit: F) -> Result<()>
    where
        F: FnMut(&ClusterData),
    {
        let (origin_index, origin_zoom) = decode_cluster_id(cluster_id);
        if origin_zoom == 0 {
            return Err(ClusterError::MalformedClusterId(cluster_id));
        }

        // The cluster record itself lives one layer coarser than the
        // records it absorbed.
        let origin = self
            .layers
            .get(origin_zoom - 1)
            .and_then(|layer| layer.clusters.get(origin_index))
            .ok_or(ClusterError::ClusterNotFound(cluster_id))?;
        if origin.id != cluster_id || origin.num_points == 1 {
            return Err(ClusterError::ClusterNotFound(cluster_id));
        }

        let child_layer = self
            .layers
            .get(origin_zoom)
            .ok_or(ClusterError::ClusterNotFound(cluster_id))?;
        let r = self.options.radius / (self.options.extent * 2f64.powi(origin_zoom as i32 - 1));

        let mut found = false;
        child_layer.tree.within(origin.x, origin.y, r, |i| {
            let child = &child_layer.clusters[i];
            if child.parent_id == cluster_id {
                found = true;
                visit(child);
            }
        });

        if found {
            Ok(())
        } else {
            Err(ClusterError::ClusterNotFound(cluster_id))
        }
    }

    /// Depth-first leaf collection; `skipped` tracks how much of the offset
    /// window has been consumed across the recursion.
    fn append_leaves(
        &self,
        result: &mut Vec<Feature>,
        cluster_id: u32,
        limit: usize,
        offset: usize,
        skipped: &mut usize,
    ) -> Result<()> {
        for child in self.get_children(cluster_id)? {
            if result.len() == limit {
                break;
            }

            match cluster_summary(&child) {
                Some((child_id, point_count)) => {
                    if *skipped + point_count <= offset {
                        // the offset swallows this branch whole
                        *skipped += point_count;
                    } else {
                        self.append_leaves(result, child_id, limit, offset, skipped)?;
                    }
                }
                None if *skipped < offset => *skipped += 1,
                None => result.push(child),
            }
        }

        Ok(())
    }

    /// Run the tree query for one tile rectangle and append the hits with
    /// coordinates relative to tile column `tx`.
    fn tile_features(
        &self,
        layer: &Layer,
        bounds: [f64; 4],
        tx: f64,
        ty: f64,
        z2: f64,
        out: &mut Vec<Feature>,
    ) {
        let extent = self.options.extent;

        layer.tree.range(bounds[0], bounds[1], bounds[2], bounds[3], |i| {
            let c = &layer.clusters[i];

            let (properties, id) = if c.num_points > 1 {
                (Some(cluster_properties(c)), Some(Id::Number(c.id.into())))
            } else {
                let original = &self.points[c.id as usize];
                let id = if self.options.generate_id {
                    Some(Id::Number(c.id.into()))
                } else {
                    original.id.clone()
                };

                (original.properties.clone(), id)
            };

            out.push(Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![
                    (extent * (c.x * z2 - tx)).round(),
                    (extent * (c.y * z2 - ty)).round(),
                ]))),
                id,
                properties,
                foreign_members: None,
            });
        });
    }

    /// A record rendered back to GeoJSON: singletons return the original
    /// input feature, clusters a synthesized point feature at the weighted
    /// center.
    fn feature_for(&self, c: &ClusterData) -> Feature {
        if c.num_points == 1 {
            return self.points[c.id as usize].clone();
        }

        Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::Point(vec![x_lng(c.x), y_lat(c.y)]))),
            id: Some(Id::Number(c.id.into())),
            properties: Some(cluster_properties(c)),
            foreign_members: None,
        }
    }

    /// The input properties of a feature run through the configured map
    /// hook (identity when only a reduce hook was supplied).
    fn map_properties(&self, feature: &Feature) -> JsonObject {
        let raw = feature.properties.clone().unwrap_or_default();

        match &self.options.map {
            Some(map) => map(&raw),
            None => raw,
        }
    }

    /// Clamp a query zoom into the range of built layers.
    fn limit_zoom(&self, zoom: u8) -> usize {
        usize::from(zoom.max(self.options.min_zoom)).min(self.options.max_zoom as usize + 1)
    }
}

/// Longitude/latitude of a feature's point geometry, if it has one.
fn point_coordinates(feature: &Feature) -> Option<(f64, f64)> {
    match &feature.geometry {
        Some(Geometry {
            value: Value::Point(position),
            ..
        }) if position.len() >= 2 => Some((position[0], position[1])),
        _ => None,
    }
}

/// The synthesized property map of a cluster feature: the aggregated
/// map/reduce output merged with the cluster bookkeeping fields.
fn cluster_properties(c: &ClusterData) -> JsonObject {
    let mut properties = c.properties.clone().unwrap_or_default();

    properties.insert("cluster".to_owned(), json!(true));
    properties.insert("cluster_id".to_owned(), json!(c.id));
    properties.insert("point_count".to_owned(), json!(c.num_points));
    properties.insert(
        "point_count_abbreviated".to_owned(),
        json!(abbreviate(c.num_points)),
    );

    properties
}

/// `(cluster_id, point_count)` of a synthesized cluster feature, or `None`
/// for a pass-through input feature.
fn cluster_summary(feature: &Feature) -> Option<(u32, usize)> {
    let properties = feature.properties.as_ref()?;

    if !properties
        .get("cluster")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
    {
        return None;
    }

    let id = properties.get("cluster_id")?.as_u64()?;
    let count = properties.get("point_count")?.as_u64()?;

    Some((id as u32, count as usize))
}

/// Display form of a point count: `805`, `1.2k`, `24k`.
fn abbreviate(count: u32) -> String {
    if count >= 10_000 {
        format!("{}k", (f64::from(count) / 1_000.0).round())
    } else if count >= 1_000 {
        format!("{}k", (f64::from(count) / 100.0).round() / 10.0)
    } else {
        count.to_string()
    }
}
