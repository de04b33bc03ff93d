//! In-memory geofence index.
//!
//! Zones number in the hundreds but are consulted on every ingest, so the
//! query path reads an immutable snapshot behind an `Arc` swap; readers
//! never block on refresh. A background task rebuilds the snapshot from the
//! database on a bounded interval and on explicit invalidation (zone
//! create/delete). A failed refresh logs and keeps serving the stale
//! snapshot.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::geo;
use crate::model::{Zone, ZoneKind};
use crate::storage::Storage;

/// Shape actually evaluated for a zone.
#[derive(Debug, Clone)]
enum Shape {
    Disk { radius_m: f64 },
    Polygon { vertices: Vec<(f64, f64)> },
}

#[derive(Debug, Clone)]
struct IndexedZone {
    zone: Zone,
    shape: Shape,
}

/// A zone matched against a query point.
#[derive(Debug, Clone)]
pub struct ZoneHit {
    pub zone: Zone,
    /// Whether the point lies inside the zone (closed boundary).
    pub inside: bool,
    /// Signed distance to the zone boundary in meters: negative inside,
    /// positive outside. For disks this is center distance minus radius;
    /// for polygons the minimum edge distance.
    pub boundary_distance_m: f64,
}

/// Point-in-zone index over the active zone set.
pub struct GeofenceIndex {
    snapshot: RwLock<Arc<Snapshot>>,
    invalidate: Notify,
}

struct Snapshot {
    zones: Vec<IndexedZone>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl GeofenceIndex {
    /// An empty index; call [`refresh`](Self::refresh) before serving.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                zones: Vec::new(),
                refreshed_at: None,
            })),
            invalidate: Notify::new(),
        }
    }

    /// Rebuild the snapshot from the database. Zones with no usable shape
    /// are excluded with a warning.
    pub async fn refresh(&self, storage: &Storage) -> anyhow::Result<usize> {
        let zones = storage.active_zones().await?;
        let mut indexed = Vec::with_capacity(zones.len());

        for zone in zones {
            match shape_for(&zone) {
                Some(shape) => indexed.push(IndexedZone { zone, shape }),
                None => warn!(
                    zone_id = zone.id,
                    zone_name = %zone.name,
                    "excluding zone with malformed geometry from snapshot"
                ),
            }
        }

        let count = indexed.len();
        let next = Arc::new(Snapshot {
            zones: indexed,
            refreshed_at: Some(Utc::now()),
        });
        *self.snapshot.write().expect("geofence snapshot lock poisoned") = next;
        debug!(zones = count, "geofence snapshot refreshed");
        Ok(count)
    }

    /// Request an out-of-band refresh from the background task.
    pub fn invalidate(&self) {
        self.invalidate.notify_one();
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .expect("geofence snapshot lock poisoned")
            .clone()
    }

    /// When the snapshot was last rebuilt, if ever.
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.current().refreshed_at
    }

    /// Active zones containing the point. Boundary points count as inside.
    pub fn zones_containing(&self, lat: f64, lon: f64) -> Vec<ZoneHit> {
        self.current()
            .zones
            .iter()
            .filter_map(|iz| {
                let hit = evaluate(iz, lat, lon);
                hit.inside.then_some(hit)
            })
            .collect()
    }

    /// Active zones whose center lies within `radius_m` of the point,
    /// with their boundary distances.
    pub fn zones_within(&self, lat: f64, lon: f64, radius_m: f64) -> Vec<ZoneHit> {
        let mut hits: Vec<ZoneHit> = self
            .current()
            .zones
            .iter()
            .filter(|iz| {
                geo::haversine_m(lat, lon, iz.zone.center_lat, iz.zone.center_lon) <= radius_m
            })
            .map(|iz| evaluate(iz, lat, lon))
            .collect();
        hits.sort_by(|a, b| {
            a.boundary_distance_m
                .partial_cmp(&b.boundary_distance_m)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits
    }

    /// Distance in meters to the boundary of the nearest risky or
    /// restricted zone the point is *outside* of, along with its kind.
    pub fn nearest_hazard(&self, lat: f64, lon: f64) -> Option<(ZoneKind, f64)> {
        self.current()
            .zones
            .iter()
            .filter(|iz| matches!(iz.zone.kind, ZoneKind::Risky | ZoneKind::Restricted))
            .map(|iz| (iz.zone.kind, evaluate(iz, lat, lon).boundary_distance_m))
            .filter(|(_, d)| *d > 0.0)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

impl Default for GeofenceIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the periodic snapshot refresh until the process exits. Serves the
/// stale snapshot through failures.
pub async fn run_refresh_loop(index: Arc<GeofenceIndex>, storage: Storage, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "geofence refresh loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = index.invalidate.notified() => {
                debug!("geofence snapshot invalidated");
            }
        }
        if let Err(err) = index.refresh(&storage).await {
            warn!(error = %err, "geofence snapshot refresh failed; serving stale snapshot");
        }
    }
}

fn shape_for(zone: &Zone) -> Option<Shape> {
    if let Some(bounds) = &zone.bounds {
        if bounds.len() >= 3 {
            return Some(Shape::Polygon {
                vertices: bounds.clone(),
            });
        }
        return None;
    }
    zone.radius_m
        .filter(|r| *r > 0.0)
        .map(|radius_m| Shape::Disk { radius_m })
}

fn evaluate(iz: &IndexedZone, lat: f64, lon: f64) -> ZoneHit {
    match &iz.shape {
        Shape::Disk { radius_m } => {
            let center_dist = geo::haversine_m(lat, lon, iz.zone.center_lat, iz.zone.center_lon);
            ZoneHit {
                zone: iz.zone.clone(),
                inside: center_dist <= *radius_m,
                boundary_distance_m: center_dist - radius_m,
            }
        }
        Shape::Polygon { vertices } => {
            let inside = geo::point_in_polygon(lat, lon, vertices);
            let edge_dist = geo::polygon_boundary_distance_m(lat, lon, vertices);
            ZoneHit {
                zone: iz.zone.clone(),
                inside,
                boundary_distance_m: if inside { -edge_dist } else { edge_dist },
            }
        }
    }
}
