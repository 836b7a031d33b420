//! Periodic sweep that finalizes trips whose device has gone quiet
//! (component H). Grounded on `end_active_trips_for_device` in
//! `original_source/server/app/services/trip_service.py` for finalize
//! semantics, and the teacher's `eviction()` task for the interval-loop
//! shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::geo::path_distance_km;
use crate::metrics::Metrics;
use crate::persistence::Persistence;
use crate::shutdown::ShutdownCoordinator;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Best-effort reverse geocoding. Supplemented from
/// `original_source/server/app/services/geocoding.py`; no network client
/// ships in this crate (would need a live network in tests) but the seam
/// is real.
pub trait Geocoder: Send + Sync {
    fn reverse_geocode(&self, lat: f64, lon: f64) -> Option<String>;
}

/// Always misses, forcing callers onto the coordinate-string fallback —
/// matches `_format_fallback` in the original.
pub struct NullGeocoder;

impl Geocoder for NullGeocoder {
    fn reverse_geocode(&self, _lat: f64, _lon: f64) -> Option<String> {
        None
    }
}

fn display_name(geocoder: &dyn Geocoder, lat: f64, lon: f64) -> String {
    geocoder
        .reverse_geocode(lat, lon)
        .unwrap_or_else(|| format!("{lat:.4}, {lon:.4}"))
}

pub async fn run<P: Persistence + 'static>(
    persistence: Arc<P>,
    geocoder: Arc<dyn Geocoder>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,
    shutdown: ShutdownCoordinator,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep(&*persistence, &*geocoder, &metrics, &config);
            }
            _ = shutdown.triggered() => {
                debug!("trip watchdog stopping");
                return;
            }
        }
    }
}

fn sweep<P: Persistence>(persistence: &P, geocoder: &dyn Geocoder, metrics: &Metrics, config: &Config) {
    let candidates = match persistence.devices_with_open_trips() {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(error = %err, "watchdog failed to enumerate open trips");
            return;
        }
    };

    let stale_after = chrono::Duration::seconds(config.trip_auto_end_stale_seconds as i64);
    let now = Utc::now();

    for (device_row_id, identity, last_activity) in candidates {
        if now - last_activity < stale_after {
            continue;
        }
        if let Err(err) = finalize_device_trips(persistence, geocoder, device_row_id, now) {
            warn!(identity = %identity, error = %err, "failed to finalize stale trip");
            continue;
        }
        metrics.record_trip_finalized();
    }
}

fn finalize_device_trips<P: Persistence>(
    persistence: &P,
    geocoder: &dyn Geocoder,
    device_row_id: i64,
    now: chrono::DateTime<Utc>,
) -> Result<(), crate::persistence::StoreError> {
    let open_trips = persistence.list_open_by_device(device_row_id)?;
    let last_fix = persistence.last_gps_valid(device_row_id)?;

    for trip in open_trips {
        let (end_time, end_location_id) = match last_fix {
            Some(loc) if loc.timestamp_device >= trip.start_time => (loc.timestamp_device, Some(loc.id)),
            _ => (now, None),
        };

        let leg = persistence.range(device_row_id, trip.start_time, end_time, true)?;
        let points: Vec<(f64, f64)> = leg.iter().map(|l| (l.lat, l.lon)).collect();
        let distance_km = path_distance_km(&points);

        let display = last_fix.map(|loc| display_name(geocoder, loc.lat, loc.lon));

        persistence.finalize_trip(trip.id, end_time, distance_km, end_location_id, display)?;
    }
    Ok(())
}
