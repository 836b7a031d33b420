//! The only exits from the core to storage: a narrow port plus an in-memory
//! reference implementation so the gateway runs and tests standalone.
//!
//! The trait is synchronous from the core's point of view (§4.6: "expected
//! to be synchronous ... but may be dispatched to a worker pool") — an
//! embedder backing this with a real database is free to hop to a blocking
//! pool or an async driver internally, behind the same calls.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;

use crate::codec::{AlarmKind, GpsFix};
use crate::identity::DeviceIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOnlineStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub id: i64,
    pub identity: DeviceIdentity,
    pub name: String,
    pub description: Option<String>,
    pub status: DeviceOnlineStatus,
    pub last_connect: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_lat: Option<f64>,
    pub last_lon: Option<f64>,
    pub battery_pct: Option<u8>,
    pub gsm: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct LocationRow {
    pub id: i64,
    pub device_id: i64,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: u8,
    pub course_deg: u16,
    pub satellites: u8,
    pub gps_valid: bool,
    pub is_alarm: bool,
    pub alarm_kind: Option<AlarmKind>,
    pub timestamp_device: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TripRow {
    pub id: i64,
    pub device_id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub display_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub distance_km: f64,
    pub start_location_id: Option<i64>,
    pub end_location_id: Option<i64>,
}

impl TripRow {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Carried for schema parity with the original's per-user trip settings;
/// no segmentation algorithm in this crate consumes it (see SPEC_FULL §3).
#[derive(Debug, Clone, Copy)]
pub struct TripSettingsRow {
    pub user_id: i64,
    pub stop_split_minutes: u32,
    pub min_trip_minutes: u32,
    pub stop_speed_kmh: f64,
}

/// Carried only because `trips.user_id` references it; no auth code here.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub identity_external: String,
    pub email: String,
    pub name: String,
}

pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The narrow contract consumed by the connection handler, dispatcher, and
/// watchdog. Every method here is a boundary the core calls into — production
/// wiring swaps `InMemoryStore` for a real database behind this same trait.
pub trait Persistence: Send + Sync {
    fn upsert_on_login(&self, identity: DeviceIdentity) -> StoreResult<DeviceRow>;
    fn touch_heartbeat(
        &self,
        identity: DeviceIdentity,
        battery_pct: u8,
        gsm: u8,
        status: DeviceOnlineStatus,
    ) -> StoreResult<()>;
    fn touch_location(
        &self,
        identity: DeviceIdentity,
        lat: f64,
        lon: f64,
        ts: DateTime<Utc>,
    ) -> StoreResult<()>;
    fn mark_offline(&self, identity: DeviceIdentity) -> StoreResult<()>;
    fn insert_location(
        &self,
        device_row_id: i64,
        fix: &GpsFix,
        is_alarm: bool,
        alarm_kind: Option<AlarmKind>,
    ) -> StoreResult<LocationRow>;
    fn list_open_by_device(&self, device_row_id: i64) -> StoreResult<Vec<TripRow>>;
    fn finalize_trip(
        &self,
        trip_id: i64,
        end_time: DateTime<Utc>,
        distance_km: f64,
        end_location_id: Option<i64>,
        display_name: Option<String>,
    ) -> StoreResult<()>;
    fn last_gps_valid(&self, device_row_id: i64) -> StoreResult<Option<LocationRow>>;
    fn range(
        &self,
        device_row_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        gps_valid_only: bool,
    ) -> StoreResult<Vec<LocationRow>>;

    /// Enumerates devices carrying at least one open trip, with the
    /// timestamp the watchdog should judge staleness against
    /// (`last_update`, falling back to `last_connect`). Not one of the
    /// original eight port calls — the original's watchdog queries the
    /// devices table directly; this trait has no raw query escape hatch, so
    /// the sweep needs its own narrow enumeration.
    fn devices_with_open_trips(&self) -> StoreResult<Vec<(i64, DeviceIdentity, DateTime<Utc>)>>;
}

fn device_timestamp_to_utc(fix: &GpsFix, now: DateTime<Utc>) -> DateTime<Utc> {
    if !fix.timestamp.valid {
        return now;
    }
    NaiveDateTime::parse_from_str(
        &format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            fix.timestamp.year,
            fix.timestamp.month,
            fix.timestamp.day,
            fix.timestamp.hour,
            fix.timestamp.minute,
            fix.timestamp.second
        ),
        "%Y-%m-%d %H:%M:%S",
    )
    .map(|naive| naive.and_utc())
    .unwrap_or(now)
}

/// In-memory reference implementation: no durability, no indices. Good
/// enough to make the gateway runnable and its tests self-contained.
pub struct InMemoryStore {
    devices_by_identity: DashMap<DeviceIdentity, i64>,
    devices: DashMap<i64, DeviceRow>,
    locations: DashMap<i64, LocationRow>,
    locations_by_device: DashMap<i64, Vec<i64>>,
    trips: DashMap<i64, TripRow>,
    trips_by_device: DashMap<i64, Vec<i64>>,
    next_device_id: AtomicI64,
    next_location_id: AtomicI64,
    next_trip_id: AtomicI64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            devices_by_identity: DashMap::new(),
            devices: DashMap::new(),
            locations: DashMap::new(),
            locations_by_device: DashMap::new(),
            trips: DashMap::new(),
            trips_by_device: DashMap::new(),
            next_device_id: AtomicI64::new(1),
            next_location_id: AtomicI64::new(1),
            next_trip_id: AtomicI64::new(1),
        }
    }

    /// Opens a trip for `device_row_id` if it has no open trip already.
    /// Used by the connection handler's first Location/Alarm after login —
    /// the wire spec doesn't name a trip-open op explicitly, so this is
    /// folded into `insert_location`'s bookkeeping rather than exposed on
    /// the trait.
    fn ensure_open_trip(&self, device_row_id: i64, start_time: DateTime<Utc>, start_location_id: Option<i64>) {
        let has_open = self
            .trips_by_device
            .get(&device_row_id)
            .map(|ids| {
                ids.iter()
                    .any(|id| self.trips.get(id).map(|t| t.is_open()).unwrap_or(false))
            })
            .unwrap_or(false);
        if has_open {
            return;
        }
        let id = self.next_trip_id.fetch_add(1, Ordering::Relaxed);
        let trip = TripRow {
            id,
            device_id: device_row_id,
            user_id: None,
            name: format!("Trip {}", start_time.format("%Y-%m-%dT%H:%M:%SZ")),
            display_name: None,
            start_time,
            end_time: None,
            distance_km: 0.0,
            start_location_id,
            end_location_id: None,
        };
        self.trips.insert(id, trip);
        self.trips_by_device.entry(device_row_id).or_default().push(id);
    }
}

impl Persistence for InMemoryStore {
    fn upsert_on_login(&self, identity: DeviceIdentity) -> StoreResult<DeviceRow> {
        if let Some(existing_id) = self.devices_by_identity.get(&identity).map(|r| *r) {
            let mut row = self
                .devices
                .get_mut(&existing_id)
                .ok_or_else(|| StoreError("device row vanished".into()))?;
            row.last_connect = Utc::now();
            row.status = DeviceOnlineStatus::Online;
            return Ok(row.clone());
        }
        let id = self.next_device_id.fetch_add(1, Ordering::Relaxed);
        let hex = identity.as_hex();
        let name = format!("Tracker-{}", &hex[hex.len() - 6..]);
        let row = DeviceRow {
            id,
            identity,
            name,
            description: None,
            status: DeviceOnlineStatus::Online,
            last_connect: Utc::now(),
            last_update: None,
            last_lat: None,
            last_lon: None,
            battery_pct: None,
            gsm: None,
        };
        self.devices.insert(id, row.clone());
        self.devices_by_identity.insert(identity, id);
        Ok(row)
    }

    fn touch_heartbeat(
        &self,
        identity: DeviceIdentity,
        battery_pct: u8,
        gsm: u8,
        status: DeviceOnlineStatus,
    ) -> StoreResult<()> {
        let id = *self
            .devices_by_identity
            .get(&identity)
            .ok_or_else(|| StoreError("unknown device".into()))?;
        let mut row = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| StoreError("device row vanished".into()))?;
        row.battery_pct = Some(battery_pct);
        row.gsm = Some(gsm);
        row.status = status;
        row.last_update = Some(Utc::now());
        Ok(())
    }

    fn touch_location(
        &self,
        identity: DeviceIdentity,
        lat: f64,
        lon: f64,
        ts: DateTime<Utc>,
    ) -> StoreResult<()> {
        let id = *self
            .devices_by_identity
            .get(&identity)
            .ok_or_else(|| StoreError("unknown device".into()))?;
        let mut row = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| StoreError("device row vanished".into()))?;
        row.last_lat = Some(lat);
        row.last_lon = Some(lon);
        row.last_update = Some(ts);
        Ok(())
    }

    fn mark_offline(&self, identity: DeviceIdentity) -> StoreResult<()> {
        let id = *self
            .devices_by_identity
            .get(&identity)
            .ok_or_else(|| StoreError("unknown device".into()))?;
        let mut row = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| StoreError("device row vanished".into()))?;
        row.status = DeviceOnlineStatus::Offline;
        Ok(())
    }

    fn insert_location(
        &self,
        device_row_id: i64,
        fix: &GpsFix,
        is_alarm: bool,
        alarm_kind: Option<AlarmKind>,
    ) -> StoreResult<LocationRow> {
        let now = Utc::now();
        let device_ts = device_timestamp_to_utc(fix, now);
        let id = self.next_location_id.fetch_add(1, Ordering::Relaxed);
        let row = LocationRow {
            id,
            device_id: device_row_id,
            lat: fix.latitude,
            lon: fix.longitude,
            speed_kmh: fix.speed_kmh,
            course_deg: fix.course_deg,
            satellites: fix.satellites,
            gps_valid: fix.gps_valid,
            is_alarm,
            alarm_kind,
            timestamp_device: device_ts,
            received_at: now,
        };
        self.locations.insert(id, row);
        self.locations_by_device.entry(device_row_id).or_default().push(id);

        if fix.gps_valid {
            self.ensure_open_trip(device_row_id, device_ts, Some(id));
        }
        Ok(row)
    }

    fn list_open_by_device(&self, device_row_id: i64) -> StoreResult<Vec<TripRow>> {
        let ids = self
            .trips_by_device
            .get(&device_row_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.trips.get(&id).map(|t| t.clone()))
            .filter(|t| t.is_open())
            .collect())
    }

    fn finalize_trip(
        &self,
        trip_id: i64,
        end_time: DateTime<Utc>,
        distance_km: f64,
        end_location_id: Option<i64>,
        display_name: Option<String>,
    ) -> StoreResult<()> {
        let mut trip = self
            .trips
            .get_mut(&trip_id)
            .ok_or_else(|| StoreError("unknown trip".into()))?;
        trip.end_time = Some(end_time);
        trip.distance_km = distance_km;
        trip.end_location_id = end_location_id;
        if display_name.is_some() {
            trip.display_name = display_name;
        }
        Ok(())
    }

    fn last_gps_valid(&self, device_row_id: i64) -> StoreResult<Option<LocationRow>> {
        let ids = self
            .locations_by_device
            .get(&device_row_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.locations.get(&id).map(|l| *l))
            .filter(|l| l.gps_valid)
            .max_by_key(|l| l.timestamp_device))
    }

    fn range(
        &self,
        device_row_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        gps_valid_only: bool,
    ) -> StoreResult<Vec<LocationRow>> {
        let ids = self
            .locations_by_device
            .get(&device_row_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut rows: Vec<LocationRow> = ids
            .into_iter()
            .filter_map(|id| self.locations.get(&id).map(|l| *l))
            .filter(|l| l.timestamp_device >= start && l.timestamp_device <= end)
            .filter(|l| !gps_valid_only || l.gps_valid)
            .collect();
        rows.sort_by_key(|l| l.timestamp_device);
        Ok(rows)
    }

    fn devices_with_open_trips(&self) -> StoreResult<Vec<(i64, DeviceIdentity, DateTime<Utc>)>> {
        let mut out = Vec::new();
        for entry in self.devices.iter() {
            let device_row_id = *entry.key();
            let row = entry.value();
            let has_open = self
                .trips_by_device
                .get(&device_row_id)
                .map(|ids| {
                    ids.iter()
                        .any(|id| self.trips.get(id).map(|t| t.is_open()).unwrap_or(false))
                })
                .unwrap_or(false);
            if has_open {
                let activity = row.last_update.unwrap_or(row.last_connect);
                out.push((device_row_id, row.identity, activity));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
impl InMemoryStore {
    pub(crate) fn trip_by_id_for_test(&self, trip_id: i64) -> Option<TripRow> {
        self.trips.get(&trip_id).map(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(lat: f64, lon: f64, valid: bool) -> GpsFix {
        use crate::codec::DeviceTimestamp;
        GpsFix {
            timestamp: DeviceTimestamp {
                year: 2026,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
                valid: true,
            },
            latitude: lat,
            longitude: lon,
            speed_kmh: 0,
            course_deg: 0,
            satellites: 5,
            gps_valid: valid,
        }
    }

    #[test]
    fn login_defaults_device_name_from_last_six_hex() {
        let store = InMemoryStore::new();
        let id = DeviceIdentity::from_bytes([0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]);
        let row = store.upsert_on_login(id).unwrap();
        assert_eq!(row.name, "Tracker-012345");
    }

    #[test]
    fn relogin_reuses_existing_row() {
        let store = InMemoryStore::new();
        let id = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let first = store.upsert_on_login(id).unwrap();
        let second = store.upsert_on_login(id).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn valid_location_opens_a_trip() {
        let store = InMemoryStore::new();
        let id = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let row = store.upsert_on_login(id).unwrap();
        store.insert_location(row.id, &fix(1.0, 1.0, true), false, None).unwrap();
        let open = store.list_open_by_device(row.id).unwrap();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn invalid_location_does_not_open_a_trip() {
        let store = InMemoryStore::new();
        let id = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let row = store.upsert_on_login(id).unwrap();
        store.insert_location(row.id, &fix(1.0, 1.0, false), false, None).unwrap();
        assert!(store.list_open_by_device(row.id).unwrap().is_empty());
    }

    #[test]
    fn finalize_trip_closes_it() {
        let store = InMemoryStore::new();
        let id = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let row = store.upsert_on_login(id).unwrap();
        store.insert_location(row.id, &fix(1.0, 1.0, true), false, None).unwrap();
        let trip = store.list_open_by_device(row.id).unwrap().remove(0);
        store
            .finalize_trip(trip.id, Utc::now(), 12.3, None, Some("Ride".into()))
            .unwrap();
        assert!(store.list_open_by_device(row.id).unwrap().is_empty());
    }

    #[test]
    fn mark_offline_flips_status() {
        let store = InMemoryStore::new();
        let id = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let row = store.upsert_on_login(id).unwrap();
        store.mark_offline(id).unwrap();
        let updated = store.devices.get(&row.id).unwrap();
        assert_eq!(updated.status, DeviceOnlineStatus::Offline);
    }
}
