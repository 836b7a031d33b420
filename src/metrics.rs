//! Atomic counters exposed over `/metrics`, same shape as the teacher's
//! `Metrics` struct (`AtomicU64`, `Ordering::Relaxed`, one JSON snapshot).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    logins: AtomicU64,
    locations: AtomicU64,
    heartbeats: AtomicU64,
    alarms: AtomicU64,
    command_replies: AtomicU64,
    malformed: AtomicU64,
    crc_mismatches: AtomicU64,
    unauthenticated_dropped: AtomicU64,
    unknown_proto: AtomicU64,
    store_failures: AtomicU64,
    supersedes: AtomicU64,
    commands_sent: AtomicU64,
    commands_timed_out: AtomicU64,
    trips_finalized: AtomicU64,
}

macro_rules! counter_methods {
    ($($field:ident => $incr:ident),* $(,)?) => {
        impl Metrics {
            $(
                pub fn $incr(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter_methods! {
    logins => record_login,
    locations => record_location,
    heartbeats => record_heartbeat,
    alarms => record_alarm,
    command_replies => record_command_reply,
    malformed => record_malformed,
    crc_mismatches => record_crc_mismatch,
    unauthenticated_dropped => record_unauthenticated_dropped,
    unknown_proto => record_unknown_proto,
    store_failures => record_store_failure,
    supersedes => record_supersede,
    commands_sent => record_command_sent,
    commands_timed_out => record_command_timed_out,
    trips_finalized => record_trip_finalized,
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub logins: u64,
    pub locations: u64,
    pub heartbeats: u64,
    pub alarms: u64,
    pub command_replies: u64,
    pub malformed: u64,
    pub crc_mismatches: u64,
    pub unauthenticated_dropped: u64,
    pub unknown_proto: u64,
    pub store_failures: u64,
    pub supersedes: u64,
    pub commands_sent: u64,
    pub commands_timed_out: u64,
    pub trips_finalized: u64,
    pub connected_devices: usize,
}

impl Metrics {
    pub fn snapshot(&self, connected_devices: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            logins: self.logins.load(Ordering::Relaxed),
            locations: self.locations.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            alarms: self.alarms.load(Ordering::Relaxed),
            command_replies: self.command_replies.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            crc_mismatches: self.crc_mismatches.load(Ordering::Relaxed),
            unauthenticated_dropped: self.unauthenticated_dropped.load(Ordering::Relaxed),
            unknown_proto: self.unknown_proto.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            supersedes: self.supersedes.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_timed_out: self.commands_timed_out.load(Ordering::Relaxed),
            trips_finalized: self.trips_finalized.load(Ordering::Relaxed),
            connected_devices,
        }
    }
}
