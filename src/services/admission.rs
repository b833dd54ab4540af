//! Per-client admission control.
//!
//! Every (client address, operation) pair owns a sliding one-second window of
//! tickets. A request is admitted only if both the request count and the byte
//! total of the window, including the new request, stay within the configured
//! limits. Denied requests leave the window untouched.

use crate::models::operation::ClientOperationKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Length of the sliding window tickets are counted in.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Default period of the background sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Process-wide limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionLimits {
    pub requests_per_second: Option<u64>,
    pub bytes_per_second: Option<u64>,
}

impl AdmissionLimits {
    pub const UNLIMITED: Self = Self {
        requests_per_second: None,
        bytes_per_second: None,
    };

    /// Build limits from raw configuration values, where `0` disables a limit.
    pub fn from_raw(requests_per_second: u64, bytes_per_second: u64) -> Self {
        Self {
            requests_per_second: (requests_per_second > 0).then_some(requests_per_second),
            bytes_per_second: (bytes_per_second > 0).then_some(bytes_per_second),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.requests_per_second.is_none() && self.bytes_per_second.is_none()
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    RateExceeded,
    BandwidthExceeded,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::RateExceeded => f.write_str("too many requests per second"),
            Denial::BandwidthExceeded => f.write_str("too many bytes per second"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(Denial),
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// One admitted request.
#[derive(Debug, Clone, Copy)]
struct RequestTicket {
    bytes: u64,
    admitted_at: Instant,
}

/// Tickets of a single key, oldest first.
#[derive(Debug, Default)]
struct OperationWindow {
    tickets: VecDeque<RequestTicket>,
    /// Set by the sweeper when the window is dropped from the table.
    retired: bool,
}

impl OperationWindow {
    /// Index of the earliest ticket still inside the window ending at `now`.
    fn stale_boundary(&self, now: Instant) -> usize {
        self.tickets
            .iter()
            .position(|ticket| now.saturating_duration_since(ticket.admitted_at) <= WINDOW)
            .unwrap_or(self.tickets.len())
    }

    fn trim(&mut self, now: Instant) {
        let boundary = self.stale_boundary(now);
        self.tickets.drain(..boundary);
    }
}

type SharedWindow = Arc<Mutex<OperationWindow>>;

/// Sliding-window rate and bandwidth limiter keyed by client and operation.
///
/// The table is a concurrent map of independently locked windows, so
/// admission checks for different keys never contend with each other.
#[derive(Debug)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    windows: DashMap<ClientOperationKey, SharedWindow>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Number of keys currently holding a window.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Decide whether a request carrying `payload_bytes` may proceed and, if
    /// so, record it.
    pub fn admit(&self, key: ClientOperationKey, payload_bytes: u64) -> Admission {
        self.admit_at(key, payload_bytes, Instant::now())
    }

    fn admit_at(&self, key: ClientOperationKey, payload_bytes: u64, now: Instant) -> Admission {
        if self.limits.is_unlimited() {
            return Admission::Allowed;
        }

        loop {
            let window = self.window_for(key);
            let mut guard = window.lock();
            if guard.retired {
                // The sweeper dropped this window between lookup and lock.
                continue;
            }
            return self.decide(&mut guard, payload_bytes, now);
        }
    }

    fn window_for(&self, key: ClientOperationKey) -> SharedWindow {
        // The map guard must be released before the window lock is taken.
        Arc::clone(self.windows.entry(key).or_default().value())
    }

    fn decide(&self, window: &mut OperationWindow, payload_bytes: u64, now: Instant) -> Admission {
        window.trim(now);

        let count = window.tickets.len() as u64;
        let bytes: u64 = window.tickets.iter().map(|ticket| ticket.bytes).sum();

        if let Some(limit) = self.limits.requests_per_second {
            if count + 1 > limit {
                return Admission::Denied(Denial::RateExceeded);
            }
        }
        if let Some(limit) = self.limits.bytes_per_second {
            if bytes.saturating_add(payload_bytes) > limit {
                return Admission::Denied(Denial::BandwidthExceeded);
            }
        }

        // Keep the sequence chronological even if a caller sampled `now`
        // before a concurrent request got the lock.
        let admitted_at = window
            .tickets
            .back()
            .map_or(now, |last| last.admitted_at.max(now));
        window.tickets.push_back(RequestTicket {
            bytes: payload_bytes,
            admitted_at,
        });
        Admission::Allowed
    }

    /// Trim stale tickets everywhere and drop windows left empty.
    ///
    /// Returns the number of windows removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.windows.retain(|_, window| {
            let mut guard = window.lock();
            guard.trim(now);
            if guard.tickets.is_empty() {
                guard.retired = true;
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Run [`sweep`](Self::sweep) every `period` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("admission sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        debug!(removed, remaining = self.tracked_keys(), "swept admission windows");
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn ticket_count(&self, key: ClientOperationKey) -> usize {
        self.windows
            .get(&key)
            .map(|window| window.lock().tickets.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::operation::OperationKind;
    use std::net::{IpAddr, Ipv4Addr};

    fn key(last_octet: u8, operation: OperationKind) -> ClientOperationKey {
        ClientOperationKey::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), operation)
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn denies_request_over_rate_limit_without_recording_it() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(3, 0));
        let k = key(1, OperationKind::Upload);
        let t0 = Instant::now();

        for i in 0..3 {
            assert_eq!(limiter.admit_at(k, 10, t0 + ms(i * 10)), Admission::Allowed);
        }
        assert_eq!(
            limiter.admit_at(k, 10, t0 + ms(40)),
            Admission::Denied(Denial::RateExceeded)
        );
        assert_eq!(limiter.ticket_count(k), 3);

        assert_eq!(
            limiter.admit_at(k, 10, t0 + ms(50)),
            Admission::Denied(Denial::RateExceeded)
        );
        assert_eq!(limiter.ticket_count(k), 3);
    }

    #[test]
    fn bandwidth_gate_denies_positive_sizes_but_not_empty_requests() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(0, 100));
        let k = key(1, OperationKind::Download);
        let t0 = Instant::now();

        assert!(limiter.admit_at(k, 60, t0).is_allowed());
        assert!(limiter.admit_at(k, 40, t0 + ms(1)).is_allowed());
        assert_eq!(
            limiter.admit_at(k, 1, t0 + ms(2)),
            Admission::Denied(Denial::BandwidthExceeded)
        );
        assert!(limiter.admit_at(k, 0, t0 + ms(3)).is_allowed());
    }

    #[test]
    fn single_payload_larger_than_budget_is_denied() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(0, 100));
        let k = key(1, OperationKind::Upload);

        assert_eq!(
            limiter.admit(k, 101),
            Admission::Denied(Denial::BandwidthExceeded)
        );
        assert_eq!(limiter.ticket_count(k), 0);
    }

    #[test]
    fn rate_is_checked_before_bandwidth() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(1, 10));
        let k = key(1, OperationKind::Upload);
        let t0 = Instant::now();

        assert!(limiter.admit_at(k, 10, t0).is_allowed());
        assert_eq!(
            limiter.admit_at(k, 5, t0 + ms(1)),
            Admission::Denied(Denial::RateExceeded)
        );
    }

    #[test]
    fn tickets_expire_after_the_window() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(1, 0));
        let k = key(1, OperationKind::Info);
        let t0 = Instant::now();

        assert!(limiter.admit_at(k, 0, t0).is_allowed());
        assert!(!limiter.admit_at(k, 0, t0 + ms(500)).is_allowed());
        assert!(!limiter.admit_at(k, 0, t0 + ms(1000)).is_allowed());
        assert!(limiter.admit_at(k, 0, t0 + ms(1001)).is_allowed());
        // The expired ticket was trimmed on the way.
        assert_eq!(limiter.ticket_count(k), 1);
    }

    #[test]
    fn keys_are_throttled_independently() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(1, 0));
        let t0 = Instant::now();

        assert!(limiter.admit_at(key(1, OperationKind::Upload), 1, t0).is_allowed());
        assert!(limiter.admit_at(key(1, OperationKind::Download), 1, t0).is_allowed());
        assert!(limiter.admit_at(key(2, OperationKind::Upload), 1, t0).is_allowed());
        assert!(!limiter.admit_at(key(1, OperationKind::Upload), 1, t0).is_allowed());
    }

    #[test]
    fn unlimited_controller_tracks_nothing() {
        let limiter = AdmissionController::new(AdmissionLimits::UNLIMITED);
        let k = key(1, OperationKind::Upload);

        for _ in 0..1000 {
            assert!(limiter.admit(k, u64::MAX).is_allowed());
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn sweep_drops_only_expired_windows() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(5, 0));
        let idle = key(1, OperationKind::Upload);
        let busy = key(2, OperationKind::Upload);
        let t0 = Instant::now();

        assert!(limiter.admit_at(idle, 0, t0).is_allowed());
        assert!(limiter.admit_at(busy, 0, t0 + ms(1500)).is_allowed());
        assert_eq!(limiter.tracked_keys(), 2);

        assert_eq!(limiter.sweep_at(t0 + ms(2000)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.ticket_count(busy), 1);

        // A swept key starts over with a fresh window.
        assert!(limiter.admit_at(idle, 0, t0 + ms(2100)).is_allowed());
        assert_eq!(limiter.ticket_count(idle), 1);
    }

    #[test]
    fn admit_blocked_on_a_retired_window_moves_to_a_fresh_one() {
        let limiter = AdmissionController::new(AdmissionLimits::from_raw(5, 0));
        let k = key(1, OperationKind::Upload);
        let t0 = Instant::now();

        assert!(limiter.admit_at(k, 0, t0).is_allowed());
        let stale = limiter.window_for(k);

        std::thread::scope(|scope| {
            let mut guard = stale.lock();
            let blocked = scope.spawn(|| limiter.admit_at(k, 7, t0 + ms(10)));

            // Give the admitting thread time to reach the window lock.
            std::thread::sleep(ms(50));
            guard.retired = true;
            limiter.windows.remove(&k);
            drop(guard);

            assert_eq!(blocked.join().unwrap(), Admission::Allowed);
        });

        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.ticket_count(k), 1);
        assert_eq!(stale.lock().tickets.len(), 1);
        assert!(!Arc::ptr_eq(&stale, &limiter.window_for(k)));
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancellation() {
        let limiter = Arc::new(AdmissionController::new(AdmissionLimits::from_raw(1, 0)));
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&limiter).spawn_sweeper(ms(10), shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .expect("sweeper panicked");
    }

    #[test]
    fn from_raw_maps_zero_to_unlimited() {
        assert!(AdmissionLimits::from_raw(0, 0).is_unlimited());
        assert_eq!(
            AdmissionLimits::from_raw(2, 0),
            AdmissionLimits {
                requests_per_second: Some(2),
                bytes_per_second: None,
            }
        );
    }
}
