use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Offset in seconds between the Unix epoch and the NTP epoch.
const NTP_EPOCH_OFFSET: u64 = 0x83AA_7E80;

/// A monotonic instant anchored to the wall clock at construction, so
/// later instants map to NTP timestamps without re-reading the system
/// clock (which could move between samples).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SystemInstant {
    anchor: Instant,
    unix_at_anchor: Duration,
}

impl SystemInstant {
    pub fn now() -> Self {
        Self {
            anchor: Instant::now(),
            unix_at_anchor: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Wall-clock time of `now` as a duration since the Unix epoch.
    pub fn unix(&self, now: Instant) -> Duration {
        self.unix_at_anchor + now.duration_since(self.anchor)
    }

    /// 64-bit NTP timestamp (32.32 fixed point) of `now`.
    pub fn ntp(&self, now: Instant) -> u64 {
        Self::unix2ntp(self.unix(now))
    }

    pub fn unix2ntp(since_unix_epoch: Duration) -> u64 {
        let seconds = (since_unix_epoch.as_secs() + NTP_EPOCH_OFFSET) << 32;
        let fraction = ((since_unix_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
        seconds | fraction
    }

    pub fn ntp2unix(ntp: u64) -> Duration {
        let seconds = (ntp >> 32) - NTP_EPOCH_OFFSET;
        let nanos = ((ntp & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        Duration::new(seconds, nanos as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_round_trip() {
        let unix = Duration::new(1_700_000_000, 123_456_789);
        let ntp = SystemInstant::unix2ntp(unix);
        let back = SystemInstant::ntp2unix(ntp);
        let diff = if back > unix { back - unix } else { unix - back };
        // The 32-bit fraction resolves ~233 ps, nanoseconds survive
        assert!(diff < Duration::from_nanos(2), "diff {diff:?}");
    }

    #[test]
    fn test_ntp_advances_with_instant() {
        let base = SystemInstant::now();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(250);
        assert!(base.ntp(t1) > base.ntp(t0));
    }

    #[test]
    fn test_ntp_epoch_offset() {
        // Unix epoch itself maps to the offset in the seconds field
        let ntp = SystemInstant::unix2ntp(Duration::ZERO);
        assert_eq!(ntp >> 32, NTP_EPOCH_OFFSET);
        assert_eq!(ntp & 0xFFFF_FFFF, 0);
    }
}
