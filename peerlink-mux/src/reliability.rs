use std::time::Duration;

/// Reliability applied to data on one stream.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReliabilityKind {
    /// Retransmit until acknowledged
    #[default]
    Reliable,
    /// Retransmit at most this many times, then abandon silently
    MaxRetransmits(u16),
    /// Retransmit until this lifetime elapses, then abandon silently
    MaxLifetime(Duration),
}

/// Per-stream ordering and reliability policy.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reliability {
    /// Deliver messages in send order. Unordered streams deliver in
    /// arrival order.
    pub ordered: bool,
    pub kind: ReliabilityKind,
}

impl Reliability {
    pub const fn reliable_ordered() -> Self {
        Self {
            ordered: true,
            kind: ReliabilityKind::Reliable,
        }
    }

    /// True when abandonment is possible for this policy.
    pub fn is_partial(&self) -> bool {
        !matches!(self.kind, ReliabilityKind::Reliable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_detection() {
        assert!(!Reliability::reliable_ordered().is_partial());
        assert!(Reliability {
            ordered: false,
            kind: ReliabilityKind::MaxRetransmits(0),
        }
        .is_partial());
        assert!(Reliability {
            ordered: true,
            kind: ReliabilityKind::MaxLifetime(Duration::from_millis(50)),
        }
        .is_partial());
    }
}
