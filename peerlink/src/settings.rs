//! Process-wide settings, read once at connection-creation time.
//!
//! Set these before creating connections; later changes apply only to
//! connections created afterwards.

use std::sync::Mutex;
use std::sync::OnceLock;

use mux::TransportTuning;

struct GlobalSettings {
    thread_pool_size: Mutex<usize>,
    tuning: Mutex<TransportTuning>,
}

fn globals() -> &'static GlobalSettings {
    static GLOBALS: OnceLock<GlobalSettings> = OnceLock::new();
    GLOBALS.get_or_init(|| GlobalSettings {
        thread_pool_size: Mutex::new(0),
        tuning: Mutex::new(TransportTuning::default()),
    })
}

/// Worker count for the shared runtime driving connections; zero means
/// one worker per CPU. Applies to connections created afterwards only.
pub fn set_thread_pool_size(count: usize) {
    *globals().thread_pool_size.lock().unwrap() = count;
}

pub fn thread_pool_size() -> usize {
    *globals().thread_pool_size.lock().unwrap()
}

/// Association-layer tuning applied to subsequently created connections.
pub fn set_association_tuning(tuning: TransportTuning) {
    *globals().tuning.lock().unwrap() = tuning;
}

/// Snapshot of the current tuning, taken at connection creation.
pub fn association_tuning() -> TransportTuning {
    globals().tuning.lock().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_snapshot_is_independent() {
        let before = association_tuning();
        let mut changed = before.clone();
        changed.max_retransmit_attempts = before.max_retransmit_attempts + 1;
        set_association_tuning(changed.clone());
        let after = association_tuning();
        assert_eq!(
            after.max_retransmit_attempts,
            before.max_retransmit_attempts + 1
        );
        // Restore so other tests see defaults
        set_association_tuning(before);
    }
}
