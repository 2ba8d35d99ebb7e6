use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Byte accumulator for one upload with a one-shot completion guard.
///
/// Transport callbacks may arrive on any thread and may over-deliver (chunk
/// re-delivery, retries inside the transport). The accumulator is the only
/// lock the pipeline needs; the `fired` flag makes "disposition runs at most
/// once" independent of how the byte counts add up.
#[derive(Debug)]
pub struct UploadProgress {
    total: u64,
    acked: Mutex<u64>,
    fired: AtomicBool,
}

impl UploadProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            acked: Mutex::new(0),
            fired: AtomicBool::new(false),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn acked(&self) -> u64 {
        self.acked.lock().map(|acked| *acked).unwrap_or_else(|e| *e.into_inner())
    }

    pub fn is_complete(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Add acknowledged bytes. Returns `true` for exactly one caller: the
    /// first whose addition brings the total to at least the file size.
    pub fn record(&self, bytes: u64) -> bool {
        let reached = {
            let mut acked = match self.acked.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *acked = acked.saturating_add(bytes);
            *acked >= self.total
        };
        reached && self.claim()
    }

    /// Transport reported success without the byte count reaching the total.
    /// Same one-shot guard as `record`.
    pub fn complete(&self) -> bool {
        self.claim()
    }

    fn claim(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
