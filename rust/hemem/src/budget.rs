use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks the remaining device capacity.
///
/// Device allocations withdraw their size and deallocations deposit it back; the
/// remaining amount never goes negative. An unlimited budget accepts every
/// withdrawal.
pub struct DeviceBudget {
    remaining: AtomicU64,
    limit: Option<u64>,
}

impl DeviceBudget {
    pub fn new(limit: Option<u64>) -> DeviceBudget {
        DeviceBudget {
            remaining: AtomicU64::new(limit.unwrap_or(u64::MAX)),
            limit,
        }
    }

    pub fn unlimited() -> DeviceBudget {
        DeviceBudget::new(None)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Returns the remaining amount.
    ///
    /// **Note**: This method is primarily intended for diagnostic purposes.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    /// Attempts to withdraw `amount` from the budget.
    ///
    /// Returns `true` if the withdrawal was successful. Otherwise the budget is
    /// left unchanged and `false` is returned.
    pub fn withdraw(&self, amount: u64) -> bool {
        if self.limit.is_none() {
            return true;
        }
        let mut current = self.remaining.load(Ordering::Relaxed);
        while current >= amount {
            match self.remaining.compare_exchange_weak(
                current,
                current - amount,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(updated) => current = updated,
            }
        }
        false
    }

    /// Returns `amount` to the budget.
    pub fn deposit(&self, amount: u64) {
        if self.limit.is_some() {
            self.remaining.fetch_add(amount, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for DeviceBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBudget")
            .field("limit", &self.limit)
            .field("remaining", &self.remaining())
            .finish()
    }
}
