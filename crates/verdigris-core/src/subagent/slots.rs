//! Slot ledger: in-memory concurrency budgets for subagent runs.
//!
//! Two counters: active children per parent session key, and active runs per
//! model provider. Pure bookkeeping, no I/O inside the lock.

use std::collections::HashMap;
use std::sync::Mutex;

/// Proof of a held provider slot. Release requires the token, so a caller
/// cannot release a slot it never reserved; dropping the token without
/// releasing leaks the slot deliberately (the ledger has no back-channel).
#[derive(Debug)]
pub struct ProviderReservation {
    provider: String,
}

impl ProviderReservation {
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

#[derive(Debug, Default)]
pub struct SlotLedger {
    children: Mutex<HashMap<String, u32>>,
    providers: Mutex<HashMap<String, u32>>,
}

impl SlotLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a child slot for a parent. Returns false at capacity.
    pub fn reserve_child_slot(&self, parent_key: &str, max: u32) -> bool {
        let mut children = self.children.lock().expect("slot ledger poisoned");
        let count = children.entry(parent_key.to_string()).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a child slot. Floored at zero; callers still must pair each
    /// release with exactly one reservation.
    pub fn release_child_slot(&self, parent_key: &str) {
        let mut children = self.children.lock().expect("slot ledger poisoned");
        if let Some(count) = children.get_mut(parent_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                children.remove(parent_key);
            }
        }
    }

    pub fn active_children(&self, parent_key: &str) -> u32 {
        let children = self.children.lock().expect("slot ledger poisoned");
        children.get(parent_key).copied().unwrap_or(0)
    }

    /// Reserve a provider slot. None at capacity.
    pub fn reserve_provider_slot(&self, provider: &str, max: u32) -> Option<ProviderReservation> {
        let mut providers = self.providers.lock().expect("slot ledger poisoned");
        let count = providers.entry(provider.to_string()).or_insert(0);
        if *count >= max {
            return None;
        }
        *count += 1;
        Some(ProviderReservation {
            provider: provider.to_string(),
        })
    }

    /// Release a provider slot, consuming the token.
    pub fn release_provider_slot(&self, reservation: ProviderReservation) {
        let mut providers = self.providers.lock().expect("slot ledger poisoned");
        if let Some(count) = providers.get_mut(&reservation.provider) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                providers.remove(&reservation.provider);
            }
        }
    }

    pub fn active_for_provider(&self, provider: &str) -> u32 {
        let providers = self.providers.lock().expect("slot ledger poisoned");
        providers.get(provider).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn child_slots_respect_max() {
        let ledger = SlotLedger::new();
        assert!(ledger.reserve_child_slot("agent:main:main", 2));
        assert!(ledger.reserve_child_slot("agent:main:main", 2));
        assert!(!ledger.reserve_child_slot("agent:main:main", 2));
        assert_eq!(ledger.active_children("agent:main:main"), 2);

        ledger.release_child_slot("agent:main:main");
        assert!(ledger.reserve_child_slot("agent:main:main", 2));
    }

    #[test]
    fn child_counters_are_per_parent() {
        let ledger = SlotLedger::new();
        assert!(ledger.reserve_child_slot("agent:a:main", 1));
        assert!(ledger.reserve_child_slot("agent:b:main", 1));
        assert!(!ledger.reserve_child_slot("agent:a:main", 1));
    }

    #[test]
    fn release_floors_at_zero() {
        let ledger = SlotLedger::new();
        ledger.release_child_slot("agent:main:main");
        assert_eq!(ledger.active_children("agent:main:main"), 0);
        assert!(ledger.reserve_child_slot("agent:main:main", 1));
    }

    #[test]
    fn provider_slots_saturate() {
        let ledger = SlotLedger::new();
        let first = ledger.reserve_provider_slot("anthropic", 1).unwrap();
        assert!(ledger.reserve_provider_slot("anthropic", 1).is_none());
        assert_eq!(ledger.active_for_provider("anthropic"), 1);

        ledger.release_provider_slot(first);
        assert_eq!(ledger.active_for_provider("anthropic"), 0);
        assert!(ledger.reserve_provider_slot("anthropic", 1).is_some());
    }

    #[test]
    fn provider_buckets_are_independent() {
        let ledger = SlotLedger::new();
        let _a = ledger.reserve_provider_slot("anthropic", 1).unwrap();
        assert!(ledger.reserve_provider_slot("openai", 1).is_some());
    }

    #[test]
    fn concurrent_reservations_never_exceed_max() {
        let ledger = Arc::new(SlotLedger::new());
        let max = 8;
        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                ledger.reserve_child_slot("agent:main:main", max)
            }));
        }
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted as u32, max);
        assert_eq!(ledger.active_children("agent:main:main"), max);
    }
}
