//! Store-wide tunables, assembled with a builder the way the rest of
//! this workspace configures its long-lived services.

use crate::opid::DEFAULT_MAX_SLOTS;
use crate::transaction::Isolation;

/// Configuration for a [`crate::store::TxStore`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreConfig {
    max_slots: u32,
    default_isolation: Isolation,
    default_timeout_millis: i64,
    auto_commit_row_threshold: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_slots: DEFAULT_MAX_SLOTS,
            default_isolation: Isolation::ReadCommitted,
            default_timeout_millis: 10_000,
            auto_commit_row_threshold: 100_000,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    #[must_use]
    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    #[must_use]
    pub fn default_isolation(&self) -> Isolation {
        self.default_isolation
    }

    #[must_use]
    pub fn default_timeout_millis(&self) -> i64 {
        self.default_timeout_millis
    }

    /// Rows written in a single transaction's undo log past which
    /// callers are expected to commit early rather than hold one huge
    /// transaction open; advisory only, `TxStore` never enforces it.
    #[must_use]
    pub fn auto_commit_row_threshold(&self) -> u32 {
        self.auto_commit_row_threshold
    }
}

/// Builder for [`StoreConfig`]. Every setter takes `self` by value so
/// calls chain: `StoreConfig::builder().max_slots(4096).build()`.
#[derive(Debug, Clone, Default)]
pub struct StoreConfigBuilder {
    inner: StoreConfigBuilderInner,
}

#[derive(Debug, Clone)]
struct StoreConfigBuilderInner {
    max_slots: u32,
    default_isolation: Isolation,
    default_timeout_millis: i64,
    auto_commit_row_threshold: u32,
}

impl Default for StoreConfigBuilderInner {
    fn default() -> Self {
        let defaults = StoreConfig::default();
        Self {
            max_slots: defaults.max_slots,
            default_isolation: defaults.default_isolation,
            default_timeout_millis: defaults.default_timeout_millis,
            auto_commit_row_threshold: defaults.auto_commit_row_threshold,
        }
    }
}

impl StoreConfigBuilder {
    #[must_use]
    pub fn max_slots(mut self, max_slots: u32) -> Self {
        self.inner.max_slots = max_slots;
        self
    }

    #[must_use]
    pub fn default_isolation(mut self, isolation: Isolation) -> Self {
        self.inner.default_isolation = isolation;
        self
    }

    #[must_use]
    pub fn default_timeout_millis(mut self, timeout_millis: i64) -> Self {
        self.inner.default_timeout_millis = timeout_millis;
        self
    }

    #[must_use]
    pub fn auto_commit_row_threshold(mut self, threshold: u32) -> Self {
        self.inner.auto_commit_row_threshold = threshold;
        self
    }

    #[must_use]
    pub fn build(self) -> StoreConfig {
        StoreConfig {
            max_slots: self.inner.max_slots,
            default_isolation: self.inner.default_isolation,
            default_timeout_millis: self.inner.default_timeout_millis,
            auto_commit_row_threshold: self.inner.auto_commit_row_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_opid_slot_width() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.max_slots(), DEFAULT_MAX_SLOTS);
        assert_eq!(cfg.default_isolation(), Isolation::ReadCommitted);
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = StoreConfig::builder().max_slots(16).default_timeout_millis(-1).build();
        assert_eq!(cfg.max_slots(), 16);
        assert_eq!(cfg.default_timeout_millis(), -1);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = StoreConfig::builder().max_slots(256).default_isolation(Isolation::Serializable).build();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_slots(), 256);
        assert_eq!(back.default_isolation(), Isolation::Serializable);
    }
}
