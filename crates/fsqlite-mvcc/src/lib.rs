//! Multi-version concurrency control transaction layer over an
//! ordered-map storage substrate.
//!
//! A [`store::TxStore`] owns one [`substrate::Substrate`] and hands out
//! [`transaction::Transaction`] handles via [`store::TxStore::begin`].
//! Reads and writes against the substrate go through a
//! [`tx_map::TxMap`], which resolves visibility per the active
//! [`transaction::Isolation`] level and drives the
//! compare-and-swap retry loop in [`substrate::Substrate::operate`]
//! using the strategies in [`decision`].
//!
//! Module map:
//! - [`opid`] — 64-bit operation identifier packing (slot id + log id).
//! - [`bitset`] — copy-on-write versioned bit set backing the
//!   committing-transactions bitmap.
//! - [`versioned_value`] — the committed/uncommitted cell encoding.
//! - [`wire`] — on-disk wire encoding for versioned cells.
//! - [`undo`] — per-slot undo log.
//! - [`substrate`] — the CAS-retrying ordered-map storage contract.
//! - [`snapshot`] — coherent `(root, committing)` pair acquisition.
//! - [`decision`] — write-path decision-maker strategies.
//! - [`transaction`] — per-transaction state machine and wait/deadlock protocol.
//! - [`tx_map`] — the per-transaction read/write surface applications call.
//! - [`store`] — slot allocation, commit/rollback, recovery.
//! - [`config`] — store-wide tunables.

pub mod bitset;
pub mod config;
pub mod decision;
pub mod opid;
pub mod snapshot;
pub mod store;
pub mod substrate;
pub mod transaction;
pub mod tx_map;
pub mod undo;
pub mod versioned_value;
pub mod wire;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use decision::AbortReason;
pub use store::{RecoveryReport, TxStore};
pub use substrate::{Decision, DecisionMaker, Substrate};
pub use transaction::{Isolation, Transaction, TransactionStatus};
pub use tx_map::TxMap;
pub use versioned_value::VersionedCell;

pub use fsqlite_error::{FrankenError, Result};
