//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Asset ID - globally unique identifier for an asset.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Registry-backed**: Every AssetId must exist in the [`crate::symbol_registry::SymbolRegistry`]
pub type AssetId = u32;

/// Symbol (trading pair) ID - globally unique, registry-backed.
pub type SymbolId = u32;

/// User ID - globally unique, immutable after assignment.
pub type UserId = u64;

/// Order ID - unique within the system, assigned by the engine in
/// strictly increasing order. Because assignment is monotone, FIFO
/// order within a price level is also id order.
pub type OrderId = u64;

/// Trade ID - unique within the system
pub type TradeId = u64;

/// Per-symbol acceptance sequence number, used for time priority.
pub type SeqNum = u64;

/// Event subscriber connection identifier
pub type ClientId = u64;
