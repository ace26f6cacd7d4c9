// perps-settlement: execution and settlement core for perpetual futures.
// positions trade against a shared liquidity pool at oracle prices; all
// computation is deterministic with no external I/O.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: Ticker, Usd, SignedUsd, TokenAmount, Price
//   2.x  math.rs: fixed-point helpers: USD conversions, percentages, casts
//   3.x  request.rs: requests, request types, conditionals, settlements
//   4.x  position.rs: position struct, pnl, WAEP, leverage, invariant check
//   5.x  funding.rs: velocity-based funding with interval splitting
//   5.5x borrowing.rs: per-side cumulative borrow fees
//   6.x  price_impact.rs: skew-based execution price adjustment
//   7.x  config.rs: protocol and per-market parameters
//   8.x  engine/: execution pipeline, decrease/liquidation, ADL, dispatch
//   9.x  price_feed.rs: oracle abstraction + signed price set
//   10.x vault.rs: shared pool ledger, market snapshots
//   11.x storage.rs: position/request storage collaborator
//   12.x referral.rs: fee discounts and affiliate rebates
//   13.x events.rs: state transition events for audit

// core settlement modules
pub mod borrowing;
pub mod engine;
pub mod events;
pub mod funding;
pub mod math;
pub mod position;
pub mod price_impact;
pub mod request;
pub mod types;

// collaborator interfaces and in-memory implementations
pub mod config;
pub mod price_feed;
pub mod referral;
pub mod storage;
pub mod vault;

// re exports for convenience
pub use borrowing::*;
pub use engine::*;
pub use events::*;
pub use funding::*;
pub use position::*;
pub use price_impact::*;
pub use request::*;
pub use types::*;
pub use config::{ImpactParams, MarketParams, ProtocolParams};
pub use price_feed::{PriceFeed, PriceFeedError, PriceRequestData, SignedPriceSet};
pub use referral::{FeeDiscount, ReferralBook, ReferralLedger};
pub use storage::{MemoryStore, PositionStore, StorageError};
pub use vault::{MarketSnapshot, PoolVault, TransferRecord, Vault, VaultError};
