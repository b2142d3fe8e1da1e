//! CashBridge FX
//!
//! Exchange-rate source used to value amounts in USD for routing and to price
//! network fees in the requester's currency.
//!
//! # Features
//!
//! - Multiple rate provider support with median aggregation
//! - Rate caching with configurable TTL
//! - Direct or inverse pair lookup against USD
//!
//! # Example
//!
//! ```rust,ignore
//! use cashbridge_fx::{FxEngine, FxEngineConfig, StaticRateProvider};
//! use cashbridge_common::{Currency, Money};
//!
//! let provider = StaticRateProvider::new("desk").with_usd_rate(Currency::btc(), dec!(60000));
//! let engine = FxEngine::new(Arc::new(provider), FxEngineConfig::default());
//!
//! let usd = engine.usd_value(&Money::new(dec!(0.001), Currency::btc())).await?;
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod provider;

pub use cache::{RateCache, RateCacheConfig};
pub use engine::{FxEngine, FxEngineConfig};
pub use error::{FxError, FxResult};
pub use provider::{AggregatedRateProvider, RateProvider, StaticRateProvider};
