//! Arbitrage opportunity detection.

pub mod detector;

pub use detector::{
    MarketplaceProvider, Opportunity, OpportunityDetector, OpportunityFilters, StaticMarketplaces,
};
