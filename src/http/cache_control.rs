//! Static `Cache-Control` policies per proxied resource.

use crate::route::Route;

/// Shared-cache freshness for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// `s-maxage`, in seconds.
    pub max_age: u32,
    /// `stale-while-revalidate`, in seconds.
    pub stale_while_revalidate: u32,
}

impl CachePolicy {
    pub const fn new(max_age: u32, stale_while_revalidate: u32) -> Self {
        Self {
            max_age,
            stale_while_revalidate,
        }
    }

    /// Policy for successful responses on `route`.  Mutating or
    /// user-specific routes (compare, search, simulation, ranking) are never
    /// cached.
    pub fn for_route(route: Route) -> Option<Self> {
        match route {
            Route::Areas | Route::WeightPresets | Route::Congestion => Some(Self::new(300, 600)),
            Route::AreaDetail | Route::LiveCongestion => Some(Self::new(60, 300)),
            Route::Compare | Route::Search | Route::Simulation | Route::WellbeingRanking => None,
        }
    }

    pub fn header_value(&self) -> String {
        format!(
            "public, s-maxage={}, stale-while-revalidate={}",
            self.max_age, self.stale_while_revalidate
        )
    }
}

/// Used by responses that must never be cached (health probes).
pub const NO_STORE: &str = "no-store";
