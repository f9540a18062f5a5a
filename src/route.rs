use std::fmt;

use serde::Deserialize;

/// Every proxied upstream resource.  Used as the key for retry overrides,
/// cache policies, log records and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Areas,
    AreaDetail,
    Compare,
    Search,
    Simulation,
    WellbeingRanking,
    WeightPresets,
    Congestion,
    LiveCongestion,
}

impl Route {
    #[cfg(test)]
    pub const ALL: [Route; 9] = [
        Route::Areas,
        Route::AreaDetail,
        Route::Compare,
        Route::Search,
        Route::Simulation,
        Route::WellbeingRanking,
        Route::WeightPresets,
        Route::Congestion,
        Route::LiveCongestion,
    ];

    /// Snake-case name, matching the config key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Areas => "areas",
            Self::AreaDetail => "area_detail",
            Self::Compare => "compare",
            Self::Search => "search",
            Self::Simulation => "simulation",
            Self::WellbeingRanking => "wellbeing_ranking",
            Self::WeightPresets => "weight_presets",
            Self::Congestion => "congestion",
            Self::LiveCongestion => "live_congestion",
        }
    }

    /// Local endpoint pattern as exposed by the router.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Areas => "/api/proxy/areas",
            Self::AreaDetail => "/api/proxy/areas/{area_id}",
            Self::Compare => "/api/proxy/areas/compare",
            Self::Search => "/api/proxy/search",
            Self::Simulation => "/api/proxy/simulation/household",
            Self::WellbeingRanking => "/api/proxy/wellbeing/ranking",
            Self::WeightPresets => "/api/proxy/wellbeing/weights/presets",
            Self::Congestion => "/api/proxy/areas/{area_id}/congestion",
            Self::LiveCongestion => "/api/proxy/areas/{area_id}/live-congestion",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
