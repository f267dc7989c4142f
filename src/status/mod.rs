/// Host resource probes
pub mod sampler;
/// Rolling windows and tiered status views
pub mod status_aggregator;

pub use sampler::{HostInfo, ResourceProbe, ResourceSample, SystemProbe};
pub use status_aggregator::{
    BasicStatus, DetailedStatus, FullStatus, MinuteCounts, OverallStatus, StatusAggregator,
    WindowAverages,
};
