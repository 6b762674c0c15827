pub mod schema;

pub use schema::{
    Config, DispatchConfig, FollowUpWorkerConfig, GatewayConfig, ProviderConfig, ReliabilityConfig,
};
