pub mod client;
pub mod collector;
pub mod config;
pub mod config_validation;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod percentiles;
pub mod ramp_plan;
pub mod report;
pub mod scenario;
pub mod thresholds;
pub mod timeline;
pub mod utils;
pub mod worker_pool;
pub mod yaml_config;
