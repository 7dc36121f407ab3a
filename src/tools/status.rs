//! Parameters for the worker and service lookup tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `worker_status` takes no arguments.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkerStatusParams {}

/// Parameters for the `discover_service` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DiscoverServiceParams {
    #[schemars(description = "Registered service name (e.g. 'control-plane', 'worker')")]
    pub service: String,
}
