//! Parameters for the view-mode tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::layout::{LayoutSnapshot, ViewMode};

/// Parameters for the `layout_mode` tool.
///
/// Without `mode` this only reports the current mode. Leaving the default view
/// with `positions` saves them; returning to it hands back the saved positions
/// of nodes that still exist.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LayoutModeParams {
    #[schemars(description = "Mode to switch to: default, clustered or radial")]
    pub mode: Option<ViewMode>,

    #[schemars(description = "Current node positions, saved when leaving the default view")]
    pub positions: Option<LayoutSnapshot>,
}

/// Parameters for the `cycle_layout` tool.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CycleLayoutParams {
    #[schemars(description = "Current node positions, saved when leaving the default view")]
    pub positions: Option<LayoutSnapshot>,
}
