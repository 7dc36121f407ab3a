//! Parameters for the graph mutation and query tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `add_node` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AddNodeParams {
    #[schemars(description = "Node title, must not be blank")]
    pub title: String,

    #[serde(default)]
    #[schemars(description = "Free-form node body")]
    pub content: String,

    /// Hierarchical parent. Must already exist.
    #[schemars(description = "ID of an existing parent node")]
    pub parent_id: Option<String>,
}

/// Parameters for the `update_node` tool. At least one of `title`/`content` is required.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateNodeParams {
    #[schemars(description = "ID of the node to update")]
    pub id: String,

    #[schemars(description = "New title")]
    pub title: Option<String>,

    #[schemars(description = "New content")]
    pub content: Option<String>,
}

/// Parameters for `delete_node`. Incident edges go with it.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteNodeParams {
    #[schemars(description = "ID of the node to delete")]
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AddEdgeParams {
    #[schemars(description = "ID of the source node")]
    pub source: String,

    #[schemars(description = "ID of the target node")]
    pub target: String,

    #[schemars(description = "Optional relationship label (e.g. 'depends_on')")]
    pub label: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteEdgeParams {
    #[schemars(description = "ID of the edge to delete")]
    pub id: String,
}

/// `get_graph` takes no arguments.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetGraphParams {}
