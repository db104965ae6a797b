// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Key layout for the four stag tables.
//
// All keys are ASCII with `:` as the separator:
//
//   graphs:    <graph_id>
//   anchors:   <graph_id>:<anchor_id>
//   versions:  <graph_id>:<anchor_id>:<version_id>
//   stats:     system
//
// Version ids are a fixed-width zero-padded counter so that lexicographic
// key order equals insertion order.

/// Key of the single system-stats record in the `stats` table.
pub const SYSTEM_STATS_KEY: &str = "system";

/// Anchor-table key for `(graph_id, anchor_id)`.
pub fn anchor_key(graph_id: &str, anchor_id: &str) -> String {
    format!("{graph_id}:{anchor_id}")
}

/// Prefix matching every anchor of a graph.
pub fn anchor_prefix(graph_id: &str) -> String {
    format!("{graph_id}:")
}

/// Version-table key for `(graph_id, anchor_id, version_id)`.
pub fn version_key(graph_id: &str, anchor_id: &str, version_id: &str) -> String {
    format!("{graph_id}:{anchor_id}:{version_id}")
}

/// Prefix matching every version of an anchor.
pub fn version_prefix(graph_id: &str, anchor_id: &str) -> String {
    format!("{graph_id}:{anchor_id}:")
}

/// Render the `seq`-th version id of an anchor.
///
/// Ten zero-padded digits keep ids ordered for any realistic chain length.
pub fn version_id(seq: u64) -> String {
    format!("v{seq:010}")
}
