//! Chart hints and legend enrichment.

use serde::{Deserialize, Serialize};

use crate::db::ColumnInfo;

/// Colors handed out to series in order, wrapping around.
pub const PALETTE: [&str; 10] = [
    "#2563eb", "#16a34a", "#f59e0b", "#dc2626", "#7c3aed", "#0891b2", "#db2777", "#65a30d",
    "#ea580c", "#4b5563",
];

/// Chart hint attached to a query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visualization {
    #[serde(rename = "type", default)]
    pub chart_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis: Option<String>,
    #[serde(default)]
    pub y_axis: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub legend: Vec<LegendEntry>,
}

impl Visualization {
    /// Chart of the given type with no axes.
    pub fn new(chart_type: impl Into<String>) -> Self {
        Self {
            chart_type: chart_type.into(),
            ..Default::default()
        }
    }

    pub fn with_x_axis(mut self, key: impl Into<String>) -> Self {
        self.x_axis = Some(key.into());
        self
    }

    /// Series keys, one line or bar per key.
    pub fn with_y_axis<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.y_axis = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// One series in a chart legend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegendEntry {
    pub key: String,
    pub name: String,
    pub color: String,
    pub description: String,
}

/// Rebuilds the legend from the result columns.
///
/// Always starts from scratch, so enriching twice gives the same output.
/// Leaves the visualization untouched when it has no Y-axis keys.
pub fn enrich_visualization(visualization: &mut Visualization, columns: &[ColumnInfo]) {
    if visualization.y_axis.is_empty() {
        return;
    }

    visualization.legend = visualization
        .y_axis
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let color = PALETTE[i % PALETTE.len()].to_string();
            match columns.iter().find(|c| &c.name == key) {
                Some(column) => {
                    let name = display_name(&column.name);
                    LegendEntry {
                        key: key.clone(),
                        description: format!("{name} ({})", column.data_type),
                        name,
                        color,
                    }
                }
                None => LegendEntry {
                    key: key.clone(),
                    name: key.clone(),
                    color,
                    description: format!("Values for {key}"),
                },
            }
        })
        .collect();
}

/// `total_revenue` -> `Total Revenue`.
fn display_name(key: &str) -> String {
    key.split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
