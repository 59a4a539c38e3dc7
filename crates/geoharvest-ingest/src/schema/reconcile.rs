//! Canonical column set and per-source projection plans

use crate::schema::{SchemaRules, SourceDataset};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Where a canonical column's values come from in one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnSource {
    Column(String),
    Null,
}

/// How one source is projected onto the canonical schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionPlan {
    pub source_id: String,
    pub layer: String,
    pub canonical_columns: Vec<String>,
    /// One entry per canonical column, in canonical order
    pub column_mapping: Vec<(String, ColumnSource)>,
    /// `(real geometry column, canonical geometry column)`
    pub geometry_mapping: (String, String),
    /// Constant-valued output columns, always including provenance
    pub literal_columns: BTreeMap<String, String>,
}

impl ProjectionPlan {
    pub fn source_for(&self, canonical: &str) -> Option<&ColumnSource> {
        self.column_mapping
            .iter()
            .find(|(name, _)| name == canonical)
            .map(|(_, source)| source)
    }

    /// Render the plan as a SQLite-dialect query over the source layer
    pub fn to_sql(&self) -> String {
        let mut select: Vec<String> = Vec::with_capacity(self.column_mapping.len() + 2);

        for (canonical, source) in &self.column_mapping {
            let expr = match source {
                ColumnSource::Column(real) => quote_ident(real),
                ColumnSource::Null => "NULL".to_string(),
            };
            select.push(format!("{} AS {}", expr, quote_ident(canonical)));
        }
        for (name, value) in &self.literal_columns {
            select.push(format!("{} AS {}", quote_literal(value), quote_ident(name)));
        }
        let (real, canonical) = &self.geometry_mapping;
        select.push(format!("{} AS {}", quote_ident(real), quote_ident(canonical)));

        format!("SELECT {} FROM {}", select.join(", "), quote_ident(&self.layer))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The canonical schema of one merge group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledSchema {
    pub canonical_columns: Vec<String>,
    pub canonical_geometry: String,
    pub provenance_column: String,
    /// One plan per input dataset, in input order
    pub plans: Vec<ProjectionPlan>,
}

impl ReconciledSchema {
    pub fn plan(&self, source_id: &str) -> Option<&ProjectionPlan> {
        self.plans.iter().find(|p| p.source_id == source_id)
    }
}

/// Builds a [`ReconciledSchema`] from introspected sources
///
/// Output depends only on the input datasets and their order.
#[derive(Debug, Clone, Default)]
pub struct SchemaReconciler {
    rules: SchemaRules,
}

impl SchemaReconciler {
    pub fn new(rules: SchemaRules) -> Self {
        Self { rules }
    }

    pub fn reconcile(&self, datasets: &[SourceDataset]) -> ReconciledSchema {
        let canonical_geometry = self.canonical_geometry(datasets);
        let provenance = &self.rules.provenance_column;

        let mut seen: HashSet<&str> = HashSet::new();
        let mut canonical_columns: Vec<String> = Vec::new();
        for ds in datasets {
            for column in &ds.columns {
                let name = column.sanitized.as_str();
                if self.rules.denylist.is_denied(name) {
                    continue;
                }
                if name == provenance || name == canonical_geometry {
                    warn!(
                        source = %ds.source_id,
                        column = %column.real,
                        reserved = name,
                        "Dropping attribute column that shadows a reserved output column"
                    );
                    continue;
                }
                if seen.insert(name) {
                    canonical_columns.push(name.to_string());
                }
            }
        }

        let plans = datasets
            .iter()
            .map(|ds| {
                let column_mapping = canonical_columns
                    .iter()
                    .map(|name| {
                        let source = match ds.column(name) {
                            Some(col) => ColumnSource::Column(col.real.clone()),
                            None => ColumnSource::Null,
                        };
                        (name.clone(), source)
                    })
                    .collect();

                let mut literal_columns = BTreeMap::new();
                literal_columns.insert(provenance.clone(), ds.source_id.clone());

                ProjectionPlan {
                    source_id: ds.source_id.clone(),
                    layer: ds.layer.clone(),
                    canonical_columns: canonical_columns.clone(),
                    column_mapping,
                    geometry_mapping: (ds.geometry_column.clone(), canonical_geometry.clone()),
                    literal_columns,
                }
            })
            .collect();

        ReconciledSchema {
            canonical_columns,
            canonical_geometry,
            provenance_column: provenance.clone(),
            plans,
        }
    }

    /// Most frequent sanitized geometry name, ties to the first seen
    fn canonical_geometry(&self, datasets: &[SourceDataset]) -> String {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for ds in datasets {
            let name = ds.sanitized_geometry();
            let count = counts.entry(name.clone()).or_insert(0);
            if *count == 0 {
                order.push(name);
            }
            *count += 1;
        }

        let mut best: Option<(&String, usize)> = None;
        for name in &order {
            let count = counts.get(name).copied().unwrap_or(0);
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((name, count));
            }
        }

        best.map(|(name, _)| name.clone())
            .unwrap_or_else(|| self.rules.default_geometry.clone())
    }
}
