//! Column name sanitization and the measure-column denylist

use crate::config::SchemaConfig;

/// Lower-case and replace every character outside `[a-z0-9_]` with `_`
///
/// `"Product ID#"` becomes `"product_id_"`. Non-ASCII characters are replaced
/// one-for-one, so names never collapse to fewer characters.
pub fn sanitize_column_name(name: &str) -> String {
    name.chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Columns that carry measures recomputed by GIS software (area, perimeter length)
///
/// Matching is a substring test on the sanitized name, so `SHAPE_Area`,
/// `Shape_Leng` and `CALC_AREA` are all caught by the default terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureDenylist {
    terms: Vec<String>,
}

impl MeasureDenylist {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(|t| sanitize_column_name(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_denied(&self, sanitized: &str) -> bool {
        self.terms.iter().any(|term| sanitized.contains(term.as_str()))
    }
}

/// Naming rules shared by the catalog and the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRules {
    pub provenance_column: String,
    pub default_geometry: String,
    pub denylist: MeasureDenylist,
}

impl SchemaRules {
    pub fn from_config(config: &SchemaConfig) -> Self {
        Self {
            provenance_column: sanitize_column_name(&config.provenance_column),
            default_geometry: sanitize_column_name(&config.default_geometry),
            denylist: MeasureDenylist::new(&config.measure_denylist),
        }
    }
}

impl Default for SchemaRules {
    fn default() -> Self {
        Self::from_config(&SchemaConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_column_name("Product ID#"), "product_id_");
        assert_eq!(sanitize_column_name("DFIRM_ID"), "dfirm_id");
        assert_eq!(sanitize_column_name("zone-2"), "zone_2");
        assert_eq!(sanitize_column_name("Größe"), "gr__e");
    }

    #[test]
    fn test_default_denylist() {
        let rules = SchemaRules::default();
        assert!(rules.denylist.is_denied(&sanitize_column_name("SHAPE_Area")));
        assert!(rules.denylist.is_denied(&sanitize_column_name("Shape_Leng")));
        assert!(rules.denylist.is_denied("shape_len"));
        assert!(rules.denylist.is_denied("calc_area"));
        assert!(!rules.denylist.is_denied("fld_zone"));
    }

    #[test]
    fn test_custom_denylist_is_sanitized() {
        let denylist = MeasureDenylist::new(["PERIMETER", ""]);
        assert!(denylist.is_denied("perimeter_m"));
        assert!(!denylist.is_denied("area"));
    }
}
