//! Chemical records and the local chemical directory
//!
//! The directory is the single source of truth for substance physical data
//! during task building. Station-side ids are back-filled by the
//! coordinator's alignment pass and are the only field mutated after load.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{StationError, StationResult};

/// Physical state of a substance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalState {
    Solid,
    Liquid,
    Gas,
    #[default]
    Unknown,
}

impl PhysicalState {
    /// Lenient text decode; station exports sometimes carry qualifiers
    /// like "liquid (viscous)".
    pub fn from_text(text: &str) -> Self {
        let lower = text.trim().to_ascii_lowercase();
        if lower.contains("liquid") {
            Self::Liquid
        } else if lower.contains("solid") {
            Self::Solid
        } else if lower.contains("gas") {
            Self::Gas
        } else {
            Self::Unknown
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Solid => "solid",
            Self::Liquid => "liquid",
            Self::Gas => "gas",
            Self::Unknown => "unknown",
        }
    }
}

/// Physical form, governing which amount conversion applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalForm {
    /// Pure substance; conversions use molecular weight (and density for liquids)
    Neat,
    /// Dissolved; `active_content` is mmol of active substance per mL
    Solution,
    /// Supported on resin; `active_content` is wt% of active substance
    Beads,
    #[default]
    Unknown,
}

impl PhysicalForm {
    pub fn from_text(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "neat" => Self::Neat,
            "solution" => Self::Solution,
            "beads" => Self::Beads,
            _ => Self::Unknown,
        }
    }
}

/// One substance record, unique by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chemical {
    pub name: String,
    #[serde(default)]
    pub cas: Option<String>,
    /// g/mol
    #[serde(default)]
    pub molecular_weight: Option<f64>,
    /// g/mL
    #[serde(default)]
    pub density: Option<f64>,
    #[serde(default)]
    pub state: PhysicalState,
    #[serde(default)]
    pub form: PhysicalForm,
    /// mmol/mL for solutions, wt% for beads
    #[serde(default)]
    pub active_content: Option<f64>,
    /// Opaque id assigned by the station registry after alignment
    #[serde(default)]
    pub station_id: Option<i64>,
}

impl Chemical {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cas: None,
            molecular_weight: None,
            density: None,
            state: PhysicalState::Unknown,
            form: PhysicalForm::Unknown,
            active_content: None,
            station_id: None,
        }
    }

    pub fn density_or_zero(&self) -> f64 {
        self.density.unwrap_or(0.0)
    }
}

/// Name-keyed chemical directory with load-time validation
#[derive(Debug, Clone, Default)]
pub struct ChemicalDirectory {
    by_name: HashMap<String, Chemical>,
    order: Vec<String>,
}

impl ChemicalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the directory, validating every record.
    ///
    /// All violations are reported in one error so an operator can fix the
    /// source sheet in a single round.
    pub fn from_chemicals(items: Vec<Chemical>) -> StationResult<Self> {
        let mut dir = Self::new();
        let mut problems: Vec<String> = Vec::new();

        for chem in items {
            let name = chem.name.trim().to_string();
            if name.is_empty() {
                problems.push("record with empty substance name".to_string());
                continue;
            }
            if dir.by_name.contains_key(&name) {
                problems.push(format!("duplicate substance '{}'", name));
                continue;
            }
            if chem.state == PhysicalState::Unknown {
                problems.push(format!(
                    "'{}': physical_state must be solid, liquid or gas",
                    name
                ));
            }
            if chem.form == PhysicalForm::Unknown {
                problems.push(format!("'{}': physical_form must be set", name));
            }
            match chem.form {
                PhysicalForm::Neat => {
                    if chem.molecular_weight.unwrap_or(0.0) <= 0.0 {
                        problems.push(format!("'{}': neat form requires molecular_weight", name));
                    }
                    if chem.state == PhysicalState::Liquid
                        && chem.density.unwrap_or(0.0) <= 0.0
                    {
                        problems.push(format!("'{}': neat liquid requires density", name));
                    }
                }
                PhysicalForm::Solution => {
                    if chem.active_content.unwrap_or(0.0) <= 0.0 {
                        problems.push(format!(
                            "'{}': solution form requires active_content (mmol/mL)",
                            name
                        ));
                    }
                }
                PhysicalForm::Beads => {
                    if chem.molecular_weight.unwrap_or(0.0) <= 0.0 {
                        problems.push(format!("'{}': beads form requires molecular_weight", name));
                    }
                    if chem.active_content.unwrap_or(0.0) <= 0.0 {
                        problems.push(format!(
                            "'{}': beads form requires active_content (wt%)",
                            name
                        ));
                    }
                }
                PhysicalForm::Unknown => {}
            }

            let mut chem = chem;
            chem.name = name.clone();
            dir.order.push(name.clone());
            dir.by_name.insert(name, chem);
        }

        if problems.is_empty() {
            Ok(dir)
        } else {
            Err(StationError::Validation(format!(
                "chemical directory rejected: {}",
                problems.join("; ")
            )))
        }
    }

    pub fn get(&self, name: &str) -> Option<&Chemical> {
        self.by_name.get(name.trim())
    }

    /// Exact-match lookup; a miss is a validation fault.
    pub fn require(&self, name: &str) -> StationResult<&Chemical> {
        self.get(name)
            .ok_or_else(|| StationError::Validation(format!("unknown chemical '{}'", name.trim())))
    }

    /// Record the station-side id assigned during alignment.
    pub fn set_station_id(&mut self, name: &str, id: i64) {
        if let Some(chem) = self.by_name.get_mut(name.trim()) {
            chem.station_id = Some(id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chemical> {
        self.order.iter().filter_map(|n| self.by_name.get(n))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Controls which repeated fields are concatenated during deduplication
#[derive(Debug, Clone)]
pub struct DedupOptions {
    /// Fields joined with ';' when a substance appears on multiple rows
    pub concat_fields: Vec<String>,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            concat_fields: vec![
                "brand".to_string(),
                "package_size".to_string(),
                "storage_location".to_string(),
            ],
        }
    }
}

/// Merge raw library rows by substance name.
///
/// Concat fields are joined with `;`; other repeated values are wrapped as
/// `(a;b;c)`; single values pass through unchanged. Rows without a
/// substance name are appended after the merged rows in input order.
pub fn deduplicate_library_rows(
    rows: &[BTreeMap<String, String>],
    headers: &[String],
    opts: &DedupOptions,
) -> Vec<BTreeMap<String, String>> {
    const KEY_FIELD: &str = "substance";

    if headers.is_empty() || !headers.iter().any(|h| h.trim().eq_ignore_ascii_case(KEY_FIELD)) {
        tracing::warn!("library headers lack a '{}' column, skipping dedup", KEY_FIELD);
        return rows.to_vec();
    }

    let concat: Vec<String> = opts
        .concat_fields
        .iter()
        .map(|f| f.to_ascii_lowercase())
        .collect();

    type Store = BTreeMap<String, Vec<String>>;
    let mut merged: Vec<(String, Store)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut nameless: Vec<Store> = Vec::new();

    let merge_into = |store: &mut Store, row: &BTreeMap<String, String>| {
        for header in headers {
            let value = row.get(header).map(|v| v.trim()).unwrap_or("");
            if value.is_empty() {
                continue;
            }
            let bucket = store.entry(header.clone()).or_default();
            if !bucket.iter().any(|v| v == value) {
                bucket.push(value.to_string());
            }
        }
    };

    for row in rows {
        let key = row.get(KEY_FIELD).map(|v| v.trim()).unwrap_or("").to_string();
        if key.is_empty() {
            let mut store = Store::new();
            merge_into(&mut store, row);
            nameless.push(store);
        } else if let Some(&pos) = index.get(&key) {
            merge_into(&mut merged[pos].1, row);
        } else {
            let mut store = Store::new();
            merge_into(&mut store, row);
            index.insert(key.clone(), merged.len());
            merged.push((key, store));
        }
    }

    let build = |store: &Store| -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for header in headers {
            let values = store.get(header).cloned().unwrap_or_default();
            let rendered = if concat.contains(&header.to_ascii_lowercase()) {
                values.join(";")
            } else {
                match values.len() {
                    0 => String::new(),
                    1 => values[0].clone(),
                    _ => format!("({})", values.join(";")),
                }
            };
            out.insert(header.clone(), rendered);
        }
        out
    };

    let mut result: Vec<BTreeMap<String, String>> =
        merged.iter().map(|(_, store)| build(store)).collect();
    result.extend(nameless.iter().map(build));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(name: &str, mw: f64) -> Chemical {
        Chemical {
            molecular_weight: Some(mw),
            state: PhysicalState::Solid,
            form: PhysicalForm::Neat,
            ..Chemical::new(name)
        }
    }

    #[test]
    fn directory_accepts_valid_records() {
        let dir = ChemicalDirectory::from_chemicals(vec![solid("A", 100.0)]).unwrap();
        assert_eq!(dir.len(), 1);
        assert!(dir.require("A").is_ok());
        assert!(dir.require("missing").is_err());
    }

    #[test]
    fn directory_collects_all_violations() {
        let neat_without_mw = Chemical {
            state: PhysicalState::Solid,
            form: PhysicalForm::Neat,
            ..Chemical::new("X")
        };
        let solution_without_content = Chemical {
            state: PhysicalState::Liquid,
            form: PhysicalForm::Solution,
            ..Chemical::new("Y")
        };
        let err = ChemicalDirectory::from_chemicals(vec![neat_without_mw, solution_without_content])
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("'X'"));
        assert!(text.contains("'Y'"));
    }

    #[test]
    fn neat_liquid_requires_density() {
        let chem = Chemical {
            molecular_weight: Some(78.0),
            state: PhysicalState::Liquid,
            form: PhysicalForm::Neat,
            ..Chemical::new("benzene")
        };
        assert!(ChemicalDirectory::from_chemicals(vec![chem]).is_err());
    }

    #[test]
    fn dedup_merges_brand_fields() {
        let headers: Vec<String> = ["substance", "brand", "molecular_weight"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut row1 = BTreeMap::new();
        row1.insert("substance".to_string(), "A".to_string());
        row1.insert("brand".to_string(), "acme".to_string());
        row1.insert("molecular_weight".to_string(), "100".to_string());
        let mut row2 = BTreeMap::new();
        row2.insert("substance".to_string(), "A".to_string());
        row2.insert("brand".to_string(), "sigma".to_string());
        row2.insert("molecular_weight".to_string(), "100".to_string());

        let out = deduplicate_library_rows(&[row1, row2], &headers, &DedupOptions::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["brand"], "acme;sigma");
        // Repeated identical values collapse rather than wrap.
        assert_eq!(out[0]["molecular_weight"], "100");
    }

    #[test]
    fn dedup_wraps_conflicting_values() {
        let headers: Vec<String> = ["substance", "molecular_weight"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut row1 = BTreeMap::new();
        row1.insert("substance".to_string(), "A".to_string());
        row1.insert("molecular_weight".to_string(), "100".to_string());
        let mut row2 = BTreeMap::new();
        row2.insert("substance".to_string(), "A".to_string());
        row2.insert("molecular_weight".to_string(), "101".to_string());

        let out = deduplicate_library_rows(&[row1, row2], &headers, &DedupOptions::default());
        assert_eq!(out[0]["molecular_weight"], "(100;101)");
    }
}
