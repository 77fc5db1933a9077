//! Column masking.
//!
//! Masking policy lives outside the process in a YAML rules file: per
//! table, the columns allowed through in the clear, the columns whose
//! length should be preserved alongside the hash, and the warehouse sort
//! and distribution keys. Everything else is replaced by a salted
//! SHA-256. The mask schema observed per column rides on the record so
//! the load job can carry it downstream.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use lakesink_core::{CdcRecord, MaskInfo};

use crate::error::{BatcherError, Result};
use crate::transform::{table_name, RecordTransformer, TableSchema};

/// Masking policy for all tables of a sink, keyed by table name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaskRules {
    /// Columns that stay unmasked.
    #[serde(default)]
    pub non_pii_keys: HashMap<String, Vec<String>>,
    /// Columns that get a `{col}_length` companion.
    #[serde(default)]
    pub length_keys: HashMap<String, Vec<String>>,
    /// Warehouse sort-key columns.
    #[serde(default)]
    pub sort_keys: HashMap<String, Vec<String>>,
    /// Warehouse distribution-key columns.
    #[serde(default)]
    pub dist_keys: HashMap<String, Vec<String>>,
}

impl MaskRules {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BatcherError::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| BatcherError::Config(format!("parsing {}: {e}", path.display())))
    }

    fn table_set(map: &HashMap<String, Vec<String>>, table: &str) -> HashSet<String> {
        map.get(table)
            .map(|cols| cols.iter().map(|c| c.to_ascii_lowercase()).collect())
            .unwrap_or_default()
    }
}

/// Per-topic masker. Built once per batch processor, after the rules for
/// the topic's table have been resolved.
pub struct Masker {
    salt: String,
    unmasked: HashSet<String>,
    lengths: HashSet<String>,
    sorts: HashSet<String>,
    dists: HashSet<String>,
}

impl Masker {
    pub fn new(salt: &str, topic: &str, rules: &MaskRules) -> Self {
        let table = table_name(topic);
        Self {
            salt: salt.to_string(),
            unmasked: MaskRules::table_set(&rules.non_pii_keys, &table),
            lengths: MaskRules::table_set(&rules.length_keys, &table),
            sorts: MaskRules::table_set(&rules.sort_keys, &table),
            dists: MaskRules::table_set(&rules.dist_keys, &table),
        }
    }

    fn mask_value(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(value.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl RecordTransformer for Masker {
    fn transform(&self, record: &mut CdcRecord, _table: &TableSchema) -> Result<()> {
        let mut masked_value = HashMap::with_capacity(record.value.len());
        let mut mask_schema = HashMap::with_capacity(record.value.len());

        for (col, val) in record.value.drain() {
            let keep_clear = self.unmasked.contains(&col);
            mask_schema.insert(
                col.clone(),
                MaskInfo {
                    masked: !keep_clear,
                    sort_col: self.sorts.contains(&col),
                    dist_col: self.dists.contains(&col),
                    length_col: self.lengths.contains(&col),
                },
            );

            if self.lengths.contains(&col) {
                let length = val.as_ref().map(|v| v.chars().count().to_string());
                masked_value.insert(format!("{col}_length"), length);
            }

            let out = if keep_clear {
                val
            } else {
                val.map(|v| self.mask_value(&v))
            };
            masked_value.insert(col, out);
        }

        record.value = masked_value;
        record.mask_schema = mask_schema;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakesink_core::Operation;

    fn rules() -> MaskRules {
        let yaml = r#"
non_pii_keys:
  orders: ["id", "status"]
length_keys:
  orders: ["email"]
sort_keys:
  orders: ["created_at"]
dist_keys:
  orders: ["id"]
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn record() -> CdcRecord {
        let mut value = HashMap::new();
        value.insert("id".to_string(), Some("17".to_string()));
        value.insert("email".to_string(), Some("a@b.com".to_string()));
        value.insert("status".to_string(), Some("paid".to_string()));
        CdcRecord {
            topic: "db.inventory.orders".to_string(),
            partition: 0,
            offset: 5,
            schema_id: 7,
            operation: Operation::Create,
            key: HashMap::new(),
            value,
            mask_schema: HashMap::new(),
            extra_mask_schema: HashMap::new(),
            bytes: 64,
        }
    }

    fn table() -> TableSchema {
        TableSchema {
            name: "orders".to_string(),
            columns: Vec::new(),
        }
    }

    #[test]
    fn test_unmasked_columns_pass_through() {
        let masker = Masker::new("salt", "db.inventory.orders", &rules());
        let mut rec = record();
        masker.transform(&mut rec, &table()).unwrap();

        assert_eq!(rec.value["id"].as_deref(), Some("17"));
        assert_eq!(rec.value["status"].as_deref(), Some("paid"));
        assert!(!rec.mask_schema["id"].masked);
        assert!(rec.mask_schema["id"].dist_col);
    }

    #[test]
    fn test_masked_column_is_salted_hash() {
        let masker = Masker::new("salt", "db.inventory.orders", &rules());
        let mut rec = record();
        masker.transform(&mut rec, &table()).unwrap();

        let hashed = rec.value["email"].as_deref().unwrap();
        assert_ne!(hashed, "a@b.com");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hashed, masker.mask_value("a@b.com"));
        assert!(rec.mask_schema["email"].masked);
    }

    #[test]
    fn test_salt_changes_hash() {
        let rules = rules();
        let first = Masker::new("salt-a", "db.inventory.orders", &rules);
        let second = Masker::new("salt-b", "db.inventory.orders", &rules);
        assert_ne!(first.mask_value("a@b.com"), second.mask_value("a@b.com"));
    }

    #[test]
    fn test_length_column_added() {
        let masker = Masker::new("salt", "db.inventory.orders", &rules());
        let mut rec = record();
        masker.transform(&mut rec, &table()).unwrap();

        assert_eq!(rec.value["email_length"].as_deref(), Some("7"));
        assert!(rec.mask_schema["email"].length_col);
    }

    #[test]
    fn test_unknown_table_masks_everything() {
        let masker = Masker::new("salt", "db.other.users", &rules());
        let mut rec = record();
        masker.transform(&mut rec, &table()).unwrap();

        for col in ["id", "email", "status"] {
            assert!(rec.mask_schema[col].masked, "{col} should be masked");
        }
    }
}
