use std::collections::{BTreeMap, HashMap};

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::Result;
use crate::labels::normalize;
use crate::models::MappingOverride;

const PAGE_SIZE: i64 = 500;

/// Persisted, dataset-scoped account overrides.
pub trait MappingStore {
    fn query(&self, dataset_id: &str) -> Result<Vec<MappingOverride>>;
    fn upsert(&self, record: &MappingOverride) -> Result<()>;
}

pub struct SqliteMappingStore {
    conn: Connection,
}

impl SqliteMappingStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn count(&self, dataset_id: &str) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT count(*) FROM mapping_overrides WHERE dataset_id = ?1",
            [dataset_id],
            |r| r.get(0),
        )?)
    }

    fn page(&self, dataset_id: &str, offset: i64) -> Result<Vec<MappingOverride>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT dataset_id, source_label, target_header FROM mapping_overrides \
             WHERE dataset_id = ?1 ORDER BY source_key LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![dataset_id, PAGE_SIZE, offset], |row| {
                Ok(MappingOverride {
                    dataset_id: row.get(0)?,
                    source_label: row.get(1)?,
                    target_header: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl MappingStore for SqliteMappingStore {
    fn query(&self, dataset_id: &str) -> Result<Vec<MappingOverride>> {
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.page(dataset_id, offset)?;
            let n = page.len() as i64;
            out.extend(page);
            if n < PAGE_SIZE {
                break;
            }
            offset += n;
        }
        Ok(out)
    }

    fn upsert(&self, record: &MappingOverride) -> Result<()> {
        self.conn.execute(
            "INSERT INTO mapping_overrides (dataset_id, source_key, source_label, target_header) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(dataset_id, source_key) DO UPDATE SET \
             source_label = excluded.source_label, \
             target_header = excluded.target_header, \
             updated_at = datetime('now')",
            rusqlite::params![
                record.dataset_id,
                normalize(&record.source_label),
                record.source_label,
                record.target_header,
            ],
        )?;
        Ok(())
    }
}

/// Merged lookup table for one run: persisted overrides on top of the static
/// fallback map, all keyed by normalized label.
#[derive(Debug, Default, Clone)]
pub struct OverrideResolver {
    table: HashMap<String, String>,
}

impl OverrideResolver {
    /// Rebuilt on every run. A store failure degrades to the fallback map.
    pub fn resolve_overrides(
        dataset_id: &str,
        fallback: &BTreeMap<String, String>,
        store: &dyn MappingStore,
    ) -> Self {
        let persisted = match store.query(dataset_id) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(dataset_id, error = %e, "mapping store query failed, using fallback map only");
                Vec::new()
            }
        };
        let resolver = Self::from_parts(
            fallback.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            persisted
                .iter()
                .map(|o| (o.source_label.as_str(), o.target_header.as_str())),
        );
        debug!(
            dataset_id,
            fallback = fallback.len(),
            persisted = persisted.len(),
            merged = resolver.len(),
            "override table built"
        );
        resolver
    }

    fn from_parts<'a>(
        fallback: impl IntoIterator<Item = (&'a str, &'a str)>,
        persisted: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut table = HashMap::new();
        for (source, target) in fallback.into_iter().chain(persisted) {
            let key = normalize(source);
            let target = target.trim();
            if key.is_empty() || target.is_empty() {
                continue;
            }
            table.insert(key, target.to_string());
        }
        Self { table }
    }

    pub fn lookup(&self, label: &str) -> Option<&str> {
        self.table.get(&normalize(label)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FailingStore, MemoryStore};
    use super::*;
    use crate::db::test_db;

    fn record(dataset: &str, source: &str, target: &str) -> MappingOverride {
        MappingOverride {
            dataset_id: dataset.to_string(),
            source_label: source.to_string(),
            target_header: target.to_string(),
        }
    }

    fn fallback(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sqlite_upsert_replaces_by_normalized_label() {
        let (_dir, conn) = test_db();
        let store = SqliteMappingStore::new(conn);
        store.upsert(&record("default", "Fidelity 401K", "BrokerageLink")).unwrap();
        store.upsert(&record("default", "fidelity  401 k", "BrokerageLink Roth")).unwrap();
        let rows = store.query("default").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_label, "fidelity  401 k");
        assert_eq!(rows[0].target_header, "BrokerageLink Roth");
    }

    #[test]
    fn test_sqlite_query_is_dataset_scoped() {
        let (_dir, conn) = test_db();
        let store = SqliteMappingStore::new(conn);
        store.upsert(&record("a", "Joint", "Joint WROS")).unwrap();
        store.upsert(&record("b", "Joint", "Joint TIC")).unwrap();
        assert_eq!(store.query("a").unwrap()[0].target_header, "Joint WROS");
        assert_eq!(store.query("b").unwrap()[0].target_header, "Joint TIC");
        assert_eq!(store.count("c").unwrap(), 0);
    }

    #[test]
    fn test_sqlite_query_pages_through_everything() {
        let (_dir, conn) = test_db();
        let store = SqliteMappingStore::new(conn);
        for i in 0..(PAGE_SIZE + 7) {
            store
                .upsert(&record("default", &format!("Account {i}"), "Header"))
                .unwrap();
        }
        assert_eq!(store.query("default").unwrap().len() as i64, PAGE_SIZE + 7);
    }

    #[test]
    fn test_persisted_wins_over_fallback() {
        let store = MemoryStore::with(&[("IRA", "Rollover IRA")]);
        let resolver = OverrideResolver::resolve_overrides(
            "default",
            &fallback(&[("ira", "Traditional IRA"), ("HSA", "Health Savings")]),
            &store,
        );
        assert_eq!(resolver.lookup("IRA"), Some("Rollover IRA"));
        assert_eq!(resolver.lookup("hsa"), Some("Health Savings"));
        assert_eq!(resolver.len(), 2);
    }

    #[test]
    fn test_store_failure_degrades_to_fallback() {
        let resolver = OverrideResolver::resolve_overrides(
            "default",
            &fallback(&[("Fidelity 401K", "BrokerageLink")]),
            &FailingStore,
        );
        assert_eq!(resolver.lookup("fidelity 401k"), Some("BrokerageLink"));
    }

    #[test]
    fn test_equal_keys_resolve_equally() {
        let store = MemoryStore::with(&[("Fidelity 401K", "BrokerageLink")]);
        let resolver = OverrideResolver::resolve_overrides("default", &BTreeMap::new(), &store);
        for label in ["Fidelity 401K", "fidelity 401 k", "  FIDELITY   401k "] {
            assert_eq!(resolver.lookup(label), Some("BrokerageLink"), "{label}");
        }
        assert_eq!(resolver.lookup(""), None);
        assert_eq!(resolver.lookup("Fidelity 403b"), None);
    }
}
