//! Key usage analysis over stored ciphertext

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::encryption::{sort_versions, stored_version_tag, EncryptedColumnCodec};
use crate::storage::{EncryptedColumnSource, StorageError};

/// Default rows per analysis batch
pub const DEFAULT_ANALYSIS_BATCH_SIZE: usize = 500;

/// Per-version record counts for one column
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub counts: BTreeMap<String, u64>,
    pub records_scanned: u64,
    pub null_values: u64,
    /// Rows whose version could not be determined
    pub undetected: u64,
}

impl UsageReport {
    pub fn used_versions(&self) -> BTreeSet<String> {
        self.counts.keys().cloned().collect()
    }

    /// Usage line per known version, oldest first
    pub fn stats(&self, all_versions: &[String], active_version: &str) -> Vec<KeyUsageStats> {
        let encrypted: u64 = self.counts.values().sum();
        let mut versions: Vec<String> = all_versions.to_vec();
        for version in self.counts.keys() {
            if !versions.contains(version) {
                versions.push(version.clone());
            }
        }
        sort_versions(&mut versions);

        versions
            .into_iter()
            .map(|version| {
                let record_count = self.counts.get(&version).copied().unwrap_or(0);
                KeyUsageStats {
                    is_active: version == active_version,
                    in_use: record_count > 0,
                    percentage: if encrypted == 0 {
                        0.0
                    } else {
                        record_count as f64 / encrypted as f64 * 100.0
                    },
                    record_count,
                    version,
                }
            })
            .collect()
    }
}

/// Usage of one key version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyUsageStats {
    pub version: String,
    pub record_count: u64,
    pub percentage: f64,
    pub is_active: bool,
    pub in_use: bool,
}

/// Version of a stored value: its prefix tag, else whichever key opens it
pub fn detect_version(codec: &EncryptedColumnCodec, stored: &str) -> Option<String> {
    stored_version_tag(stored).or_else(|| {
        codec
            .decode_with_version(stored)
            .ok()
            .map(|(version, _)| version)
    })
}

/// Scan the column in primary-key order and count rows per key version.
///
/// Rows whose version cannot be determined are logged and skipped.
pub fn analyze_key_usage(
    source: &dyn EncryptedColumnSource,
    codec: &EncryptedColumnCodec,
    batch_size: usize,
) -> Result<UsageReport, StorageError> {
    let mut report = UsageReport::default();
    let mut cursor = None;

    info!(column = %source.describe(), "Analyzing key usage");
    loop {
        let rows = source.iterate_ordered_by_pk(cursor.as_ref(), batch_size.max(1))?;
        let Some(last) = rows.last().map(|r| r.pk.clone()) else {
            break;
        };

        for record in &rows {
            report.records_scanned += 1;
            let stored = match record.value.as_deref().map(str::trim) {
                Some(stored) if !stored.is_empty() => stored,
                _ => {
                    report.null_values += 1;
                    continue;
                }
            };

            match detect_version(codec, stored) {
                Some(version) => *report.counts.entry(version).or_insert(0) += 1,
                None => {
                    report.undetected += 1;
                    warn!(column = %source.describe(), pk = %record.pk, "Could not determine key version of stored value");
                }
            }
        }

        debug!(scanned = report.records_scanned, last_pk = %last, "Analysis batch complete");
        cursor = Some(last);
    }

    info!(
        column = %source.describe(),
        scanned = report.records_scanned,
        versions = ?report.counts,
        undetected = report.undetected,
        "Key usage analysis complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{KeyEntry, KeyStore, MapEnv, SecretsManager, SecretsManagerConfig};
    use crate::storage::SqliteColumnSource;
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine as _;
    use rusqlite::{params, Connection};
    use std::sync::Arc;

    fn codec() -> EncryptedColumnCodec {
        let mut store = KeyStore::new();
        for version in ["v1", "v2", "v3"] {
            store.insert(version, KeyEntry::new(format!("k-{}", version), format!("s-{}", version)));
        }
        store.set_active_version("v3");
        let config = SecretsManagerConfig {
            kdf_iterations: 1_000,
            ..Default::default()
        };
        EncryptedColumnCodec::new(Arc::new(SecretsManager::install(config, store, Arc::new(MapEnv::new()))))
    }

    #[test]
    fn test_counts_prefixed_legacy_and_broken_values() {
        let codec = codec();
        let manager = codec.manager();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE people (id INTEGER PRIMARY KEY, email TEXT)").unwrap();

        let v1 = format!("v1:{}", URL_SAFE.encode(manager.encrypt_with("v1", b"a").unwrap()));
        let legacy_v1 = URL_SAFE.encode(manager.encrypt_with("v1", b"b").unwrap());
        let v3 = codec.encode("c").unwrap();
        let values = [Some(v1), Some(legacy_v1), Some(v3), None, Some("garbage".to_string())];
        for (id, value) in values.iter().enumerate() {
            conn.execute("INSERT INTO people VALUES (?1, ?2)", params![id as i64 + 1, value]).unwrap();
        }

        let source = SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap();
        let report = analyze_key_usage(&source, &codec, 2).unwrap();

        assert_eq!(report.records_scanned, 5);
        assert_eq!(report.null_values, 1);
        assert_eq!(report.undetected, 1);
        assert_eq!(report.counts.get("v1"), Some(&2));
        assert_eq!(report.counts.get("v3"), Some(&1));
        assert_eq!(report.used_versions().into_iter().collect::<Vec<_>>(), vec!["v1", "v3"]);

        let all = vec!["v1".to_string(), "v2".to_string(), "v3".to_string()];
        let stats = report.stats(&all, "v3");
        assert_eq!(stats.len(), 3);
        assert!(!stats[1].in_use);
        assert!(stats[2].is_active);
        assert!((stats[0].percentage - 66.666).abs() < 0.01);
    }
}
