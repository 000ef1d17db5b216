use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PosmapError, Result};
use crate::models::CostMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: String,
    pub bucket: String,
    pub source_prefix: String,
    pub output_prefix: String,
    pub default_csv_prefix: String,
    pub template_key: String,
    pub dataset_id: String,
    pub row_qty: u32,
    pub row_cost: u32,
    pub cost_mode: CostMode,
    /// Static fallback mapping, source account label -> template header.
    pub account_name_map: BTreeMap<String, String>,
    pub domain_rules: Vec<DomainRule>,
    pub embedding: RemoteSettings,
    pub adjudicator: RemoteSettings,
}

/// A label that carries every `all_of` token and none of the `none_of` tokens
/// (matched against the normalized label) goes to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRule {
    pub all_of: Vec<String>,
    #[serde(default)]
    pub none_of: Vec<String>,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub base_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub batch_size: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: String::new(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_secs: 30,
            max_retries: 3,
            batch_size: 16,
        }
    }
}

pub fn default_domain_rules() -> Vec<DomainRule> {
    vec![
        DomainRule {
            all_of: vec!["401k".to_string(), "roth".to_string()],
            none_of: vec![],
            target: "BrokerageLink Roth".to_string(),
        },
        DomainRule {
            all_of: vec!["401k".to_string()],
            none_of: vec!["roth".to_string()],
            target: "BrokerageLink".to_string(),
        },
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            bucket: "portfolio".to_string(),
            source_prefix: "source/".to_string(),
            output_prefix: "output/".to_string(),
            default_csv_prefix: "positions-".to_string(),
            template_key: "source/portfolio-template.xlsx".to_string(),
            dataset_id: "default".to_string(),
            row_qty: 24,
            row_cost: 39,
            cost_mode: CostMode::TotalBasis,
            account_name_map: BTreeMap::new(),
            domain_rules: default_domain_rules(),
            embedding: RemoteSettings {
                model: "text-embedding-3-small".to_string(),
                ..RemoteSettings::default()
            },
            adjudicator: RemoteSettings {
                model: "gpt-4o-mini".to_string(),
                ..RemoteSettings::default()
            },
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("posmap.db")
    }

    pub fn bucket_root(&self, bucket: &str) -> PathBuf {
        PathBuf::from(&self.data_dir).join(bucket)
    }

    /// Environment wins over the settings file. Bad values are skipped.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    /// Rows are 1-based; a zero row from the settings file falls back to
    /// the default.
    fn check_rows(&mut self) {
        let defaults = Settings::default();
        if self.row_qty == 0 {
            warn!("row_qty must be at least 1, using {}", defaults.row_qty);
            self.row_qty = defaults.row_qty;
        }
        if self.row_cost == 0 {
            warn!("row_cost must be at least 1, using {}", defaults.row_cost);
            self.row_cost = defaults.row_cost;
        }
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("POSMAP_DATA_DIR") {
            self.data_dir = v;
        }
        if let Some(v) = var("POSMAP_BUCKET") {
            self.bucket = v;
        }
        if let Some(v) = var("POSMAP_DATASET_ID") {
            self.dataset_id = v;
        }
        if let Some(v) = var("POSMAP_TEMPLATE_KEY") {
            self.template_key = v;
        }
        if let Some(v) = var("POSMAP_ROW_QTY") {
            match parse_row(&v) {
                Some(row) => self.row_qty = row,
                None => warn!(value = %v, "ignoring unparseable POSMAP_ROW_QTY"),
            }
        }
        if let Some(v) = var("POSMAP_ROW_COST") {
            match parse_row(&v) {
                Some(row) => self.row_cost = row,
                None => warn!(value = %v, "ignoring unparseable POSMAP_ROW_COST"),
            }
        }
        if let Some(v) = var("POSMAP_COST_MODE") {
            match CostMode::parse(&v) {
                Some(mode) => self.cost_mode = mode,
                None => warn!(value = %v, "ignoring unknown POSMAP_COST_MODE"),
            }
        }
        if let Some(v) = var("ACCOUNT_NAME_MAP_JSON") {
            if !v.trim().is_empty() {
                match serde_json::from_str::<BTreeMap<String, String>>(&v) {
                    Ok(map) => self.account_name_map.extend(map),
                    Err(e) => warn!(error = %e, "ignoring malformed ACCOUNT_NAME_MAP_JSON"),
                }
            }
        }
    }
}

/// Spreadsheet row number, 1 or greater.
fn parse_row(raw: &str) -> Option<u32> {
    raw.trim().parse().ok().filter(|row| *row >= 1)
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("posmap")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("posmap")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
            Settings::default()
        })
    } else {
        Settings::default()
    };
    settings.check_rows();
    settings.apply_env();
    settings
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| PosmapError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.row_qty, 24);
        assert_eq!(s.row_cost, 39);
        assert_eq!(s.cost_mode, CostMode::TotalBasis);
        assert_eq!(s.template_key, "source/portfolio-template.xlsx");
        assert_eq!(s.domain_rules.len(), 2);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/test", "row_qty": 30, "account_name_map": {"IRA": "Trad IRA"}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.data_dir, "/tmp/test");
        assert_eq!(s.row_qty, 30);
        assert_eq!(s.row_cost, 39);
        assert_eq!(s.account_name_map.get("IRA").map(String::as_str), Some("Trad IRA"));
        assert_eq!(s.bucket, "portfolio");
    }

    #[test]
    fn test_env_overrides() {
        let mut s = Settings::default();
        s.apply_vars(vars(&[
            ("POSMAP_ROW_QTY", "10"),
            ("POSMAP_COST_MODE", "avg_per_share"),
            ("POSMAP_BUCKET", "other"),
            ("ACCOUNT_NAME_MAP_JSON", r#"{"Fidelity 401K": "BrokerageLink"}"#),
        ]));
        assert_eq!(s.row_qty, 10);
        assert_eq!(s.cost_mode, CostMode::AvgPerShare);
        assert_eq!(s.bucket, "other");
        assert_eq!(
            s.account_name_map.get("Fidelity 401K").map(String::as_str),
            Some("BrokerageLink")
        );
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut s = Settings::default();
        s.apply_vars(vars(&[
            ("POSMAP_ROW_COST", "forty"),
            ("POSMAP_COST_MODE", "fifo"),
            ("ACCOUNT_NAME_MAP_JSON", "{not json"),
        ]));
        assert_eq!(s.row_cost, 39);
        assert_eq!(s.cost_mode, CostMode::TotalBasis);
        assert!(s.account_name_map.is_empty());
    }

    #[test]
    fn test_zero_rows_are_rejected() {
        let mut s = Settings::default();
        s.apply_vars(vars(&[("POSMAP_ROW_QTY", "0"), ("POSMAP_ROW_COST", " 0 ")]));
        assert_eq!(s.row_qty, 24);
        assert_eq!(s.row_cost, 39);

        let mut s: Settings = serde_json::from_str(r#"{"row_qty": 0, "row_cost": 12}"#).unwrap();
        s.check_rows();
        assert_eq!(s.row_qty, 24);
        assert_eq!(s.row_cost, 12);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            data_dir: "/tmp/posmap".to_string(),
            dataset_id: "household".to_string(),
            ..Settings::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();
        let loaded: Settings =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/posmap");
        assert_eq!(loaded.dataset_id, "household");
        assert_eq!(loaded.embedding.model, "text-embedding-3-small");
    }
}
