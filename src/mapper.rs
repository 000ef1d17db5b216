//! Mapping discovery: rank every distinct account label in a positions export
//! against the template's headers, adjudicate, and persist the matches as
//! overrides for later processing runs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::adjudicator::{Adjudicator, Decision};
use crate::error::{PosmapError, Result};
use crate::importer::read_distinct_accounts;
use crate::models::MappingOverride;
use crate::overrides::OverrideResolver;
use crate::pipeline::RunContext;
use crate::ranker::{RankedCandidate, SimilarityRanker};
use crate::remote::chat::ChatModel;
use crate::remote::embeddings::Embedder;
use crate::workbook::{Sheet, Workbook};

const HEADER_COLS: std::ops::RangeInclusive<u16> = 2..=59;
const FALLBACK_SHEET: &str = "consolidate";
const MAX_DECISIONS: usize = 20;
const CANDIDATES_SHOWN: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub csv_key: String,
    pub template_key: String,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub only_unmapped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub source: String,
    pub choice: String,
    pub candidates: Vec<RankedCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    pub ok: bool,
    pub dataset_id: String,
    pub created_mappings: usize,
    pub excel_headers_considered: Vec<String>,
    pub accounts_seen: usize,
    pub skipped_already_mapped: usize,
    pub failed: usize,
    pub decisions: Vec<DecisionRecord>,
}

/// Remote services the discovery pass talks to.
pub struct Services<'a> {
    pub embedder: &'a dyn Embedder,
    pub model: &'a dyn ChatModel,
    pub batch_size: usize,
}

fn row1_headers(sheet: &Sheet) -> BTreeSet<String> {
    HEADER_COLS
        .filter_map(|col| sheet.get(1, col))
        .filter_map(|v| v.as_text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Candidate headers: row 1 text of the first sheet that has any, or of the
/// `consolidate` sheet. Sorted and distinct.
pub fn template_headers(workbook: &Workbook) -> Vec<String> {
    let found = workbook
        .sheets()
        .iter()
        .map(row1_headers)
        .find(|h| !h.is_empty())
        .or_else(|| workbook.sheet(FALLBACK_SHEET).map(row1_headers))
        .unwrap_or_default();
    found.into_iter().collect()
}

pub fn run_discovery(ctx: &RunContext<'_>, services: &Services<'_>, req: &DiscoveryRequest) -> Result<DiscoveryOutcome> {
    if req.csv_key.trim().is_empty() || req.template_key.trim().is_empty() {
        return Err(PosmapError::NoInput("csv_key and template_key are required".to_string()));
    }
    let dataset_id = req
        .dataset_id
        .clone()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| ctx.settings.dataset_id.clone());
    let span = info_span!("discover", bucket = %ctx.bucket, dataset_id = %dataset_id);
    let _guard = span.enter();

    let accounts = read_distinct_accounts(&ctx.store.get(&req.csv_key)?)?;
    let workbook = Workbook::from_xlsx_bytes(&ctx.store.get(&req.template_key)?)?;
    let headers = template_headers(&workbook);
    if headers.is_empty() {
        return Err(PosmapError::NoHeaders(format!(
            "no account headers in row 1 (B..) of {}",
            req.template_key
        )));
    }
    info!(accounts = accounts.len(), headers = headers.len(), "discovery inputs loaded");

    let known = req.only_unmapped.then(|| {
        OverrideResolver::resolve_overrides(&dataset_id, &ctx.settings.account_name_map, ctx.mappings)
    });

    let mut ranker = SimilarityRanker::new(services.embedder, services.batch_size);
    let adjudicator = Adjudicator::new(services.model, &ctx.settings.domain_rules);
    let mut outcome = DiscoveryOutcome {
        ok: true,
        dataset_id: dataset_id.clone(),
        created_mappings: 0,
        excel_headers_considered: headers.clone(),
        accounts_seen: accounts.len(),
        skipped_already_mapped: 0,
        failed: 0,
        decisions: Vec::new(),
    };

    for account in &accounts {
        if known.as_ref().is_some_and(|r| r.lookup(account).is_some()) {
            outcome.skipped_already_mapped += 1;
            continue;
        }

        let mut record = DecisionRecord {
            source: account.clone(),
            choice: Decision::Unmatched.label().to_string(),
            candidates: Vec::new(),
            error: None,
        };
        let decided = ranker.rank(account, &headers).and_then(|ranked| {
            record.candidates = ranked.iter().take(CANDIDATES_SHOWN).cloned().collect();
            adjudicator.decide(account, &ranked)
        });

        match decided {
            Ok(decision) => {
                record.choice = decision.label().to_string();
                if let Some(header) = decision.header() {
                    let saved = ctx.mappings.upsert(&MappingOverride {
                        dataset_id: dataset_id.clone(),
                        source_label: account.clone(),
                        target_header: header.to_string(),
                    });
                    match saved {
                        Ok(()) => outcome.created_mappings += 1,
                        Err(e) => {
                            warn!(account = %account, error = %e, "could not persist mapping");
                            record.error = Some(e.to_string());
                            outcome.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(account = %account, error = %e, "could not adjudicate account");
                record.error = Some(e.to_string());
                outcome.failed += 1;
            }
        }
        outcome.decisions.push(record);
    }

    info!(
        created = outcome.created_mappings,
        failed = outcome.failed,
        skipped = outcome.skipped_already_mapped,
        "discovery finished"
    );
    outcome.decisions.truncate(MAX_DECISIONS);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::adjudicator::testing::ScriptedModel;
    use crate::overrides::testing::{FailingStore, MemoryStore};
    use crate::overrides::MappingStore;
    use crate::ranker::testing::TableEmbedder;
    use crate::settings::Settings;
    use crate::storage::{LocalStore, ObjectStore};

    const CSV: &str = "Account Name,Symbol,Quantity\n\
        Fidelity 401K,AAPL,1\n\
        Joint Account,AAPL,2\n\
        Fidelity 401K,MSFT,3\n";

    fn embedder() -> TableEmbedder {
        TableEmbedder::new(&[
            ("Fidelity 401K", vec![1.0, 0.0, 0.0]),
            ("Joint Account", vec![0.0, 1.0, 0.0]),
            ("BrokerageLink", vec![0.9, 0.1, 0.0]),
            ("BrokerageLink Roth", vec![0.7, 0.0, 0.7]),
            ("Joint WROS", vec![0.1, 0.9, 0.0]),
        ])
    }

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("portfolio"));
        store.put("source/positions.csv", CSV.as_bytes(), "text/csv").unwrap();

        let mut wb = Workbook::new();
        let mut cover = Sheet::new("Cover");
        cover.set(1, 1, "Portfolio");
        wb.push_sheet(cover);
        let mut aapl = Sheet::new("AAPL");
        aapl.set(1, 1, "Apple");
        aapl.set(1, 2, "BrokerageLink");
        aapl.set(1, 3, " Joint WROS ");
        aapl.set(1, 4, "BrokerageLink Roth");
        aapl.set(1, 5, 42.0);
        wb.push_sheet(aapl);
        store
            .put("source/template.xlsx", &wb.to_xlsx_bytes().unwrap(), "application/octet-stream")
            .unwrap();
        (dir, store)
    }

    fn request() -> DiscoveryRequest {
        DiscoveryRequest {
            csv_key: "source/positions.csv".to_string(),
            template_key: "source/template.xlsx".to_string(),
            dataset_id: None,
            only_unmapped: false,
        }
    }

    #[test]
    fn test_template_headers_first_sheet_with_any() {
        let mut wb = Workbook::new();
        wb.push_sheet(Sheet::new("Empty"));
        let mut a = Sheet::new("A");
        a.set(1, 3, "Zeta");
        a.set(1, 2, "Alpha");
        a.set(1, 60, "Too Far");
        wb.push_sheet(a);
        let mut b = Sheet::new("B");
        b.set(1, 2, "Other");
        wb.push_sheet(b);
        assert_eq!(template_headers(&wb), vec!["Alpha", "Zeta"]);
    }

    #[test]
    fn test_template_headers_none() {
        let mut wb = Workbook::new();
        let mut a = Sheet::new("A");
        a.set(1, 1, "Only column A");
        wb.push_sheet(a);
        assert!(template_headers(&wb).is_empty());
    }

    #[test]
    fn test_discovery_persists_matches() {
        let (_dir, store) = store();
        let settings = Settings::default();
        let mappings = MemoryStore::default();
        let ctx = RunContext {
            bucket: "portfolio".to_string(),
            settings: &settings,
            store: &store,
            mappings: &mappings,
        };
        let embedder = embedder();
        let model = ScriptedModel::replying("\"Joint WROS\"");
        let services = Services {
            embedder: &embedder,
            model: &model,
            batch_size: 16,
        };
        let out = run_discovery(&ctx, &services, &request()).unwrap();

        assert_eq!(out.excel_headers_considered, vec!["BrokerageLink", "BrokerageLink Roth", "Joint WROS"]);
        assert_eq!(out.accounts_seen, 2);
        assert_eq!(out.created_mappings, 2);
        // 401K goes by domain rule without asking the model.
        assert_eq!(out.decisions[0].choice, "BrokerageLink");
        assert_eq!(out.decisions[0].candidates.len(), 3);
        assert_eq!(out.decisions[0].candidates[0].header, "BrokerageLink");
        assert_eq!(out.decisions[1].choice, "Joint WROS");
        assert_eq!(model.prompts.borrow().len(), 1);

        let saved = mappings.query("default").unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().any(|m| m.source_label == "Fidelity 401K" && m.target_header == "BrokerageLink"));
    }

    #[test]
    fn test_unmatched_is_not_persisted() {
        let (_dir, store) = store();
        let settings = Settings::default();
        let mappings = MemoryStore::default();
        let ctx = RunContext {
            bucket: "portfolio".to_string(),
            settings: &settings,
            store: &store,
            mappings: &mappings,
        };
        let embedder = embedder();
        let model = ScriptedModel::replying("UNMATCHED");
        let services = Services {
            embedder: &embedder,
            model: &model,
            batch_size: 2,
        };
        let mut req = request();
        req.dataset_id = Some("household".to_string());
        let out = run_discovery(&ctx, &services, &req).unwrap();
        assert_eq!(out.dataset_id, "household");
        assert_eq!(out.created_mappings, 1);
        assert_eq!(out.decisions[1].choice, "UNMATCHED");
        assert_eq!(mappings.query("household").unwrap().len(), 1);
    }

    #[test]
    fn test_only_unmapped_skips_known_labels() {
        let (_dir, store) = store();
        let mut settings = Settings::default();
        settings.account_name_map = BTreeMap::from([("joint account".to_string(), "Joint WROS".to_string())]);
        let mappings = MemoryStore::with(&[("Fidelity 401K", "BrokerageLink")]);
        let ctx = RunContext {
            bucket: "portfolio".to_string(),
            settings: &settings,
            store: &store,
            mappings: &mappings,
        };
        let embedder = embedder();
        let model = ScriptedModel::replying("UNMATCHED");
        let services = Services {
            embedder: &embedder,
            model: &model,
            batch_size: 16,
        };
        let mut req = request();
        req.only_unmapped = true;
        let out = run_discovery(&ctx, &services, &req).unwrap();
        assert_eq!(out.skipped_already_mapped, 2);
        assert!(out.decisions.is_empty());
        assert_eq!(embedder.calls.get(), 0);
    }

    #[test]
    fn test_model_failure_is_recorded_per_account() {
        let (_dir, store) = store();
        let settings = Settings::default();
        let mappings = MemoryStore::default();
        let ctx = RunContext {
            bucket: "portfolio".to_string(),
            settings: &settings,
            store: &store,
            mappings: &mappings,
        };
        let embedder = embedder();
        let model = ScriptedModel::failing("service unavailable");
        let services = Services {
            embedder: &embedder,
            model: &model,
            batch_size: 16,
        };
        let out = run_discovery(&ctx, &services, &request()).unwrap();
        assert_eq!(out.created_mappings, 1);
        assert_eq!(out.failed, 1);
        assert!(out.decisions[1].error.as_deref().unwrap().contains("service unavailable"));
    }

    #[test]
    fn test_store_failure_counts_as_failed() {
        let (_dir, store) = store();
        let settings = Settings::default();
        let ctx = RunContext {
            bucket: "portfolio".to_string(),
            settings: &settings,
            store: &store,
            mappings: &FailingStore,
        };
        let embedder = embedder();
        let model = ScriptedModel::replying("Joint WROS");
        let services = Services {
            embedder: &embedder,
            model: &model,
            batch_size: 16,
        };
        let out = run_discovery(&ctx, &services, &request()).unwrap();
        assert_eq!(out.created_mappings, 0);
        assert_eq!(out.failed, 2);
    }

    #[test]
    fn test_template_without_headers_is_error() {
        let (_dir, store) = store();
        let mut wb = Workbook::new();
        wb.push_sheet(Sheet::new("Blank"));
        store.put("source/blank.xlsx", &wb.to_xlsx_bytes().unwrap(), "x").unwrap();
        let settings = Settings::default();
        let mappings = MemoryStore::default();
        let ctx = RunContext {
            bucket: "portfolio".to_string(),
            settings: &settings,
            store: &store,
            mappings: &mappings,
        };
        let embedder = embedder();
        let model = ScriptedModel::replying("x");
        let services = Services {
            embedder: &embedder,
            model: &model,
            batch_size: 16,
        };
        let mut req = request();
        req.template_key = "source/blank.xlsx".to_string();
        let err = run_discovery(&ctx, &services, &req).unwrap_err();
        assert!(matches!(err, PosmapError::NoHeaders(_)));
    }
}
