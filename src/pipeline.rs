//! Processing run: PARSE -> RESOLVE -> AGGREGATE -> WRITE -> REPORT -> PERSIST.
//!
//! Stages run strictly in order. Any error returned from a stage aborts the
//! run before anything is persisted; degraded collaborator reads are absorbed
//! inside the stage that makes them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, info_span, warn};

use crate::aggregator::aggregate;
use crate::error::{PosmapError, Result};
use crate::importer::{compute_checksum, read_positions_csv};
use crate::overrides::{MappingStore, OverrideResolver};
use crate::report::{build_report, render_report_sheet, ReportKeys};
use crate::settings::Settings;
use crate::storage::{latest_by_prefix, ObjectStore, JSON_CONTENT_TYPE, XLSX_CONTENT_TYPE};
use crate::workbook::Workbook;
use crate::writer::{self, CellWrite, RowLayout};

/// Everything one invocation needs. Built per call, never shared.
pub struct RunContext<'a> {
    pub bucket: String,
    pub settings: &'a Settings,
    pub store: &'a dyn ObjectStore,
    pub mappings: &'a dyn MappingStore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub source_key: Option<String>,
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub status: &'static str,
    pub ok: bool,
    pub bucket: String,
    pub source_key: String,
    pub target_key: String,
    pub output_key: String,
    pub report_key: String,
    pub wrote_rows: usize,
    pub per_ticker_writes: usize,
    pub symbols_updated: Vec<String>,
    pub missing_accounts: BTreeMap<String, Vec<String>>,
    pub unmapped_accounts: BTreeMap<String, usize>,
    pub writes_detail: BTreeMap<String, BTreeMap<String, CellWrite>>,
}

/// The structured result every caller sees when a run fails.
pub fn error_outcome(err: &PosmapError) -> Value {
    json!({ "ok": false, "status": "error", "message": err.to_string() })
}

fn compact_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

fn output_base(settings: &Settings) -> &str {
    settings.output_prefix.trim_end_matches('/')
}

pub fn default_output_key(settings: &Settings, now: DateTime<Utc>) -> String {
    format!("{}/portfolio-updated-{}.xlsx", output_base(settings), compact_stamp(now))
}

pub fn report_key(settings: &Settings, now: DateTime<Utc>) -> String {
    format!("{}/reports/{}-report.json", output_base(settings), compact_stamp(now))
}

/// Latest `<source_prefix><default_csv_prefix>*.csv` in the store.
pub fn default_source_key(ctx: &RunContext<'_>) -> Result<String> {
    let prefix = format!("{}{}", ctx.settings.source_prefix, ctx.settings.default_csv_prefix);
    latest_by_prefix(ctx.store, &prefix, Some(".csv"))?
        .ok_or_else(|| PosmapError::NoInput(format!("No CSV found under {prefix}*.csv")))
}

/// Fetch the template, falling back to the configured default when an
/// explicitly requested key is missing.
fn load_template(ctx: &RunContext<'_>, requested: &str) -> Result<(String, Vec<u8>)> {
    let default = ctx.settings.template_key.as_str();
    match ctx.store.get(requested) {
        Ok(bytes) => return Ok((requested.to_string(), bytes)),
        Err(e) if e.is_input_shape() && requested != default => {
            warn!(requested, default, "template not found, using default template");
        }
        Err(e) if e.is_input_shape() => {
            return Err(PosmapError::TemplateMissing(requested.to_string()));
        }
        Err(e) => return Err(e),
    }
    match ctx.store.get(default) {
        Ok(bytes) => Ok((default.to_string(), bytes)),
        Err(e) if e.is_input_shape() => Err(PosmapError::TemplateMissing(format!(
            "{requested} (default {default} missing too)"
        ))),
        Err(e) => Err(e),
    }
}

pub fn run_process(ctx: &RunContext<'_>, req: &ProcessRequest, now: DateTime<Utc>) -> Result<ProcessOutcome> {
    let settings = ctx.settings;
    let span = info_span!("process", bucket = %ctx.bucket);
    let _guard = span.enter();

    // PARSE
    let source_key = match &req.source_key {
        Some(key) if !key.trim().is_empty() => key.clone(),
        _ => default_source_key(ctx)?,
    };
    let requested_template = req
        .target_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .unwrap_or_else(|| settings.template_key.clone());
    let output_key = req
        .output_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .unwrap_or_else(|| default_output_key(settings, now));

    let csv_bytes = ctx.store.get(&source_key)?;
    let source_sha256 = compute_checksum(&csv_bytes);
    let rows = read_positions_csv(&csv_bytes, settings.cost_mode)?;
    let (target_key, template_bytes) = load_template(ctx, &requested_template)?;
    let mut workbook = Workbook::from_xlsx_bytes(&template_bytes)?;
    info!(stage = "PARSE", %source_key, %target_key, rows = rows.len(), "inputs loaded");

    // RESOLVE
    let resolver = OverrideResolver::resolve_overrides(&settings.dataset_id, &settings.account_name_map, ctx.mappings);
    if resolver.is_empty() {
        warn!(dataset_id = %settings.dataset_id, "no account overrides, every row will be unmapped");
    }
    info!(stage = "RESOLVE", overrides = resolver.len(), "override table ready");

    // AGGREGATE
    let agg = aggregate(&rows, &resolver);
    info!(
        stage = "AGGREGATE",
        symbols = agg.cells.len(),
        unmapped_rows = agg.unmapped_rows(),
        "rows aggregated"
    );

    // WRITE
    let layout = RowLayout {
        qty: settings.row_qty,
        cost: settings.row_cost,
    };
    let written = writer::write(&mut workbook, &agg, layout);
    info!(stage = "WRITE", cells = written.updated, "workbook updated");

    // REPORT
    let report = build_report(&rows, &agg, &written, &source_sha256, now);
    let keys = ReportKeys {
        source: &source_key,
        template: &target_key,
        output: &output_key,
    };
    render_report_sheet(&mut workbook, &report, keys)?;
    info!(stage = "REPORT", writes = report.summary.per_ticker_writes, "report built");

    // PERSIST: serialize both before writing either.
    let report_key = report_key(settings, now);
    let report_bytes = report.to_json_bytes()?;
    let workbook_bytes = workbook.to_xlsx_bytes()?;
    ctx.store.put(&report_key, &report_bytes, JSON_CONTENT_TYPE)?;
    ctx.store.put(&output_key, &workbook_bytes, XLSX_CONTENT_TYPE)?;
    info!(stage = "PERSIST", %output_key, %report_key, "run persisted");

    Ok(ProcessOutcome {
        status: "ok",
        ok: true,
        bucket: ctx.bucket.clone(),
        source_key,
        target_key,
        output_key,
        report_key,
        wrote_rows: rows.len(),
        per_ticker_writes: report.summary.per_ticker_writes,
        symbols_updated: report.symbols_updated,
        missing_accounts: report.missing_accounts,
        unmapped_accounts: report.unmapped_accounts,
        writes_detail: report.writes_detail,
    })
}

/// Run and fold any failure into the structured error shape.
pub fn process_json(ctx: &RunContext<'_>, req: &ProcessRequest, now: DateTime<Utc>) -> Value {
    match run_process(ctx, req, now) {
        Ok(outcome) => serde_json::to_value(outcome).unwrap_or_else(|e| error_outcome(&e.into())),
        Err(e) => {
            warn!(error = %e, input_shape = e.is_input_shape(), "processing run failed");
            error_outcome(&e)
        }
    }
}
