use colored::Colorize;
use comfy_table::{Cell, CellAlignment, Table};
use serde_json::Value;

use crate::cli::emit;
use crate::cli::runner::LocalRunner;
use crate::error::{PosmapError, Result};
use crate::fmt::{money_opt, quantity};
use crate::invocation::Runner;
use crate::numeric::{to_decimal_money, to_decimal_quantity};
use crate::pipeline::ProcessRequest;
use crate::settings::Settings;

pub fn run(
    settings: Settings,
    source: Option<String>,
    template: Option<String>,
    output: Option<String>,
    bucket: Option<String>,
    table: bool,
) -> Result<()> {
    let request = ProcessRequest {
        source_key: source,
        target_key: template,
        output_key: output,
    };
    let runner = LocalRunner::new(settings);
    let result = runner.process(bucket.as_deref(), &request);
    if table && result["ok"] == true {
        print_table(&result);
        return Ok(());
    }
    if table {
        let message = result["message"].as_str().unwrap_or("run failed");
        return Err(PosmapError::Other(message.to_string()));
    }
    emit(&result)
}

fn print_table(result: &Value) {
    let mut table = Table::new();
    table.set_header(vec!["Symbol", "Account Header", "Qty", "Cost"]);
    if let Some(detail) = result["writes_detail"].as_object() {
        for (symbol, headers) in detail {
            for (header, write) in headers.as_object().into_iter().flatten() {
                let qty = to_decimal_quantity(write["qty_written"].as_f64().unwrap_or_default());
                let cost = write["cost_written"].as_f64().and_then(|c| to_decimal_money(c));
                table.add_row(vec![
                    Cell::new(symbol),
                    Cell::new(header),
                    Cell::new(quantity(qty)).set_alignment(CellAlignment::Right),
                    Cell::new(money_opt(cost)).set_alignment(CellAlignment::Right),
                ]);
            }
        }
    }
    println!("Wrote {}\n{table}", result["output_key"].as_str().unwrap_or_default());

    if let Some(missing) = result["missing_accounts"].as_object() {
        for (sheet, headers) in missing {
            let names: Vec<&str> = headers.as_array().into_iter().flatten().filter_map(Value::as_str).collect();
            println!("{} {sheet}: {}", "No column on".yellow(), names.join(", "));
        }
    }
    if let Some(unmapped) = result["unmapped_accounts"].as_object() {
        for (label, count) in unmapped {
            println!("{} {label} ({count} rows)", "Unmapped:".red());
        }
    }
}
