//! Request/response bridge for push-messaging clients: one JSON message in,
//! one JSON message out, exposing a fixed tool catalog.

use std::io::{BufRead, Write};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::invocation::Runner;
use crate::mapper::DiscoveryRequest;
use crate::pipeline::ProcessRequest;

pub const TOOL_PROCESS: &str = "process_excel";
pub const TOOL_INFER_MAPPING: &str = "infer_mapping";

pub fn tool_catalog() -> Value {
    json!({
        "type": "tools",
        "tools": [
            {
                "name": TOOL_PROCESS,
                "description": "Process a positions CSV into the portfolio workbook. Args optional; defaults apply.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "source_key": {"type": "string"},
                        "target_key": {"type": "string"},
                        "output_key": {"type": "string"}
                    }
                }
            },
            {
                "name": TOOL_INFER_MAPPING,
                "description": "Rank and adjudicate account names from a CSV against template headers, saving matches as overrides.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "csv_key": {"type": "string"},
                        "template_key": {"type": "string"},
                        "dataset_id": {"type": "string"},
                        "only_unmapped": {"type": "boolean"}
                    },
                    "required": ["csv_key", "template_key"]
                }
            }
        ]
    })
}

fn call_tool(tool: &str, args: Value, runner: &dyn Runner) -> std::result::Result<Value, String> {
    match tool {
        TOOL_PROCESS => {
            let req: ProcessRequest = serde_json::from_value(args).map_err(|e| format!("invalid args: {e}"))?;
            Ok(runner.process(None, &req))
        }
        TOOL_INFER_MAPPING => {
            let req: DiscoveryRequest = serde_json::from_value(args).map_err(|e| format!("invalid args: {e}"))?;
            Ok(runner.discover(&req))
        }
        other => Err(format!("unknown tool {other}")),
    }
}

/// Answer one message. Anything that is not a ping or a tool call gets the
/// catalog.
pub fn handle_message(body: &str, runner: &dyn Runner) -> Value {
    let msg: Value = serde_json::from_str(body).unwrap_or_else(|_| json!({}));
    let request_id = msg.get("request_id").cloned().unwrap_or(Value::Null);

    match msg.get("type").and_then(Value::as_str) {
        Some("ping") => json!({ "type": "pong", "request_id": request_id }),
        Some("call_tool") => {
            let tool = msg.get("tool").and_then(Value::as_str).unwrap_or_default();
            let args = match msg.get("args") {
                Some(Value::Null) | None => json!({}),
                Some(v) => v.clone(),
            };
            debug!(tool, "tool call");
            match call_tool(tool, args, runner) {
                Ok(result) => json!({ "type": "tool_result", "ok": true, "result": result, "request_id": request_id }),
                Err(error) => {
                    warn!(tool, error = %error, "tool call rejected");
                    json!({ "type": "tool_result", "ok": false, "error": error, "request_id": request_id })
                }
            }
        }
        _ => tool_catalog(),
    }
}

/// One message per line until the input closes.
pub fn serve<R: BufRead, W: Write>(input: R, mut output: W, runner: &dyn Runner) -> Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_message(&line, runner);
        serde_json::to_writer(&mut output, &reply)?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(())
}
