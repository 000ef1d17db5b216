use crate::cli::emit;
use crate::cli::runner::LocalRunner;
use crate::error::Result;
use crate::invocation::{execute, Invocation};
use crate::settings::Settings;

/// `payload` is inline JSON, or `@path` naming a file that holds it.
pub fn run(settings: Settings, payload: &str) -> Result<()> {
    let text = match payload.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => payload.to_string(),
    };
    let invocation = Invocation::from_json(&text)?;
    emit(&execute(&invocation, &LocalRunner::new(settings)))
}
