use std::io;

use crate::bridge;
use crate::cli::runner::LocalRunner;
use crate::error::Result;
use crate::settings::Settings;

pub fn run(settings: Settings) -> Result<()> {
    let runner = LocalRunner::new(settings);
    let stdin = io::stdin();
    bridge::serve(stdin.lock(), io::stdout().lock(), &runner)
}
