use crate::cli::emit;
use crate::cli::runner::LocalRunner;
use crate::error::Result;
use crate::invocation::Runner;
use crate::mapper::DiscoveryRequest;
use crate::settings::Settings;

pub fn run(
    settings: Settings,
    csv_key: String,
    template_key: String,
    dataset_id: Option<String>,
    only_unmapped: bool,
) -> Result<()> {
    let request = DiscoveryRequest {
        csv_key,
        template_key,
        dataset_id,
        only_unmapped,
    };
    emit(&LocalRunner::new(settings).discover(&request))
}
