use colored::Colorize;

use crate::db::get_connection;
use crate::error::Result;
use crate::settings::{save_settings, Settings};

pub fn run(settings: Settings) -> Result<()> {
    save_settings(&settings)?;

    let bucket_root = settings.bucket_root(&settings.bucket);
    std::fs::create_dir_all(bucket_root.join(settings.source_prefix.trim_end_matches('/')))?;
    std::fs::create_dir_all(
        bucket_root
            .join(settings.output_prefix.trim_end_matches('/'))
            .join("reports"),
    )?;
    get_connection(&settings.db_path())?;

    println!("{} posmap at {}", "Initialized".green().bold(), settings.data_dir);
    println!("Bucket:     {}", bucket_root.display());
    println!("Database:   {}", settings.db_path().display());
    println!(
        "Drop exports at {}{}*.csv and the template at {}",
        settings.source_prefix, settings.default_csv_prefix, settings.template_key
    );
    Ok(())
}
