use colored::Colorize;

use crate::db::get_connection;
use crate::error::Result;
use crate::overrides::SqliteMappingStore;
use crate::settings::Settings;
use crate::storage::{latest_by_prefix, LocalStore, ObjectStore};

pub fn run(settings: &Settings) -> Result<()> {
    let store = LocalStore::new(settings.bucket_root(&settings.bucket));
    let db_path = settings.db_path();

    println!("Data dir:   {}", settings.data_dir);
    println!("Bucket:     {} ({})", settings.bucket, store.root().display());
    println!("Dataset:    {}", settings.dataset_id);
    println!("Cost mode:  {}", settings.cost_mode.key());
    println!("Rows:       qty {} / cost {}", settings.row_qty, settings.row_cost);

    let prefix = format!("{}{}", settings.source_prefix, settings.default_csv_prefix);
    match latest_by_prefix(&store, &prefix, Some(".csv"))? {
        Some(key) => println!("Latest CSV: {key}"),
        None => println!("Latest CSV: {}", format!("(none under {prefix}*.csv)").yellow()),
    }
    if store.exists(&settings.template_key) {
        println!("Template:   {}", settings.template_key);
    } else {
        println!("Template:   {}", format!("{} (missing)", settings.template_key).red());
    }

    println!();
    if db_path.exists() {
        let mappings = SqliteMappingStore::new(get_connection(&db_path)?);
        println!("Overrides:     {}", mappings.count(&settings.dataset_id)?);
    } else {
        println!("Database not found. Run `posmap init` to set up.");
    }
    println!("Fallback map:  {}", settings.account_name_map.len());
    println!("Domain rules:  {}", settings.domain_rules.len());
    Ok(())
}
