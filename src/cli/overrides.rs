use comfy_table::{Cell, Table};

use crate::db::get_connection;
use crate::error::{PosmapError, Result};
use crate::models::MappingOverride;
use crate::overrides::{MappingStore, SqliteMappingStore};
use crate::settings::Settings;

fn store(settings: &Settings) -> Result<SqliteMappingStore> {
    Ok(SqliteMappingStore::new(get_connection(&settings.db_path())?))
}

pub fn list(settings: &Settings, dataset: Option<String>) -> Result<()> {
    let dataset_id = dataset.unwrap_or_else(|| settings.dataset_id.clone());
    let rows = store(settings)?.query(&dataset_id)?;

    let mut table = Table::new();
    table.set_header(vec!["Source Account", "Template Header"]);
    for row in &rows {
        table.add_row(vec![Cell::new(&row.source_label), Cell::new(&row.target_header)]);
    }
    println!("Overrides ({dataset_id}, {})\n{table}", rows.len());
    if !settings.account_name_map.is_empty() {
        let mut fallback = Table::new();
        fallback.set_header(vec!["Source Account", "Template Header"]);
        for (source, target) in &settings.account_name_map {
            fallback.add_row(vec![Cell::new(source), Cell::new(target)]);
        }
        println!("Fallback map\n{fallback}");
    }
    Ok(())
}

pub fn set(settings: &Settings, source: &str, target: &str, dataset: Option<String>) -> Result<()> {
    if source.trim().is_empty() || target.trim().is_empty() {
        return Err(PosmapError::Other("source and target must be non-empty".to_string()));
    }
    let record = MappingOverride {
        dataset_id: dataset.unwrap_or_else(|| settings.dataset_id.clone()),
        source_label: source.to_string(),
        target_header: target.trim().to_string(),
    };
    store(settings)?.upsert(&record)?;
    println!(
        "Mapped \"{}\" -> \"{}\" ({})",
        record.source_label, record.target_header, record.dataset_id
    );
    Ok(())
}
