use chrono::Utc;
use serde_json::Value;

use crate::db::get_connection;
use crate::error::Result;
use crate::invocation::Runner;
use crate::mapper::{run_discovery, DiscoveryRequest, Services};
use crate::overrides::SqliteMappingStore;
use crate::pipeline::{error_outcome, process_json, ProcessRequest, RunContext};
use crate::remote::chat::HttpChatModel;
use crate::remote::embeddings::HttpEmbedder;
use crate::settings::Settings;
use crate::storage::LocalStore;

/// Runs invocations against the local store and mapping database. Each call
/// opens its own store, connection and clients.
pub struct LocalRunner {
    settings: Settings,
}

impl LocalRunner {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn mappings(&self) -> Result<SqliteMappingStore> {
        Ok(SqliteMappingStore::new(get_connection(&self.settings.db_path())?))
    }

    fn try_discover(&self, request: &DiscoveryRequest) -> Result<Value> {
        let store = LocalStore::new(self.settings.bucket_root(&self.settings.bucket));
        let mappings = self.mappings()?;
        let embedder = HttpEmbedder::new(&self.settings.embedding)?;
        let model = HttpChatModel::new(&self.settings.adjudicator)?;
        let ctx = RunContext {
            bucket: self.settings.bucket.clone(),
            settings: &self.settings,
            store: &store,
            mappings: &mappings,
        };
        let services = Services {
            embedder: &embedder,
            model: &model,
            batch_size: self.settings.embedding.batch_size,
        };
        Ok(serde_json::to_value(run_discovery(&ctx, &services, request)?)?)
    }
}

impl Runner for LocalRunner {
    fn process(&self, bucket: Option<&str>, request: &ProcessRequest) -> Value {
        let bucket = bucket.unwrap_or(&self.settings.bucket).to_string();
        let store = LocalStore::new(self.settings.bucket_root(&bucket));
        let mappings = match self.mappings() {
            Ok(m) => m,
            Err(e) => return error_outcome(&e),
        };
        let ctx = RunContext {
            bucket,
            settings: &self.settings,
            store: &store,
            mappings: &mappings,
        };
        process_json(&ctx, request, Utc::now())
    }

    fn discover(&self, request: &DiscoveryRequest) -> Value {
        self.try_discover(request).unwrap_or_else(|e| error_outcome(&e))
    }
}
