//! Query router.
//!
//! Holds the registry of named data sources, resolves each request to one of
//! them, builds adapters lazily and normalizes every outcome into a
//! [`QueryResult`].
//!
//! Lock order is `configs` before `adapters`; the per-name creation guard is
//! the only lock held across an adapter call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use common::config::RouterConfig;
use common::errors::{AppError, AppResult};
use common::models::{
    AdapterQueryResult, DataSourceConfig, DataSourceType, DataSourceUpdate, QueryRequest,
    QueryResult, QUERY_EXECUTION_ERROR,
};

use crate::adapter::DatabaseAdapter;
use crate::factory::{AdapterFactory, DefaultAdapterFactory};

/// Routes SQL requests to named data sources.
pub struct QueryRouter {
    /// Declarative registry, keyed by data source name.
    configs: RwLock<BTreeMap<String, DataSourceConfig>>,
    /// Live adapters, keyed by data source name.
    adapters: RwLock<HashMap<String, Arc<dyn DatabaseAdapter>>>,
    /// One creation lock per name so concurrent requests build one adapter.
    creating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    default_data_source: RwLock<Option<String>>,
    settings: RouterConfig,
    factory: Arc<dyn AdapterFactory>,
}

impl QueryRouter {
    /// Creates a router over `data_sources` using the built-in backends.
    pub fn new(data_sources: Vec<DataSourceConfig>, settings: RouterConfig) -> AppResult<Self> {
        let factory = Arc::new(DefaultAdapterFactory::from_config(&settings));
        Self::with_factory(data_sources, settings, factory)
    }

    /// Creates a router that builds adapters through `factory`.
    ///
    /// No adapter is created here; connections open on first use.
    pub fn with_factory(
        data_sources: Vec<DataSourceConfig>,
        settings: RouterConfig,
        factory: Arc<dyn AdapterFactory>,
    ) -> AppResult<Self> {
        let mut configs = BTreeMap::new();
        for config in data_sources {
            config.check()?;
            if configs.contains_key(&config.name) {
                return Err(AppError::Configuration(format!(
                    "Duplicate data source name '{}'",
                    config.name
                )));
            }
            configs.insert(config.name.clone(), config);
        }

        tracing::info!(
            data_sources = configs.len(),
            default = ?settings.default_data_source,
            "Query router created"
        );

        Ok(Self {
            configs: RwLock::new(configs),
            adapters: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            default_data_source: RwLock::new(settings.default_data_source.clone()),
            settings,
            factory,
        })
    }

    /// Picks the data source for `request`.
    ///
    /// Precedence: explicit `warehouse`, then the default, then the only
    /// registered source.
    pub async fn resolve_data_source(&self, request: &QueryRequest) -> AppResult<String> {
        let configs = self.configs.read().await;

        if let Some(name) = &request.warehouse {
            if !configs.contains_key(name) {
                return Err(AppError::DataSourceNotFound(name.clone()));
            }
            return Ok(name.clone());
        }

        if let Some(default) = self.default_data_source.read().await.as_ref() {
            if !configs.contains_key(default) {
                return Err(AppError::DefaultDataSourceNotFound(default.clone()));
            }
            return Ok(default.clone());
        }

        if configs.len() == 1 {
            if let Some(name) = configs.keys().next() {
                return Ok(name.clone());
            }
        }

        Err(AppError::NoDataSourceSpecified {
            available: configs.keys().cloned().collect(),
        })
    }

    /// Returns the live adapter for `name`, building and caching it if needed.
    pub async fn get_adapter(&self, name: &str) -> AppResult<Arc<dyn DatabaseAdapter>> {
        if let Some(adapter) = self.cached_adapter(name).await {
            return Ok(adapter);
        }

        let guard = self.creation_guard(name).await;
        let _creating = guard.lock().await;

        if let Some(adapter) = self.cached_adapter(name).await {
            return Ok(adapter);
        }

        let config = self
            .configs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::DataSourceNotFound(name.to_string()))?;

        let adapter = self.factory.create_adapter(&config.credentials).await?;

        // The entry may have been removed or replaced while connecting.
        let cached = {
            let configs = self.configs.read().await;
            if configs.get(name) == Some(&config) {
                self.adapters
                    .write()
                    .await
                    .insert(name.to_string(), Arc::clone(&adapter));
                true
            } else {
                false
            }
        };

        if !cached {
            tracing::warn!(data_source = %name, "Data source changed while connecting, discarding adapter");
            close_adapter(name, adapter.as_ref()).await;
            return Err(AppError::DataSourceNotFound(name.to_string()));
        }

        tracing::info!(data_source = %name, data_source_type = %config.data_source_type, "Adapter cached");
        Ok(adapter)
    }

    /// Runs `request` against its resolved data source.
    ///
    /// Resolution errors are returned as `Err`; connection and query failures
    /// come back as an unsuccessful [`QueryResult`].
    pub async fn execute(&self, request: QueryRequest) -> AppResult<QueryResult> {
        let name = self.resolve_data_source(&request).await?;
        let options = request.options.clone().unwrap_or_default();
        let params = request.params.as_deref().unwrap_or(&[]);
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.settings.query_timeout());

        tracing::debug!(data_source = %name, sql = %request.sql, "Executing query");
        let started = Instant::now();
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(&name, &request.sql, params))
                .await
                .unwrap_or_else(|_| {
                    Err(AppError::QueryTimeout {
                        timeout_ms: limit.as_millis() as u64,
                    })
                }),
            None => self.run(&name, &request.sql, params).await,
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let mut result = QueryResult::from_adapter(result, &name, execution_time_ms);
                if let Some(max_rows) = options.max_rows.or(self.settings.max_rows) {
                    result.truncate(max_rows);
                }
                tracing::debug!(
                    data_source = %name,
                    rows = result.rows.len(),
                    execution_time_ms,
                    "Query completed"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(data_source = %name, code = e.code(), error = %e, "Query failed");
                Ok(QueryResult::failure(
                    name,
                    QUERY_EXECUTION_ERROR,
                    e.to_string(),
                    execution_time_ms,
                ))
            }
        }
    }

    /// Registers a data source and connects to it.
    ///
    /// If the connection cannot be established the registration is undone.
    pub async fn add_data_source(&self, config: DataSourceConfig) -> AppResult<()> {
        config.check()?;
        let name = config.name.clone();

        {
            let mut configs = self.configs.write().await;
            if configs.contains_key(&name) {
                return Err(AppError::DataSourceExists(name));
            }
            configs.insert(name.clone(), config.clone());
        }

        if let Err(e) = self.get_adapter(&name).await {
            let mut configs = self.configs.write().await;
            if configs.get(&name) == Some(&config) {
                configs.remove(&name);
            }
            tracing::warn!(
                data_source = %name,
                code = e.code(),
                error = %e,
                "Data source rejected"
            );
            return Err(e);
        }

        tracing::info!(data_source = %name, "Data source added");
        Ok(())
    }

    /// Closes and forgets a data source. Unknown names are ignored.
    pub async fn remove_data_source(&self, name: &str) {
        let (removed, adapter) = {
            let mut configs = self.configs.write().await;
            let removed = configs.remove(name).is_some();
            (removed, self.adapters.write().await.remove(name))
        };
        self.creating.lock().await.remove(name);

        if let Some(adapter) = adapter {
            close_adapter(name, adapter.as_ref()).await;
        }
        if removed {
            tracing::info!(data_source = %name, "Data source removed");
        }
    }

    /// Applies `update` to an existing data source.
    ///
    /// A change of type or credentials reconnects; if that fails the previous
    /// configuration is restored.
    pub async fn update_data_source(&self, name: &str, update: DataSourceUpdate) -> AppResult<()> {
        let previous = self
            .configs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::DataSourceNotFound(name.to_string()))?;
        let merged = previous.merged(&update);
        merged.check()?;

        if !update.touches_connection() {
            self.configs.write().await.insert(name.to_string(), merged);
            tracing::info!(data_source = %name, "Data source settings updated");
            return Ok(());
        }

        let evicted = {
            let mut configs = self.configs.write().await;
            configs.insert(name.to_string(), merged.clone());
            self.adapters.write().await.remove(name)
        };
        if let Some(adapter) = evicted {
            close_adapter(name, adapter.as_ref()).await;
        }

        if let Err(e) = self.get_adapter(name).await {
            let mut configs = self.configs.write().await;
            if configs.get(name) == Some(&merged) {
                configs.insert(name.to_string(), previous);
            }
            tracing::warn!(data_source = %name, code = e.code(), error = %e, "Update rolled back");
            return Err(e);
        }

        tracing::info!(data_source = %name, "Data source reconnected with new settings");
        Ok(())
    }

    /// Registered data source names, sorted.
    pub async fn get_data_sources(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }

    /// Stored configuration for `name`.
    pub async fn get_data_source_config(&self, name: &str) -> Option<DataSourceConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// Names of the data sources of one backend type.
    pub async fn get_data_sources_by_type(&self, data_source_type: DataSourceType) -> Vec<String> {
        self.configs
            .read()
            .await
            .values()
            .filter(|config| config.data_source_type == data_source_type)
            .map(|config| config.name.clone())
            .collect()
    }

    /// Names that currently hold a live adapter, sorted.
    pub async fn connected_data_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn default_data_source(&self) -> Option<String> {
        self.default_data_source.read().await.clone()
    }

    /// Sets or clears the default. A new default must be registered.
    pub async fn set_default_data_source(&self, name: Option<String>) -> AppResult<()> {
        let configs = self.configs.read().await;
        if let Some(name) = &name {
            if !configs.contains_key(name) {
                return Err(AppError::DataSourceNotFound(name.clone()));
            }
        }
        tracing::info!(default = ?name, "Default data source changed");
        *self.default_data_source.write().await = name;
        Ok(())
    }

    /// Whether `name` can be connected to and answers. Failures yield `false`.
    pub async fn test_data_source(&self, name: &str) -> bool {
        let outcome = match self.get_adapter(name).await {
            Ok(adapter) => adapter.test_connection().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(
                    data_source = %name,
                    code = e.code(),
                    error = %e,
                    "Connection test failed"
                );
                false
            }
        }
    }

    /// Tests every registered data source concurrently.
    pub async fn test_all_data_sources(&self) -> HashMap<String, bool> {
        let names = self.get_data_sources().await;
        join_all(names.into_iter().map(|name| async move {
            let ok = self.test_data_source(&name).await;
            (name, ok)
        }))
        .await
        .into_iter()
        .collect()
    }

    /// Closes every live adapter. Registrations are kept and later requests
    /// reconnect.
    pub async fn close(&self) {
        let drained: Vec<(String, Arc<dyn DatabaseAdapter>)> =
            self.adapters.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        join_all(
            drained
                .iter()
                .map(|(name, adapter)| close_adapter(name, adapter.as_ref())),
        )
        .await;
        tracing::info!(closed = drained.len(), "Query router closed");
    }

    async fn run(&self, name: &str, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        let adapter = self.get_adapter(name).await?;
        adapter.query(sql, params).await
    }

    async fn cached_adapter(&self, name: &str) -> Option<Arc<dyn DatabaseAdapter>> {
        self.adapters.read().await.get(name).cloned()
    }

    async fn creation_guard(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.creating
                .lock()
                .await
                .entry(name.to_string())
                .or_default(),
        )
    }
}

async fn close_adapter(name: &str, adapter: &dyn DatabaseAdapter) {
    if let Err(e) = adapter.close().await {
        tracing::warn!(data_source = %name, error = %e, "Failed to close adapter");
    }
}
