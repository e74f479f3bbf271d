use dbfan_query::{BackendKind, Connector};
use dbfan_query_elasticsearch::{ElasticsearchConfig, ElasticsearchConnector};
use dbfan_query_mongodb::{MongoConfig, MongoConnector};
use dbfan_query_postgres::{PostgresConfig, PostgresConnector};
use dbfan_query_redis::{RedisConfig, RedisConnector};
use dbfan_query_sqlite::{SqliteConfig, SqliteConnector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-target backend settings, selected by the `kind` field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Postgres(PostgresConfig),
    Sqlite(SqliteConfig),
    Mongodb(MongoConfig),
    Elasticsearch(ElasticsearchConfig),
    Redis(RedisConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Postgres(_) => BackendKind::Postgres,
            BackendConfig::Sqlite(_) => BackendKind::Sqlite,
            BackendConfig::Mongodb(_) => BackendKind::MongoDb,
            BackendConfig::Elasticsearch(_) => BackendKind::Elasticsearch,
            BackendConfig::Redis(_) => BackendKind::Redis,
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        match self {
            BackendConfig::Postgres(config) => Arc::new(PostgresConnector::new(config.clone())),
            BackendConfig::Sqlite(config) => Arc::new(SqliteConnector::new(config.clone())),
            BackendConfig::Mongodb(config) => Arc::new(MongoConnector::new(config.clone())),
            BackendConfig::Elasticsearch(config) => {
                Arc::new(ElasticsearchConnector::new(config.clone()))
            }
            BackendConfig::Redis(config) => Arc::new(RedisConnector::new(config.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_matches_kind() {
        let configs = [
            BackendConfig::Sqlite(SqliteConfig::in_memory()),
            BackendConfig::Redis(RedisConfig::default()),
            BackendConfig::Elasticsearch(ElasticsearchConfig::new(vec![
                "http://localhost:9200".to_string(),
            ])),
            BackendConfig::Mongodb(MongoConfig::from_uri("mongodb://localhost", "app")),
        ];

        for config in configs {
            assert_eq!(config.connector().kind(), config.kind());
        }
    }
}
