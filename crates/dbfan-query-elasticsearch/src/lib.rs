//! Elasticsearch backend for dbfan-query
//!
//! Talks to the REST API directly with `reqwest`. A query payload is a search
//! body with an optional `index` (a name or a list of names); the hits'
//! `_source` documents become records. `"count": true` returns the total hit
//! count instead. Query text not starting with `{` or `[` is SQL, translated
//! to a search body by the cluster's `_sql/translate` endpoint. Writes index a
//! single document.

use async_trait::async_trait;
use dbfan_query::{
    effective_limit, BackendKind, BufferedCursor, Connector, DataError, Executor, Query, Result,
    RowCursor, Value,
};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings for one Elasticsearch cluster
#[derive(Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Node base URLs, tried in order on connect
    pub addresses: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ElasticsearchConfig {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            username: None,
            password: None,
            accept_invalid_certs: false,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|e| {
                DataError::invalid_configuration(format!("Failed to create HTTP client: {}", e))
            })
    }
}

impl fmt::Debug for ElasticsearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticsearchConfig")
            .field("addresses", &self.addresses)
            .field("username", &self.username)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct BasicAuth {
    username: String,
    password: Option<String>,
}

impl BasicAuth {
    fn apply(auth: &Option<BasicAuth>, request: RequestBuilder) -> RequestBuilder {
        match auth {
            Some(auth) => request.basic_auth(&auth.username, auth.password.as_deref()),
            None => request,
        }
    }
}

pub struct ElasticsearchConnector {
    config: ElasticsearchConfig,
}

impl ElasticsearchConnector {
    pub fn new(config: ElasticsearchConfig) -> Self {
        Self { config }
    }

    fn auth(&self) -> Option<BasicAuth> {
        self.config.username.as_ref().map(|username| BasicAuth {
            username: username.clone(),
            password: self.config.password.clone(),
        })
    }
}

#[async_trait]
impl Connector for ElasticsearchConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Elasticsearch
    }

    fn describe(&self) -> String {
        self.config.addresses.join(",")
    }

    async fn connect(&self) -> Result<Arc<dyn Executor>> {
        if self.config.addresses.is_empty() {
            return Err(DataError::invalid_configuration(
                "Elasticsearch target needs at least one address",
            ));
        }

        let client = self.config.client()?;
        let auth = self.auth();
        let mut last_error = String::new();

        for address in &self.config.addresses {
            let base_url = match Url::parse(address.trim_end_matches('/')) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Invalid Elasticsearch address {}: {}", address, e);
                    last_error = format!("{}: {}", address, e);
                    continue;
                }
            };
            debug!("Checking Elasticsearch node {}", base_url);

            let request = BasicAuth::apply(&auth, client.get(base_url.clone()));
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Elasticsearch node {} is reachable", base_url);
                    return Ok(Arc::new(ElasticsearchExecutor {
                        client,
                        base_url,
                        auth,
                    }));
                }
                Ok(response) => {
                    warn!("Elasticsearch node {} answered {}", base_url, response.status());
                    last_error = format!("{} answered {}", base_url, response.status());
                }
                Err(e) => {
                    warn!("Elasticsearch node {} unreachable: {}", base_url, e);
                    last_error = format!("{}: {}", base_url, e);
                }
            }
        }

        error!("No Elasticsearch node reachable");
        Err(DataError::connection_failed(
            BackendKind::Elasticsearch,
            format!("no reachable node ({})", last_error),
        ))
    }
}

pub struct ElasticsearchExecutor {
    client: Client,
    base_url: Url,
    auth: Option<BasicAuth>,
}

/// Search payload split into the index path and the request body
#[derive(Debug, PartialEq)]
struct SearchRequest {
    index: Option<String>,
    body: Map<String, serde_json::Value>,
    /// SQL to translate into the body before searching
    sql: Option<String>,
    /// Return the total hit count instead of the hits
    count: bool,
}

#[derive(Debug, Deserialize)]
struct WritePayload {
    index: String,
    #[serde(default)]
    id: Option<String>,
    document: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<serde_json::Value>,
    #[serde(default)]
    hits: Vec<Hit>,
}

impl Hits {
    /// `hits.total` is `{"value": n}` since 7.x and a bare number before
    fn total(&self) -> Option<i64> {
        match self.total.as_ref()? {
            serde_json::Value::Object(total) => total.get("value")?.as_i64(),
            total => total.as_i64(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source", default)]
    source: Option<Map<String, serde_json::Value>>,
}

/// Index named by the FROM clause of a SQL query
fn sql_index(sql: &str) -> Option<String> {
    let mut tokens = sql.split_whitespace();
    tokens.find(|token| token.eq_ignore_ascii_case("from"))?;
    let index = tokens
        .next()?
        .trim_matches(|c| matches!(c, '"' | '`' | '\'' | ';' | ')'));
    (!index.is_empty()).then(|| index.to_string())
}

fn is_sql_text(query: &Query) -> bool {
    query
        .as_text()
        .map(|text| !text.trim_start().starts_with(['{', '[']))
        .unwrap_or(false)
}

fn parse_search(query: &Query, limit: usize) -> Result<SearchRequest> {
    if is_sql_text(query) {
        let sql = query.to_string();
        let mut body = Map::new();
        body.insert("size".to_string(), json!(effective_limit(limit)));
        return Ok(SearchRequest {
            index: sql_index(&sql),
            body,
            sql: Some(sql),
            count: false,
        });
    }

    let mut body = match query.to_json()? {
        serde_json::Value::Object(body) => body,
        _ => {
            return Err(DataError::invalid_query(
                "Elasticsearch search payload must be an object",
            ))
        }
    };

    let index = match body.remove("index") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(index)) => Some(index),
        Some(serde_json::Value::Array(names)) => Some(
            names
                .iter()
                .map(|name| {
                    name.as_str().map(str::to_string).ok_or_else(|| {
                        DataError::invalid_query("`index` list must only hold strings")
                    })
                })
                .collect::<Result<Vec<_>>>()?
                .join(","),
        ),
        Some(_) => {
            return Err(DataError::invalid_query(
                "`index` must be a string or a list of strings",
            ))
        }
    };

    let sql = match body.remove("sql") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(sql)) => Some(sql),
        Some(_) => return Err(DataError::invalid_query("`sql` must be a string")),
    };
    let index = index.or_else(|| sql.as_deref().and_then(sql_index));

    let count = match body.remove("count") {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(count)) => count,
        Some(_) => return Err(DataError::invalid_query("`count` must be a boolean")),
    };

    if count {
        body.insert("size".to_string(), json!(0));
        body.insert("track_total_hits".to_string(), json!(true));
    } else {
        body.insert("size".to_string(), json!(effective_limit(limit)));
    }

    Ok(SearchRequest {
        index,
        body,
        sql,
        count,
    })
}

/// Append path segments to the node URL, percent-encoding each one
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| {
            DataError::invalid_configuration(format!("{} cannot be used as a base URL", base))
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn ignore_params(params: &[Value]) {
    if !params.is_empty() {
        warn!(
            "Elasticsearch payloads carry their own values; ignoring {} params",
            params.len()
        );
    }
}

impl ElasticsearchExecutor {
    fn request(&self, request: RequestBuilder) -> RequestBuilder {
        BasicAuth::apply(&self.auth, request)
    }

    /// Turn SQL into a search body with the cluster's translate API
    async fn translate_sql(&self, sql: &str) -> Result<Map<String, serde_json::Value>> {
        let url = endpoint(&self.base_url, &["_sql", "translate"])?;
        debug!("Translating SQL: {}", sql);

        let response = self
            .request(self.client.post(url))
            .json(&json!({ "query": sql }))
            .send()
            .await
            .map_err(|e| http_error("SQL translate", e))?;
        let response = self.check(response, "SQL translate").await?;

        match response.json().await {
            Ok(serde_json::Value::Object(body)) => Ok(body),
            Ok(other) => Err(DataError::read_failed(format!(
                "SQL translate returned a non-object: {}",
                other
            ))),
            Err(e) => Err(DataError::read_failed(format!(
                "Invalid SQL translate response: {}",
                e
            ))),
        }
    }

    /// Fail with the response body on any non-2xx status
    async fn check(&self, response: Response, action: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!("Elasticsearch {} returned {}: {}", action, status, body);
        Err(DataError::query_failed(format!(
            "Elasticsearch {} returned status {}: {}",
            action, status, body
        )))
    }
}

fn http_error(action: &str, e: reqwest::Error) -> DataError {
    error!("Elasticsearch {} request failed: {}", action, e);
    DataError::query_failed(format!("Elasticsearch {} request failed: {}", action, e))
}

#[async_trait]
impl Executor for ElasticsearchExecutor {
    async fn run_query(
        &self,
        query: &Query,
        params: &[Value],
        limit: usize,
    ) -> Result<Box<dyn RowCursor>> {
        ignore_params(params);

        let mut search = parse_search(query, limit)?;
        if let Some(sql) = search.sql.take() {
            // Payload keys win over the translated ones
            for (key, value) in self.translate_sql(&sql).await? {
                search.body.entry(key).or_insert(value);
            }
        }

        let url = match &search.index {
            Some(index) => endpoint(&self.base_url, &[index.as_str(), "_search"])?,
            None => endpoint(&self.base_url, &["_search"])?,
        };

        debug!("Searching {}", url);

        let response = self
            .request(self.client.post(url))
            .json(&search.body)
            .send()
            .await
            .map_err(|e| http_error("search", e))?;
        let response = self.check(response, "search").await?;

        let result: SearchResponse = response
            .json()
            .await
            .map_err(|e| DataError::read_failed(format!("Invalid search response: {}", e)))?;

        if search.count {
            let total = result.hits.total().ok_or_else(|| {
                DataError::read_failed("Search response carries no hits.total")
            })?;
            debug!("Search matched {} documents", total);

            let mut document = Map::new();
            document.insert("count".to_string(), json!(total));
            return Ok(Box::new(BufferedCursor::from_documents(vec![document])));
        }

        let documents: Vec<_> = result
            .hits
            .hits
            .into_iter()
            .map(|hit| hit.source.unwrap_or_default())
            .collect();

        debug!("Search returned {} hits", documents.len());
        Ok(Box::new(BufferedCursor::from_documents(documents)))
    }

    async fn run_exec(&self, query: &Query, params: &[Value]) -> Result<u64> {
        ignore_params(params);

        let payload: WritePayload = serde_json::from_value(query.to_json()?).map_err(|e| {
            DataError::invalid_query(format!("Invalid Elasticsearch write payload: {}", e))
        })?;
        if !payload.document.is_object() {
            return Err(DataError::invalid_query("`document` must be an object"));
        }

        let request = match &payload.id {
            Some(id) => self.client.put(endpoint(
                &self.base_url,
                &[payload.index.as_str(), "_doc", id.as_str()],
            )?),
            None => self
                .client
                .post(endpoint(&self.base_url, &[payload.index.as_str(), "_doc"])?),
        };

        let response = self
            .request(request)
            .json(&payload.document)
            .send()
            .await
            .map_err(|e| http_error("index", e))?;
        self.check(response, "index").await?;

        debug!("Indexed one document into {}", payload.index);
        Ok(1)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_index_forms() {
        let search = parse_search(
            &Query::from(json!({"index": "logs", "query": {"match_all": {}}})),
            5,
        )
        .unwrap();
        assert_eq!(search.index.as_deref(), Some("logs"));
        assert_eq!(search.body["size"], json!(5));
        assert!(!search.body.contains_key("index"));

        let search = parse_search(&Query::from(json!({"index": ["a", "b"]})), 0).unwrap();
        assert_eq!(search.index.as_deref(), Some("a,b"));
        assert_eq!(search.body["size"], json!(10));

        let search = parse_search(&Query::from("{}"), 3).unwrap();
        assert!(search.index.is_none());
    }

    #[test]
    fn test_parse_search_rejects_bad_payloads() {
        assert!(matches!(
            parse_search(&Query::from(json!([1])), 1),
            Err(DataError::InvalidQuery(_))
        ));
        assert!(matches!(
            parse_search(&Query::from(json!({"index": 3})), 1),
            Err(DataError::InvalidQuery(_))
        ));
        assert!(matches!(
            parse_search(&Query::from("[1"), 1),
            Err(DataError::InvalidQuery(_))
        ));
        assert!(matches!(
            parse_search(&Query::from(json!({"count": "yes"})), 1),
            Err(DataError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_parse_search_sql_text() {
        let search =
            parse_search(&Query::from("SELECT level FROM \"logs\" WHERE code > 499"), 4).unwrap();
        assert_eq!(search.index.as_deref(), Some("logs"));
        assert_eq!(
            search.sql.as_deref(),
            Some("SELECT level FROM \"logs\" WHERE code > 499")
        );
        assert_eq!(search.body["size"], json!(4));

        let search = parse_search(
            &Query::from(json!({"index": "archive", "sql": "SELECT * FROM logs"})),
            1,
        )
        .unwrap();
        assert_eq!(search.index.as_deref(), Some("archive"));
        assert!(search.sql.is_some());
        assert!(!search.body.contains_key("sql"));
    }

    #[test]
    fn test_parse_search_count() {
        let search =
            parse_search(&Query::from(json!({"index": "logs", "count": true})), 5).unwrap();
        assert!(search.count);
        assert_eq!(search.body["size"], json!(0));
        assert_eq!(search.body["track_total_hits"], json!(true));
        assert!(!search.body.contains_key("count"));
    }

    #[test]
    fn test_sql_index() {
        assert_eq!(
            sql_index("select * from logs-2024 limit 5").as_deref(),
            Some("logs-2024")
        );
        assert_eq!(sql_index("SELECT * FROM `metrics`;").as_deref(), Some("metrics"));
        assert_eq!(sql_index("SHOW TABLES"), None);
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let base = Url::parse("http://es:9200").unwrap();
        let url = endpoint(&base, &["idx", "_doc", "a/b?refresh=true#x"]).unwrap();
        assert_eq!(url.path(), "/idx/_doc/a%2Fb%3Frefresh=true%23x");
        assert!(url.query().is_none());

        let base = Url::parse("http://es:9200/proxy").unwrap();
        let url = endpoint(&base, &["a,b", "_search"]).unwrap();
        assert_eq!(url.as_str(), "http://es:9200/proxy/a,b/_search");
    }

    #[test]
    fn test_config_defaults() {
        let config: ElasticsearchConfig =
            serde_json::from_value(json!({"addresses": ["http://es:9200"]})).unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert!(!config.accept_invalid_certs);

        let debug = format!("{:?}", config.with_basic_auth("elastic", "changeme"));
        assert!(!debug.contains("changeme"));
    }
}
