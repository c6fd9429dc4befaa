use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{AiopError, Result};

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn join_endpoint(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    format!("{base}/{endpoint}")
}

pub(crate) async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AiopError::Api { status, body });
    }
    Ok(response)
}

/// Connection settings for the backing store: its base URL and the public
/// (anon) API key every request carries.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub anon_key: String,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key: anon_key.into(),
        }
    }

    /// Reads `AIOP_URL` and `AIOP_ANON_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url = env_nonempty("AIOP_URL")
            .ok_or_else(|| AiopError::InvalidResponse("AIOP_URL is not set".to_string()))?;
        let anon_key = env_nonempty("AIOP_ANON_KEY")
            .ok_or_else(|| AiopError::InvalidResponse("AIOP_ANON_KEY is not set".to_string()))?;
        Ok(Self { base_url, anon_key })
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Typed wrapper over the backend's REST surface: row-level reads and writes
/// under `rest/v1`, stored procedures under `rest/v1/rpc`, and edge-function
/// dispatch under `functions/v1`.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: default_http_client(),
            base_url: config.base_url,
            anon_key: config.anon_key,
            access_token: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    /// Attaches a user session token; requests fall back to the anon key
    /// when none is attached.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.header("apikey", &self.anon_key);
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req.bearer_auth(&self.anon_key),
        }
    }

    fn table_url(&self, table: &str) -> String {
        join_endpoint(&self.base_url, &format!("rest/v1/{table}"))
    }

    pub fn select(&self, table: &str) -> SelectBuilder {
        SelectBuilder {
            client: self.clone(),
            table: table.to_string(),
            query: vec![("select".to_string(), "*".to_string())],
        }
    }

    /// Inserts one row and returns the stored representation.
    pub async fn insert<R: DeserializeOwned>(
        &self,
        table: &str,
        row: &impl Serialize,
    ) -> Result<R> {
        debug!(table, "insert row");
        let req = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(row);
        let response = error_for_status(self.apply_auth(req).send().await?).await?;
        let mut rows = response.json::<Vec<Value>>().await?;
        if rows.is_empty() {
            return Err(AiopError::InvalidResponse(format!(
                "insert into {table} returned no rows"
            )));
        }
        Ok(serde_json::from_value(rows.remove(0))?)
    }

    pub async fn update(
        &self,
        table: &str,
        filters: &Filters,
        patch: &impl Serialize,
    ) -> Result<()> {
        debug!(table, "update rows");
        let req = self
            .http
            .patch(self.table_url(table))
            .query(filters.as_pairs())
            .json(patch);
        error_for_status(self.apply_auth(req).send().await?).await?;
        Ok(())
    }

    /// Deleting rows that do not exist is a no-op, not an error.
    pub async fn delete(&self, table: &str, filters: &Filters) -> Result<()> {
        debug!(table, "delete rows");
        let req = self.http.delete(self.table_url(table)).query(filters.as_pairs());
        error_for_status(self.apply_auth(req).send().await?).await?;
        Ok(())
    }

    /// Calls a stored procedure. The procedure's logic is an external
    /// contract; this client only supplies arguments and parses the result.
    pub async fn rpc(&self, name: &str, args: Value) -> Result<Value> {
        debug!(rpc = name, "call stored procedure");
        let url = join_endpoint(&self.base_url, &format!("rest/v1/rpc/{name}"));
        let req = self.http.post(url).json(&args);
        let response = error_for_status(self.apply_auth(req).send().await?).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Fire-and-forget dispatch to an edge function (the outbound email
    /// side-channel). The caller decides whether a failure matters.
    pub async fn invoke_function(&self, name: &str, body: Value) -> Result<()> {
        debug!(function = name, "invoke edge function");
        let url = join_endpoint(&self.base_url, &format!("functions/v1/{name}"));
        let req = self.http.post(url).json(&body);
        error_for_status(self.apply_auth(req).send().await?).await?;
        Ok(())
    }
}

/// Row filters in the store's `column=op.value` query form.
#[derive(Debug, Clone, Default)]
pub struct Filters(Vec<(String, String)>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.0.push((column.to_string(), format!("eq.{}", value.to_string())));
        self
    }

    pub(crate) fn as_pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

/// Builder for row reads; terminal calls are [`fetch`](Self::fetch),
/// [`single`](Self::single) and [`maybe_single`](Self::maybe_single).
pub struct SelectBuilder {
    client: Client,
    table: String,
    query: Vec<(String, String)>,
}

impl SelectBuilder {
    pub fn columns(mut self, columns: &str) -> Self {
        if let Some(slot) = self.query.iter_mut().find(|(k, _)| k == "select") {
            slot.1 = columns.to_string();
        }
        self
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.query
            .push((column.to_string(), format!("eq.{}", value.to_string())));
        self
    }

    pub fn gt(mut self, column: &str, value: impl ToString) -> Self {
        self.query
            .push((column.to_string(), format!("gt.{}", value.to_string())));
        self
    }

    pub fn gte(mut self, column: &str, value: impl ToString) -> Self {
        self.query
            .push((column.to_string(), format!("gte.{}", value.to_string())));
        self
    }

    pub fn in_list<V: ToString>(mut self, column: &str, values: &[V]) -> Self {
        let joined = values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.query
            .push((column.to_string(), format!("in.({joined})")));
        self
    }

    pub fn order(mut self, column: &str, descending: bool) -> Self {
        let direction = if descending { "desc" } else { "asc" };
        self.query
            .push(("order".to_string(), format!("{column}.{direction}")));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.push(("limit".to_string(), limit.to_string()));
        self
    }

    pub async fn fetch<T: DeserializeOwned>(self) -> Result<Vec<T>> {
        debug!(table = %self.table, "select rows");
        let req = self
            .client
            .http
            .get(self.client.table_url(&self.table))
            .query(&self.query);
        let response = error_for_status(self.client.apply_auth(req).send().await?).await?;
        Ok(response.json::<Vec<T>>().await?)
    }

    /// Expects exactly one row; zero rows surface as an error whose
    /// [`is_no_rows`](crate::AiopError::is_no_rows) is true.
    pub async fn single<T: DeserializeOwned>(self) -> Result<T> {
        debug!(table = %self.table, "select single row");
        let req = self
            .client
            .http
            .get(self.client.table_url(&self.table))
            .header("Accept", "application/vnd.pgrst.object+json")
            .query(&self.query);
        let response = error_for_status(self.client.apply_auth(req).send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn maybe_single<T: DeserializeOwned>(self) -> Result<Option<T>> {
        match self.single::<T>().await {
            Ok(row) => Ok(Some(row)),
            Err(err) if err.is_no_rows() => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[cfg(test)]
    pub(crate) fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }
}
