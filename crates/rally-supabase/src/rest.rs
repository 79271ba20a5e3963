//! PostgREST query/write client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{AuthClient, Filter, Query, Row, SupabaseError};

/// Query/write access to the relational store.
///
/// Expected failures (validation, permission, not-found, network) are
/// returned as `Err` values.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Run a select query.
    async fn select(&self, query: &Query) -> Result<Vec<Row>, SupabaseError>;

    /// Insert a row and return the stored representation.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, SupabaseError>;

    /// Patch the row with the given id and return the stored representation.
    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, SupabaseError>;

    /// Delete every row matching all filters.
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), SupabaseError>;

    /// Delete the row with the given id.
    async fn delete_by_id(&self, table: &str, id: &str) -> Result<(), SupabaseError> {
        self.delete(table, &[Filter::eq("id", id)]).await
    }
}

/// Number of attempts for a request: initial + 3 retries with backoff.
const MAX_ATTEMPTS: u32 = 4;

/// PostgREST client authenticated through an [`AuthClient`].
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    auth: AuthClient,
}

impl RestClient {
    /// Create a new client for the given project URL.
    pub fn new(base_url: impl Into<String>, auth: AuthClient) -> Result<Self, SupabaseError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        })
    }

    /// The auth client used for bearer tokens.
    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Send a request with retries for transient failures and one automatic
    /// session refresh on an expired token.
    async fn execute<T, F>(&self, op: &str, build: F) -> Result<T, SupabaseError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut refreshed = false;
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            let token = self.auth.bearer().await?;

            let result = match build(&self.http)
                .header("apikey", self.auth.anon_key())
                .bearer_auth(&token)
                .send()
                .await
            {
                Ok(response) => handle_response(response).await,
                Err(e) => Err(SupabaseError::Http(e)),
            };

            match result {
                Ok(v) => return Ok(v),
                Err(ref e) if e.is_expired_token() && !refreshed => {
                    refreshed = true;
                    if self.auth.try_refresh().await {
                        continue;
                    }
                    return result;
                }
                Err(ref e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error in {}, retrying",
                        op
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    last_error = Some(result);
                    continue;
                }
                Err(_) => return result,
            }
        }

        last_error.unwrap_or_else(|| Err(SupabaseError::InvalidResponse("retry exhausted".into())))
    }
}

#[async_trait]
impl DataStore for RestClient {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, SupabaseError> {
        let url = self.table_url(&query.table);
        let pairs = query.to_query_pairs();
        debug!(table = %query.table, filters = query.filters.len(), "select");

        self.execute("select", |http| http.get(&url).query(&pairs))
            .await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, SupabaseError> {
        let url = self.table_url(table);
        debug!(table = %table, "insert");

        let rows: Vec<Row> = self
            .execute("insert", |http| {
                http.post(&url)
                    .header("Prefer", "return=representation")
                    .json(&row)
            })
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| SupabaseError::InvalidResponse("insert returned no rows".into()))
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, SupabaseError> {
        let url = self.table_url(table);
        let (column, value) = Filter::eq("id", id).to_query_pair();
        debug!(table = %table, id = %id, fields = patch.len(), "update");

        let rows: Vec<Row> = self
            .execute("update", |http| {
                http.patch(&url)
                    .query(&[(column.as_str(), value.as_str())])
                    .header("Prefer", "return=representation")
                    .json(&patch)
            })
            .await?;

        rows.into_iter().next().ok_or_else(|| SupabaseError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), SupabaseError> {
        // PostgREST refuses unfiltered deletes; refuse them locally as well.
        if filters.is_empty() {
            return Err(SupabaseError::InvalidResponse(format!(
                "refusing unfiltered delete on {}",
                table
            )));
        }

        let url = self.table_url(table);
        let pairs: Vec<(String, String)> = filters.iter().map(Filter::to_query_pair).collect();
        debug!(table = %table, filters = filters.len(), "delete");

        let _: serde_json::Value = self
            .execute("delete", |http| {
                http.delete(&url)
                    .query(&pairs)
                    .header("Prefer", "return=minimal")
            })
            .await?;
        Ok(())
    }
}

/// PostgREST error response format.
#[derive(Debug, serde::Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SupabaseError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        return Err(SupabaseError::RateLimited { retry_after_secs });
    }

    let text = response.text().await.map_err(|e| {
        SupabaseError::InvalidResponse(format!(
            "request failed ({}): failed to read response: {}",
            status, e
        ))
    })?;

    if !status.is_success() {
        if let Ok(err) = serde_json::from_str::<PostgrestError>(&text) {
            return Err(SupabaseError::Postgrest {
                status: status.as_u16(),
                code: err.code.unwrap_or_default(),
                message: err.message,
            });
        }

        return Err(SupabaseError::InvalidResponse(format!(
            "request failed ({}): {}",
            status, text
        )));
    }

    // `return=minimal` responses have an empty body.
    let body = if text.trim().is_empty() { "null" } else { &text };
    Ok(serde_json::from_str(body)?)
}
