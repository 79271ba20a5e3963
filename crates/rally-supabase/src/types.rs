//! Core types shared by the REST, auth and realtime clients.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row as delivered by PostgREST or the realtime feed.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Default Postgres schema for tables and change feeds.
pub const DEFAULT_SCHEMA: &str = "public";

/// Comparison operator for a column filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }
}

impl FromStr for FilterOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(FilterOp::Eq),
            "neq" => Ok(FilterOp::Neq),
            "gt" => Ok(FilterOp::Gt),
            "gte" => Ok(FilterOp::Gte),
            "lt" => Ok(FilterOp::Lt),
            "lte" => Ok(FilterOp::Lte),
            "in" => Ok(FilterOp::In),
            other => Err(format!("unknown filter operator '{}'", other)),
        }
    }
}

/// A single column filter, e.g. `user_id=eq.42`.
///
/// The same textual form is understood by PostgREST query strings and by the
/// realtime `postgres_changes` filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    /// PostgREST query pair: `("user_id", "eq.42")`.
    pub fn to_query_pair(&self) -> (String, String) {
        let value = match self.op {
            FilterOp::In => format!("in.({})", self.value),
            op => format!("{}.{}", op.as_str(), self.value),
        };
        (self.column.clone(), value)
    }

    /// Check whether a row satisfies this filter.
    ///
    /// Missing columns never match. Ordering operators compare numerically
    /// when both sides parse as numbers and lexically otherwise.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(&self.column).map(value_as_text) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => actual == self.value,
            FilterOp::Neq => actual != self.value,
            FilterOp::In => self.value.split(',').any(|v| v.trim() == actual),
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let ordering = match (actual.parse::<f64>(), self.value.parse::<f64>()) {
                    (Ok(a), Ok(b)) => a.partial_cmp(&b),
                    _ => Some(actual.as_str().cmp(self.value.as_str())),
                };
                let Some(ordering) = ordering else {
                    return false;
                };
                match self.op {
                    FilterOp::Gt => ordering.is_gt(),
                    FilterOp::Gte => ordering.is_ge(),
                    FilterOp::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            FilterOp::In => write!(f, "{}=in.({})", self.column, self.value),
            op => write!(f, "{}={}.{}", self.column, op.as_str(), self.value),
        }
    }
}

impl FromStr for Filter {
    type Err = String;

    /// Parse `column=op.value`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("filter '{}' is missing '='", s))?;
        let (op, value) = rest
            .split_once('.')
            .ok_or_else(|| format!("filter '{}' is missing an operator", s))?;
        let op: FilterOp = op.parse()?;
        let value = match op {
            FilterOp::In => value.trim_start_matches('(').trim_end_matches(')'),
            _ => value,
        };
        if column.is_empty() {
            return Err(format!("filter '{}' has an empty column", s));
        }
        Ok(Filter::new(column, op, value))
    }
}

/// Textual form of a JSON value as used in filter comparisons.
pub fn value_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Sort direction for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A `select` query against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    /// Start a `select *` query on a table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending: true,
        });
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending: false,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// PostgREST query-string parameters for this query.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), self.columns.clone())];
        pairs.extend(self.filters.iter().map(Filter::to_query_pair));
        if let Some(order) = &self.order {
            let dir = if order.ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", order.column, dir)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

/// Kind of row change delivered by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which change kinds a channel listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Only(kind) => kind.as_str(),
        }
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(k) => *k == kind,
        }
    }
}

/// A row change pushed by the server.
///
/// `new` is present for inserts and updates. `old` is partial: for updates
/// and deletes it usually only carries the primary key unless the table has
/// full replica identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            new: Some(new),
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn update(table: impl Into<String>, new: Row, old: Option<Row>) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            new: Some(new),
            old,
            commit_timestamp: None,
        }
    }

    pub fn delete(table: impl Into<String>, old: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
            commit_timestamp: None,
        }
    }

    /// The row the event is "about": `new` when present, else `old`.
    pub fn record(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// What a realtime channel subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<Filter>,
}

impl ChannelSpec {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            event: EventFilter::All,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    /// Whether a change event falls within this channel's scope.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.event.accepts(event.kind) {
            return false;
        }
        match (&self.filter, event.record()) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

/// Status of one realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Join sent, waiting for the server's reply.
    Joining,
    /// Server acknowledged the join; events will flow.
    Joined,
    /// Server refused the join or reported a channel error.
    Errored(String),
    /// Channel was removed.
    Closed,
}

/// Health of the realtime socket as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Socket dropped or a heartbeat went unanswered; a reconnect is pending.
    Disconnected,
    /// Client shut down.
    Closed,
}

/// Authenticated user as returned by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Session token bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds) after which the access token is invalid.
    pub expires_at: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    pub user: User,
}

impl Session {
    /// A session is expired once `expires_at <= now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Auth state transitions, delivered to `on_auth_state_change` subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}
