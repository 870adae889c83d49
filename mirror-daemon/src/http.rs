//! ftrack JSON API adapter.
//!
//! Every call is one `POST {server}/api` carrying a JSON array of operations;
//! the server runs them in a single transaction. `ureq` is blocking, so each
//! call runs on the blocking pool.
//!
//! There is no push channel: [`subscribe`](FtrackHttpAdapter::subscribe)
//! polls each kind for entities newer than a watermark and emits them as
//! `add` events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use mirror_core::config::{Credentials, PollSettings};
use mirror_core::{
    Action, Entity, EntityId, EntityKind, EntityRef, Event, Fields, Filter, RemoteAdapter,
    RemoteError, Side,
};

const EVENT_BUFFER: usize = 256;
const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const MAX_LOOKBACK_SECS: u64 = 7 * 24 * 60 * 60;

pub struct FtrackHttpAdapter {
    client: Arc<HttpClient>,
    poll: PollSettings,
}

struct HttpClient {
    side: Side,
    endpoint: String,
    api_user: String,
    api_key: String,
    agent: ureq::Agent,
}

impl FtrackHttpAdapter {
    pub fn new(
        side: Side,
        credentials: Credentials,
        timeout: Duration,
        poll: PollSettings,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            client: Arc::new(HttpClient {
                side,
                endpoint: format!("{}/api", credentials.url),
                api_user: credentials.api_user,
                api_key: credentials.api_key,
                agent,
            }),
            poll,
        }
    }

    async fn call(
        &self,
        kind: EntityKind,
        operations: Vec<Value>,
    ) -> Result<Vec<Value>, RemoteError> {
        self.client.clone().call_async(kind, operations).await
    }
}

impl HttpClient {
    async fn call_async(
        self: Arc<Self>,
        kind: EntityKind,
        operations: Vec<Value>,
    ) -> Result<Vec<Value>, RemoteError> {
        let side = self.side;
        tokio::task::spawn_blocking(move || self.call(kind, &operations))
            .await
            .map_err(|err| RemoteError::Transient {
                server: side,
                message: format!("request task failed: {err}"),
            })?
    }

    fn call(&self, kind: EntityKind, operations: &[Value]) -> Result<Vec<Value>, RemoteError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("ftrack-user", &self.api_user)
            .set("ftrack-api-key", &self.api_key)
            .set("Accept", "application/json")
            .send_json(Value::Array(operations.to_vec()));

        let body: Value = match response {
            Ok(response) => response.into_json().map_err(|err| RemoteError::Decode {
                server: self.side,
                message: format!("invalid response body: {err}"),
            })?,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(status_error(self.side, kind, code, &body));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(RemoteError::Transient {
                    server: self.side,
                    message: transport.to_string(),
                })
            }
        };
        decode_results(self.side, kind, body, operations.len())
    }
}

#[async_trait]
impl RemoteAdapter for FtrackHttpAdapter {
    fn side(&self) -> Side {
        self.client.side
    }

    async fn query(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Entity>, RemoteError> {
        let expression = query_expression(kind, filter);
        tracing::trace!(server = %self.side(), %expression, "query");
        let results = self
            .call(kind, vec![json!({"action": "query", "expression": expression})])
            .await?;
        let data = results
            .into_iter()
            .next()
            .and_then(|mut r| r.get_mut("data").map(Value::take))
            .unwrap_or(Value::Array(Vec::new()));
        match data {
            Value::Array(rows) => rows
                .into_iter()
                .map(|row| decode_entity(self.side(), kind, row))
                .collect(),
            other => Err(RemoteError::Decode {
                server: self.side(),
                message: format!("query data is not a list: {other}"),
            }),
        }
    }

    async fn create(&self, kind: EntityKind, fields: Fields) -> Result<Entity, RemoteError> {
        let mut created = self.create_batch(kind, vec![fields]).await?;
        created.pop().ok_or_else(|| RemoteError::Decode {
            server: self.side(),
            message: "create returned no entity".to_string(),
        })
    }

    async fn create_batch(
        &self,
        kind: EntityKind,
        batch: Vec<Fields>,
    ) -> Result<Vec<Entity>, RemoteError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let operations = batch
            .into_iter()
            .map(|fields| {
                json!({
                    "action": "create",
                    "entity_type": kind.ftrack_type(),
                    "entity_data": encode_fields(kind, fields),
                })
            })
            .collect();
        self.call(kind, operations)
            .await?
            .into_iter()
            .map(|mut result| {
                let data = result.get_mut("data").map(Value::take).unwrap_or(Value::Null);
                decode_entity(self.side(), kind, data)
            })
            .collect()
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        fields: Fields,
    ) -> Result<Entity, RemoteError> {
        let operation = json!({
            "action": "update",
            "entity_type": kind.ftrack_type(),
            "entity_key": [id.0],
            "entity_data": encode_fields(kind, fields),
        });
        let mut results = self.call(kind, vec![operation]).await?;
        let data = results
            .pop()
            .and_then(|mut r| r.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null);
        decode_entity(self.side(), kind, data)
    }

    async fn subscribe(&self, kinds: &[EntityKind]) -> Result<mpsc::Receiver<Event>, RemoteError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let lookback = self.poll.lookback_secs.min(MAX_LOOKBACK_SECS);
        let start = Utc::now() - chrono::Duration::seconds(lookback as i64);
        let poller = Poller {
            client: self.client.clone(),
            kinds: kinds.iter().map(|k| (*k, Watermark::new(start))).collect(),
            interval: self.poll.interval(),
        };
        tokio::spawn(poller.run(tx));
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Polling subscription
// ---------------------------------------------------------------------------

struct Poller {
    client: Arc<HttpClient>,
    kinds: Vec<(EntityKind, Watermark)>,
    interval: Duration,
}

impl Poller {
    async fn run(mut self, tx: mpsc::Sender<Event>) {
        let side = self.client.side;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(server = %side, kinds = self.kinds.len(), "polling for new entities");

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            for (kind, watermark) in &mut self.kinds {
                let expression = watermark.expression(*kind);
                let operation = json!({"action": "query", "expression": expression});
                let rows = match self.client.clone().call_async(*kind, vec![operation]).await {
                    Ok(mut results) => results
                        .pop()
                        .and_then(|mut r| r.get_mut("data").map(Value::take))
                        .unwrap_or(Value::Null),
                    Err(err) => {
                        tracing::warn!(server = %side, kind = %kind, error = %err, "poll failed");
                        continue;
                    }
                };
                let Value::Array(rows) = rows else { continue };
                for row in rows {
                    let entity = match decode_entity(side, *kind, row) {
                        Ok(entity) => entity,
                        Err(err) => {
                            tracing::warn!(
                                server = %side,
                                kind = %kind,
                                error = %err,
                                "skipping undecodable row",
                            );
                            continue;
                        }
                    };
                    if !watermark.admit(&entity) {
                        continue;
                    }
                    if tx.send(event_for(side, entity)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Highest creation time seen for one kind, plus the ids seen at exactly
/// that time (the next poll uses `>=` and would return them again).
#[derive(Debug, Clone)]
struct Watermark {
    at: DateTime<Utc>,
    seen_at_mark: HashSet<EntityId>,
}

impl Watermark {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            seen_at_mark: HashSet::new(),
        }
    }

    fn expression(&self, kind: EntityKind) -> String {
        let mut expression = format!(
            "select {} from {} where {} >= \"{}\"",
            projection(kind).join(", "),
            kind.ftrack_type(),
            created_attribute(kind),
            self.at.format(QUERY_TIME_FORMAT),
        );
        expression.push_str(&format!(" order by {}", created_attribute(kind)));
        expression
    }

    /// Whether `entity` is new, advancing the mark when it is.
    fn admit(&mut self, entity: &Entity) -> bool {
        let Some(created) = entity.timestamp_field(created_attribute(entity.kind)) else {
            return false;
        };
        if created < self.at {
            return false;
        }
        if created > self.at {
            self.at = created;
            self.seen_at_mark.clear();
        }
        self.seen_at_mark.insert(entity.id.clone())
    }
}

fn event_for(side: Side, entity: Entity) -> Event {
    let parent = entity.id_field("parent_id").map(|parent_id| {
        let kind = entity
            .str_field("parent_type")
            .and_then(EntityKind::from_ftrack_type)
            .unwrap_or(EntityKind::Context);
        EntityRef::new(side, kind, parent_id)
    });
    let timestamp = entity
        .timestamp_field(created_attribute(entity.kind))
        .unwrap_or_else(Utc::now);
    Event {
        action: Action::Add,
        entity: entity.to_ref(side),
        parent,
        timestamp,
        payload: Value::Object(entity.fields.into_iter().collect()),
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Attributes fetched for each kind.
fn projection(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Project => &["id", "name", "full_name"],
        EntityKind::Context | EntityKind::Shot => {
            &["id", "name", "parent_id", "project_id", "created_at"]
        }
        EntityKind::Task => &["id", "name", "parent_id", "project_id", "type_id", "created_at"],
        EntityKind::Asset => &["id", "name", "context_id", "type_id"],
        EntityKind::Version => &[
            "id",
            "asset_id",
            "task_id",
            "version",
            "comment",
            "date",
            "user_id",
            "custom_attributes",
        ],
        EntityKind::Note => &["id", "content", "parent_id", "parent_type", "user_id", "date"],
        EntityKind::User => &["id", "username"],
        EntityKind::TaskType | EntityKind::AssetType => &["id", "name"],
    }
}

fn created_attribute(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Note | EntityKind::Version => "date",
        _ => "created_at",
    }
}

/// Server attribute path for a field name used by the engine.
fn remote_attribute(kind: EntityKind, field: &str) -> &str {
    match (kind, field) {
        (EntityKind::Asset, "parent_id") => "context_id",
        (EntityKind::Asset, "project_id") => "project.id",
        _ => field,
    }
}

/// Escape a value for a double-quoted expression literal.
pub fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `select <projection> from <Type> [where a is "b" and ...]`.
pub fn query_expression(kind: EntityKind, filter: &Filter) -> String {
    let mut expression = format!(
        "select {} from {}",
        projection(kind).join(", "),
        kind.ftrack_type()
    );
    let clauses: Vec<String> = filter
        .clauses()
        .iter()
        .map(|(field, value)| {
            let attribute = remote_attribute(kind, field);
            match value {
                Value::Null => format!("{attribute} is None"),
                Value::Bool(b) => format!("{attribute} is {}", if *b { "True" } else { "False" }),
                Value::Number(n) => format!("{attribute} is {n}"),
                Value::String(s) => format!("{attribute} is \"{}\"", escape(s)),
                other => format!("{attribute} is \"{}\"", escape(&other.to_string())),
            }
        })
        .collect();
    if !clauses.is_empty() {
        expression.push_str(" where ");
        expression.push_str(&clauses.join(" and "));
    }
    expression
}

// ---------------------------------------------------------------------------
// Payload codec
// ---------------------------------------------------------------------------

fn encode_fields(kind: EntityKind, fields: Fields) -> Value {
    let mut data = Map::new();
    for (key, value) in fields {
        match (kind, key.as_str()) {
            (EntityKind::Asset, "project_id") => {}
            (EntityKind::Asset, "parent_id") => {
                data.insert("context_id".to_string(), value);
            }
            _ => {
                data.insert(key, value);
            }
        }
    }
    Value::Object(data)
}

fn decode_entity(side: Side, kind: EntityKind, row: Value) -> Result<Entity, RemoteError> {
    let Value::Object(row) = row else {
        return Err(RemoteError::Decode {
            server: side,
            message: format!("{kind} row is not an object"),
        });
    };
    let mut id = None;
    let mut fields = Fields::new();
    for (key, value) in row {
        match key.as_str() {
            "id" => id = value.as_str().map(EntityId::from),
            "__entity_type__" => {}
            "custom_attributes" => {
                fields.insert(key, decode_custom_attributes(value));
            }
            _ => {
                fields.insert(key, decode_value(value));
            }
        }
    }
    if kind == EntityKind::Asset {
        if let Some(context) = fields.get("context_id").cloned() {
            fields.insert("parent_id".to_string(), context);
        }
    }
    let id = id.ok_or_else(|| RemoteError::Decode {
        server: side,
        message: format!("{kind} row has no id"),
    })?;
    Ok(Entity::new(kind, id, fields))
}

/// Unwrap `{"__type__": "datetime", "value": ...}` into an RFC 3339 string.
fn decode_value(value: Value) -> Value {
    match &value {
        Value::Object(map) if map.get("__type__").and_then(Value::as_str) == Some("datetime") => map
            .get("value")
            .and_then(Value::as_str)
            .and_then(parse_server_time)
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => value,
    }
}

fn parse_server_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
}

/// `[{"key": k, "value": v}, ...]` or a plain map, as a map.
fn decode_custom_attributes(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Object(
            items
                .into_iter()
                .filter_map(|item| {
                    let key = item.get("key")?.as_str()?.to_string();
                    Some((key, item.get("value").cloned().unwrap_or(Value::Null)))
                })
                .collect(),
        ),
        other => other,
    }
}

fn decode_results(
    side: Side,
    kind: EntityKind,
    body: Value,
    expected: usize,
) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(results) if results.len() == expected => Ok(results),
        Value::Array(results) => Err(RemoteError::Decode {
            server: side,
            message: format!("expected {expected} results, got {}", results.len()),
        }),
        Value::Object(map) if map.contains_key("exception") => {
            let exception = map.get("exception").and_then(Value::as_str).unwrap_or("ServerError");
            let content = map.get("content").and_then(Value::as_str).unwrap_or_default();
            Err(exception_error(side, kind, exception, content))
        }
        other => Err(RemoteError::Decode {
            server: side,
            message: format!("unexpected response: {other}"),
        }),
    }
}

fn exception_error(side: Side, kind: EntityKind, exception: &str, content: &str) -> RemoteError {
    let message = format!("{exception}: {content}");
    let lowered = message.to_lowercase();
    if lowered.contains("integrity")
        || lowered.contains("duplicate")
        || lowered.contains("unique")
    {
        RemoteError::Conflict {
            server: side,
            kind,
            message,
        }
    } else {
        RemoteError::Rejected {
            server: side,
            kind,
            message,
        }
    }
}

/// 5xx, 408 and 429 are worth retrying; 409 means a uniqueness race.
fn status_error(side: Side, kind: EntityKind, code: u16, body: &str) -> RemoteError {
    let message = format!("HTTP {code}: {}", body.trim());
    match code {
        409 => RemoteError::Conflict {
            server: side,
            kind,
            message,
        },
        408 | 429 | 500..=599 => RemoteError::Transient {
            server: side,
            message,
        },
        _ => {
            let parsed = serde_json::from_str::<Value>(body).ok();
            let exception = parsed
                .as_ref()
                .and_then(|v| v.get("exception"))
                .and_then(Value::as_str);
            match exception {
                Some(exception) => {
                    let content = parsed
                        .as_ref()
                        .and_then(|v| v.get("content"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    exception_error(side, kind, exception, content)
                }
                None => RemoteError::Rejected {
                    server: side,
                    kind,
                    message,
                },
            }
        }
    }
}
