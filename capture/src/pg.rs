//! PostgreSQL logical-replication capture: the pgoutput v2 protocol over a
//! `replication=database` connection, plus a poll of the DDL-capture-trigger
//! log table, per spec.md §4.5.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use chrono::{TimeZone, Utc};
use common::retry::Backoff;
use futures::{SinkExt, StreamExt};
use kasho_model::{Change, ColumnValue, DdlChange, DmlChange, DmlKind, KeyValues, Payload};
use kasho_position::Position;
use tokio::sync::mpsc;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::{Client, Config, CopyBothDuplex, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::{Capture, CurrentPosition};

/// Microseconds between the Unix epoch and 2000-01-01, pgoutput's epoch for
/// every timestamp it sends.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

#[derive(Debug, Clone)]
struct ColumnMeta {
    name: String,
    type_oid: u32,
    is_key: bool,
}

#[derive(Debug, Clone)]
struct Relation {
    namespace: String,
    name: String,
    columns: Vec<ColumnMeta>,
}

impl Relation {
    fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    fn is_ddl_log(&self, ddl_log_table: &str) -> bool {
        self.name == ddl_log_table
    }
}

pub struct PgCapture {
    primary_url: String,
    slot_name: String,
    publication_name: String,
    ddl_log_table: String,
    position: CurrentPosition,
    relations: HashMap<u32, Relation>,
    stream: Option<CopyBothDuplex<Bytes>>,
    backoff: Backoff,
}

impl PgCapture {
    pub fn new(primary_url: impl Into<String>, slot_name: impl Into<String>, publication_name: impl Into<String>) -> Self {
        Self::with_ddl_log_table(primary_url, slot_name, publication_name, "kasho_ddl_log")
    }

    pub fn with_ddl_log_table(
        primary_url: impl Into<String>,
        slot_name: impl Into<String>,
        publication_name: impl Into<String>,
        ddl_log_table: impl Into<String>,
    ) -> Self {
        Self {
            primary_url: primary_url.into(),
            slot_name: slot_name.into(),
            publication_name: publication_name.into(),
            ddl_log_table: ddl_log_table.into(),
            position: CurrentPosition::new(Position::Pg(0)),
            relations: HashMap::new(),
            stream: None,
            backoff: Backoff::uncapped(),
        }
    }

    async fn verify_slot_exists(&self) -> Result<(), CaptureError> {
        let (client, connection) = tokio_postgres::connect(&self.primary_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres verification connection closed with error");
            }
        });
        let row = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot_name],
            )
            .await?;
        if row.is_none() {
            return Err(CaptureError::MissingSlot(self.slot_name.clone()));
        }
        Ok(())
    }

    async fn open_replication_stream(&mut self) -> Result<(), CaptureError> {
        let mut config: Config = self.primary_url.parse()?;
        config.replication_mode(ReplicationMode::Logical);
        let (client, connection): (Client, _) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres replication connection closed with error");
            }
        });
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL 0/0 (proto_version '2', publication_names '{}')",
            self.slot_name, self.publication_name
        );
        let stream = client.copy_both_simple::<Bytes>(&query).await?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Sends `(WALWritePosition, WALFlush, WALApply) = slotLSN` every 10s,
    /// per spec §4.5.
    async fn send_standby_status_update(&mut self) -> Result<(), CaptureError> {
        let lsn: u64 = match self.position.get().await {
            Position::Pg(value) => value,
            other => {
                warn!(position = ?other, "unexpected non-PG position in standby status update");
                0
            }
        };
        let mut body = Vec::with_capacity(34);
        body.push(b'r');
        body.extend_from_slice(&lsn.to_be_bytes());
        body.extend_from_slice(&lsn.to_be_bytes());
        body.extend_from_slice(&lsn.to_be_bytes());
        body.extend_from_slice(&pg_epoch_micros(Utc::now()).to_be_bytes());
        body.push(0);
        if let Some(stream) = self.stream.as_mut() {
            stream.send(Bytes::from(body)).await?;
        }
        Ok(())
    }

    fn decode_pgoutput(&mut self, mut payload: Bytes, position: &str) -> Result<Option<Change>, CaptureError> {
        if payload.is_empty() {
            return Ok(None);
        }
        let tag = payload.get_u8();
        match tag {
            b'B' | b'C' | b'O' | b'T' | b'M' => Ok(None),
            b'R' => {
                self.decode_relation(payload)?;
                Ok(None)
            }
            b'I' => self.decode_insert(payload, position).map(Some),
            b'U' => self.decode_update(payload, position).map(Some),
            b'D' => self.decode_delete(payload, position).map(Some),
            other => Err(CaptureError::MalformedFrame(format!(
                "unrecognized pgoutput message tag: {other:#x}"
            ))),
        }
    }

    fn decode_relation(&mut self, mut buf: Bytes) -> Result<(), CaptureError> {
        let id = buf.get_u32();
        let namespace = read_cstr(&mut buf)?;
        let name = read_cstr(&mut buf)?;
        let _replica_identity = buf.get_u8();
        let column_count = buf.get_u16();
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let flags = buf.get_u8();
            let col_name = read_cstr(&mut buf)?;
            let type_oid = buf.get_u32();
            let _atttypmod = buf.get_i32();
            columns.push(ColumnMeta {
                name: col_name,
                type_oid,
                is_key: flags & 0x1 != 0,
            });
        }
        self.relations.insert(id, Relation { namespace, name, columns });
        Ok(())
    }

    fn decode_insert(&self, mut buf: Bytes, position: &str) -> Result<Change, CaptureError> {
        let relation_id = buf.get_u32();
        let relation = self.relation(relation_id)?;
        let _tuple_tag = buf.get_u8();
        let (names, values) = decode_tuple(&mut buf, relation)?;

        if relation.is_ddl_log(&self.ddl_log_table) {
            return ddl_change_from_row(&names, &values, position);
        }

        let change = DmlChange {
            table: relation.qualified_name(),
            kind: DmlKind::Insert,
            column_names: names,
            column_values: values,
            old_keys: None,
        };
        change.validate()?;
        Ok(Change::new(position, Payload::Dml(change)))
    }

    fn decode_update(&self, mut buf: Bytes, position: &str) -> Result<Change, CaptureError> {
        let relation_id = buf.get_u32();
        let relation = self.relation(relation_id)?;

        let mut old_keys = None;
        let next_tag = buf.get_u8();
        if next_tag == b'K' || next_tag == b'O' {
            let (old_names, old_values) = decode_tuple(&mut buf, relation)?;
            old_keys = Some(key_values_from_row(relation, &old_names, &old_values));
            let _new_tuple_tag = buf.get_u8();
        }
        let (names, values) = decode_tuple(&mut buf, relation)?;

        let old_keys = old_keys.unwrap_or_else(|| key_values_from_row(relation, &names, &values));
        let change = DmlChange {
            table: relation.qualified_name(),
            kind: DmlKind::Update,
            column_names: names,
            column_values: values,
            old_keys: Some(old_keys),
        };
        change.validate()?;
        Ok(Change::new(position, Payload::Dml(change)))
    }

    fn decode_delete(&self, mut buf: Bytes, position: &str) -> Result<Change, CaptureError> {
        let relation_id = buf.get_u32();
        let relation = self.relation(relation_id)?;
        let _tuple_tag = buf.get_u8();
        let (names, values) = decode_tuple(&mut buf, relation)?;
        let old_keys = key_values_from_row(relation, &names, &values);
        let change = DmlChange {
            table: relation.qualified_name(),
            kind: DmlKind::Delete,
            column_names: vec![],
            column_values: vec![],
            old_keys: Some(old_keys),
        };
        change.validate()?;
        Ok(Change::new(position, Payload::Dml(change)))
    }

    fn relation(&self, id: u32) -> Result<&Relation, CaptureError> {
        self.relations
            .get(&id)
            .ok_or_else(|| CaptureError::UnknownRelation(format!("relation oid {id}")))
    }
}

fn read_cstr(buf: &mut Bytes) -> Result<String, CaptureError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CaptureError::MalformedFrame("unterminated string in pgoutput message".to_string()))?;
    let bytes = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CaptureError::MalformedFrame(format!("invalid utf8 in pgoutput message: {e}")))
}

fn decode_tuple(buf: &mut Bytes, relation: &Relation) -> Result<(Vec<String>, Vec<ColumnValue>), CaptureError> {
    let count = buf.get_u16() as usize;
    let mut names = Vec::with_capacity(count);
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let column = relation.columns.get(i).ok_or_else(|| {
            CaptureError::MalformedFrame(format!(
                "tuple has more columns than relation {} declares",
                relation.qualified_name()
            ))
        })?;
        let kind = buf.get_u8();
        let value = match kind {
            b'n' => ColumnValue::Null,
            b'u' => ColumnValue::Null, // TOASTed, unchanged value: not supplied on the wire.
            b't' => {
                let len = buf.get_u32() as usize;
                let text = buf.split_to(len);
                let text = String::from_utf8(text.to_vec())
                    .map_err(|e| CaptureError::MalformedFrame(format!("invalid utf8 column text: {e}")))?;
                decode_text_value(column.type_oid, &text)
            }
            other => {
                return Err(CaptureError::MalformedFrame(format!(
                    "unrecognized tuple column kind: {other:#x}"
                )))
            }
        };
        names.push(column.name.clone());
        values.push(value);
    }
    Ok((names, values))
}

/// Maps a column's text-encoded value per its PG type oid, per spec §4.5:
/// int2/4/8, float4/8, bool, date, timestamp; everything else (text,
/// varchar, ...) defaults to string.
fn decode_text_value(type_oid: u32, text: &str) -> ColumnValue {
    match type_oid {
        16 => ColumnValue::Bool(text == "t"),
        20 | 21 | 23 => text
            .parse::<i64>()
            .map(ColumnValue::Int64)
            .unwrap_or_else(|_| ColumnValue::String(text.to_string())),
        700 | 701 => text
            .parse::<f64>()
            .map(ColumnValue::Float64)
            .unwrap_or_else(|_| ColumnValue::String(text.to_string())),
        1082 | 1114 | 1184 => ColumnValue::Timestamp(text.to_string()),
        _ => ColumnValue::String(text.to_string()),
    }
}

/// Picks the primary-key columns of the pre-image row, falling back to the
/// full row when the relation has none flagged (`REPLICA IDENTITY FULL`, or
/// no primary key at all) — matching the MySQL capture's same fallback and
/// spec §3's "key names, key values ... or full row if the engine supplies
/// it" for delete pre-images.
fn key_values_from_row(relation: &Relation, names: &[String], values: &[ColumnValue]) -> KeyValues {
    let key_columns: Vec<&str> = relation
        .columns
        .iter()
        .filter(|c| c.is_key)
        .map(|c| c.name.as_str())
        .collect();
    if key_columns.is_empty() {
        return KeyValues {
            key_names: names.to_vec(),
            key_values: values.to_vec(),
        };
    }
    let mut key_names = Vec::new();
    let mut key_values = Vec::new();
    for (name, value) in names.iter().zip(values.iter()) {
        if key_columns.contains(&name.as_str()) {
            key_names.push(name.clone());
            key_values.push(value.clone());
        }
    }
    KeyValues { key_names, key_values }
}

/// The DDL-capture-trigger row carries `id, time, username, database, ddl`
/// columns (spec §4.2/§4.5); re-emitted as a `DdlChange` rather than a DML
/// insert against the caller-visible table.
fn ddl_change_from_row(names: &[String], values: &[ColumnValue], position: &str) -> Result<Change, CaptureError> {
    let mut lookup: HashMap<&str, &ColumnValue> = HashMap::new();
    for (name, value) in names.iter().zip(values.iter()) {
        lookup.insert(name.as_str(), value);
    }
    let text_of = |key: &str| lookup.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());
    let ddl = DdlChange {
        id: lookup.get("id").and_then(|v| match v {
            ColumnValue::Int64(i) => Some(*i),
            _ => None,
        }),
        time: text_of("time").unwrap_or_else(|| Utc::now().to_rfc3339()),
        username: text_of("username"),
        database: text_of("database").unwrap_or_default(),
        ddl: text_of("ddl").unwrap_or_default(),
    };
    Ok(Change::new(position, Payload::Ddl(ddl)))
}

fn pg_epoch_micros(now: chrono::DateTime<Utc>) -> i64 {
    now.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

#[async_trait]
impl Capture for PgCapture {
    async fn connect(&mut self) -> Result<(), CaptureError> {
        self.verify_slot_exists().await?;
        self.open_replication_stream().await?;
        self.backoff.reset();
        info!(slot = %self.slot_name, publication = %self.publication_name, "postgres replication stream opened");
        Ok(())
    }

    async fn run(&mut self, tx: mpsc::Sender<Change>, cancel: CancellationToken) -> Result<(), CaptureError> {
        let mut status_tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(CaptureError::MalformedFrame("run called before connect".to_string()));
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.send_standby_status_update().await;
                    return Ok(());
                }
                _ = status_tick.tick() => {
                    if let Err(err) = self.send_standby_status_update().await {
                        warn!(error = %err, "failed to send standby status update");
                    }
                }
                frame = stream.next() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    let frame = frame?;
                    self.handle_frame(frame, &tx).await?;
                }
            }
        }
    }

    fn current_position(&self) -> CurrentPosition {
        self.position.clone()
    }

    async fn shutdown(&mut self) {
        self.stream = None;
    }
}

impl PgCapture {
    async fn handle_frame(&mut self, mut frame: Bytes, tx: &mpsc::Sender<Change>) -> Result<(), CaptureError> {
        if frame.is_empty() {
            return Ok(());
        }
        let tag = frame.get_u8();
        match tag {
            b'w' => {
                let _wal_start = frame.get_u64();
                let wal_end = frame.get_u64();
                let _timestamp = frame.get_u64();
                self.position.set(Position::Pg(wal_end)).await;
                let position_text = Position::Pg(wal_end).format();
                let payload = frame;
                if let Some(change) = self.decode_pgoutput(payload, &position_text)? {
                    debug!(position = %change.position, "captured change");
                    tx.send(change).await.map_err(|_| CaptureError::ChannelClosed)?;
                }
            }
            b'k' => {
                let wal_end = frame.get_u64();
                let _timestamp = frame.get_u64();
                let reply_requested = frame.get_u8();
                self.position.set(Position::Pg(wal_end)).await;
                if reply_requested == 1 {
                    self.send_standby_status_update().await?;
                }
            }
            other => {
                warn!(tag = other, "unrecognized replication frame tag, skipping");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_relation() -> Relation {
        Relation {
            namespace: "public".to_string(),
            name: "users".to_string(),
            columns: vec![
                ColumnMeta { name: "id".to_string(), type_oid: 23, is_key: true },
                ColumnMeta { name: "name".to_string(), type_oid: 25, is_key: false },
                ColumnMeta { name: "balance".to_string(), type_oid: 701, is_key: false },
            ],
        }
    }

    #[test]
    fn decode_text_value_maps_known_oids() {
        assert_eq!(decode_text_value(23, "42"), ColumnValue::Int64(42));
        assert_eq!(decode_text_value(701, "3.5"), ColumnValue::Float64(3.5));
        assert_eq!(decode_text_value(16, "t"), ColumnValue::Bool(true));
        assert_eq!(decode_text_value(16, "f"), ColumnValue::Bool(false));
        assert_eq!(
            decode_text_value(1114, "2024-01-01 00:00:00"),
            ColumnValue::Timestamp("2024-01-01 00:00:00".to_string())
        );
        assert_eq!(decode_text_value(25, "hi"), ColumnValue::String("hi".to_string()));
    }

    #[test]
    fn key_values_from_row_picks_only_replica_identity_columns() {
        let relation = users_relation();
        let names = vec!["id".to_string(), "name".to_string(), "balance".to_string()];
        let values = vec![
            ColumnValue::Int64(1),
            ColumnValue::String("Ann".to_string()),
            ColumnValue::Float64(10.0),
        ];
        let keys = key_values_from_row(&relation, &names, &values);
        assert_eq!(keys.key_names, vec!["id".to_string()]);
        assert_eq!(keys.key_values, vec![ColumnValue::Int64(1)]);
    }

    #[test]
    fn key_values_from_row_falls_back_to_full_row_without_replica_identity() {
        let mut relation = users_relation();
        for column in &mut relation.columns {
            column.is_key = false;
        }
        let names = vec!["id".to_string(), "name".to_string(), "balance".to_string()];
        let values = vec![
            ColumnValue::Int64(1),
            ColumnValue::String("Ann".to_string()),
            ColumnValue::Float64(10.0),
        ];
        let keys = key_values_from_row(&relation, &names, &values);
        assert_eq!(keys.key_names, names);
        assert_eq!(keys.key_values, values);
    }

    #[test]
    fn ddl_change_from_row_builds_ddl_payload() {
        let names = vec![
            "id".to_string(),
            "time".to_string(),
            "username".to_string(),
            "database".to_string(),
            "ddl".to_string(),
        ];
        let values = vec![
            ColumnValue::Int64(7),
            ColumnValue::Timestamp("2024-01-01T00:00:00Z".to_string()),
            ColumnValue::String("alice".to_string()),
            ColumnValue::String("appdb".to_string()),
            ColumnValue::String("ALTER TABLE users ADD COLUMN age int".to_string()),
        ];
        let change = ddl_change_from_row(&names, &values, "1A/3F28C0").unwrap();
        match change.payload {
            Payload::Ddl(ddl) => {
                assert_eq!(ddl.id, Some(7));
                assert_eq!(ddl.database, "appdb");
                assert_eq!(ddl.ddl, "ALTER TABLE users ADD COLUMN age int");
                assert_eq!(ddl.username.as_deref(), Some("alice"));
            }
            Payload::Dml(_) => panic!("expected a DDL change"),
        }
        assert_eq!(change.position, "1A/3F28C0");
    }
}
