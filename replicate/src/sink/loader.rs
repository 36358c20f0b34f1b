use std::collections::HashMap;

use serde_json::Value;
use tracing::error;

use binlog::event::RepHeader;
use binlog::gtid::GtidPos;
use binlog::handler::{RowEvent, RowEventHandler};
use binlog::schema::Table;

use crate::sql::SqlConnection;

use super::Record;

/// Batches committed records into multi-row INSERT statements against a
/// target table on another server. The batch of a table is flushed at the
/// transaction boundary.
pub struct SqlLoaderSink {
    connection: Box<dyn SqlConnection>,
    target_table: String,
    batches: HashMap<String, Vec<String>>,
    record: Option<Record>,
    max_batch: usize,
}

fn escape_sql_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\'' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

impl SqlLoaderSink {
    pub fn new(connection: Box<dyn SqlConnection>, target_table: impl Into<String>) -> SqlLoaderSink {
        SqlLoaderSink {
            connection,
            target_table: target_table.into(),
            batches: HashMap::new(),
            record: None,
            max_batch: 1000,
        }
    }

    fn flush_batches(&mut self) {
        for (source, values) in std::mem::take(&mut self.batches) {
            if values.is_empty() {
                continue;
            }

            let sql = format!(
                "INSERT INTO {} (domain, server_id, sequence, event_number, timestamp, \
                 event_type, table_name, data) VALUES {}",
                self.target_table,
                values.join(", ")
            );

            if let Err(e) = self.connection.query(&sql) {
                error!("Failed to load {} records for '{}': {}", values.len(), source, e);
            }
        }
    }
}

impl RowEventHandler for SqlLoaderSink {
    fn create_table(&mut self, _table: &Table) -> bool {
        true
    }

    fn open_table(&mut self, _table: &Table) -> bool {
        true
    }

    fn prepare_table(&mut self, _table: &Table) -> bool {
        true
    }

    fn flush_tables(&mut self) {
        self.flush_batches();
    }

    fn prepare_row(&mut self, _table: &Table, gtid: &GtidPos, hdr: &RepHeader, event_type: RowEvent) {
        self.record = Some(Record::begin(gtid, hdr, event_type));
    }

    fn commit(&mut self, table: &Table, gtid: &GtidPos) -> bool {
        let Some(record) = self.record.take() else {
            return false;
        };

        let event_type = record
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let data = escape_sql_string(&record.into_value().to_string());

        let row = format!(
            "({}, {}, {}, {}, {}, '{}', '{}', '{}')",
            gtid.domain,
            gtid.server_id,
            gtid.seq,
            gtid.event_num,
            gtid.timestamp,
            event_type,
            escape_sql_string(&table.id()),
            data
        );

        let batch = self.batches.entry(table.id()).or_default();
        batch.push(row);

        if batch.len() >= self.max_batch {
            self.flush_batches();
        }

        true
    }

    fn column_int(&mut self, table: &Table, i: usize, value: i32) {
        if let Some(r) = self.record.as_mut() {
            r.set(table, i, value.into());
        }
    }

    fn column_long(&mut self, table: &Table, i: usize, value: i64) {
        if let Some(r) = self.record.as_mut() {
            r.set(table, i, value.into());
        }
    }

    fn column_float(&mut self, table: &Table, i: usize, value: f32) {
        if let Some(r) = self.record.as_mut() {
            r.set(table, i, value.into());
        }
    }

    fn column_double(&mut self, table: &Table, i: usize, value: f64) {
        if let Some(r) = self.record.as_mut() {
            r.set(table, i, value.into());
        }
    }

    fn column_string(&mut self, table: &Table, i: usize, value: String) {
        if let Some(r) = self.record.as_mut() {
            r.set(table, i, value.into());
        }
    }

    fn column_bytes(&mut self, table: &Table, i: usize, value: Vec<u8>) {
        if let Some(r) = self.record.as_mut() {
            let hex: String = value.iter().map(|b| format!("{:02x}", b)).collect();
            r.set(table, i, hex.into());
        }
    }

    fn column_null(&mut self, table: &Table, i: usize) {
        if let Some(r) = self.record.as_mut() {
            r.set(table, i, Value::Null);
        }
    }
}
