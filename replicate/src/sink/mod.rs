pub mod avro;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod loader;

use serde_json::{Map, Value};

use binlog::event::RepHeader;
use binlog::gtid::GtidPos;
use binlog::handler::RowEvent;
use binlog::schema::{
    Table, AVRO_DOMAIN, AVRO_EVENT_NUMBER, AVRO_EVENT_TYPE, AVRO_SEQUENCE, AVRO_SERVER_ID,
    AVRO_TIMESTAMP,
};

/// One change record under construction, shared by the sinks that serialize
/// rows as JSON.
#[derive(Debug, Default, Clone)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn begin(gtid: &GtidPos, hdr: &RepHeader, event_type: RowEvent) -> Record {
        let mut fields = Map::new();

        fields.insert(AVRO_DOMAIN.into(), gtid.domain.into());
        fields.insert(AVRO_SERVER_ID.into(), gtid.server_id.into());
        fields.insert(AVRO_SEQUENCE.into(), gtid.seq.into());
        fields.insert(AVRO_EVENT_NUMBER.into(), gtid.event_num.into());
        fields.insert(AVRO_TIMESTAMP.into(), hdr.timestamp.into());
        fields.insert(AVRO_EVENT_TYPE.into(), event_type.as_str().into());

        Record { fields }
    }

    pub fn set(&mut self, table: &Table, i: usize, value: Value) {
        if let Some(column) = table.columns.get(i) {
            self.fields.insert(column.name.clone(), value);
        }
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// The record key that uniquely identifies an event in the stream.
pub fn record_key(gtid: &GtidPos) -> String {
    format!("{}:{}", gtid, gtid.event_num)
}
