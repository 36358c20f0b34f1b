use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use rdkafka::TopicPartitionList;
use serde_json::Value;
use tracing::{error, info, warn};

use binlog::event::RepHeader;
use binlog::gtid::GtidPos;
use binlog::handler::{RowEvent, RowEventHandler};
use binlog::schema::Table;

use super::{record_key, Record};

#[derive(Debug, Clone)]
pub struct KafkaSinkConfig {
    pub bootstrap_servers: String,
    pub topic: String,

    /// Add schema records into the stream when a table schema changes.
    pub send_schema: bool,

    pub enable_idempotence: bool,

    /// Producer flush and consumer poll timeout.
    pub timeout: Duration,
}

impl Default for KafkaSinkConfig {
    fn default() -> Self {
        KafkaSinkConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            topic: "cdc".to_string(),
            send_schema: true,
            enable_idempotence: false,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Message bus sink. Records are serialized as JSON and published to a
/// single-partition topic with the key `"<gtid>:<event_num>"`; the key of
/// the last stored message restores the position after a restart.
pub struct KafkaSink {
    config: KafkaSinkConfig,
    producer: BaseProducer,
    record: Option<Record>,
    key: String,
}

impl KafkaSink {
    pub fn create(config: KafkaSinkConfig) -> Option<KafkaSink> {
        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", &config.bootstrap_servers);

        if config.enable_idempotence {
            client.set("enable.idempotence", "true");
            client.set("message.send.max.retries", "10000000");
        }

        match client.create::<BaseProducer>() {
            Ok(producer) => Some(KafkaSink {
                config,
                producer,
                record: None,
                key: String::new(),
            }),
            Err(e) => {
                error!("Failed to create Kafka producer: {}", e);
                None
            }
        }
    }

    fn produce(&mut self, payload: &str, key: &str) -> bool {
        let record = BaseRecord::to(&self.config.topic).payload(payload).key(key);

        match self.producer.send(record) {
            Ok(()) => {
                self.producer.poll(Duration::from_millis(0));
                true
            }
            Err((e, _)) => {
                error!("Failed to produce message: {}", e);
                false
            }
        }
    }
}

impl RowEventHandler for KafkaSink {
    fn load_latest_gtid(&mut self) -> Option<GtidPos> {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", "maxbridge-cdc")
            .create()
            .map_err(|e| error!("{}", e))
            .ok()?;

        let (low, high) = consumer
            .fetch_watermarks(&self.config.topic, 0, self.config.timeout)
            .map_err(|e| error!("Couldn't read offsets from Kafka: {}", e))
            .ok()?;

        if high <= 0 {
            info!("Kafka watermarks: High: {} Low: {}", high, low);
            return None;
        }

        let mut partitions = TopicPartitionList::new();
        partitions
            .add_partition_offset(&self.config.topic, 0, rdkafka::Offset::Offset(high - 1))
            .ok()?;
        consumer.assign(&partitions).ok()?;

        let message = consumer.poll(self.config.timeout)?.ok()?;

        match message.key().map(String::from_utf8_lossy) {
            Some(key) => {
                let gtid = GtidPos::parse(&key)?;
                info!("Continuing replication from latest stored GTID in Kafka: {}", gtid);
                Some(gtid)
            }
            None => {
                warn!("Stored Kafka message does not contain a key, cannot restore position.");
                None
            }
        }
    }

    fn create_table(&mut self, table: &Table) -> bool {
        if !self.config.send_schema {
            return true;
        }

        let schema = table.to_json().to_string();
        let gtid = table.gtid.to_string();
        self.produce(&schema, &gtid)
    }

    fn open_table(&mut self, _table: &Table) -> bool {
        true
    }

    fn prepare_table(&mut self, _table: &Table) -> bool {
        true
    }

    fn flush_tables(&mut self) {
        if let Err(e) = self.producer.flush(self.config.timeout) {
            error!("Failed to flush Kafka producer: {}", e);
        }
    }

    fn prepare_row(&mut self, table: &Table, gtid: &GtidPos, hdr: &RepHeader, event_type: RowEvent) {
        self.key = record_key(gtid);

        let mut record = Record::begin(gtid, hdr, event_type);
        record.insert("table_schema", table.database.clone().into());
        record.insert("table_name", table.table.clone().into());

        self.record = Some(record);
    }

    fn commit(&mut self, _table: &Table, _gtid: &GtidPos) -> bool {
        let Some(record) = self.record.take() else {
            return false;
        };

        let payload = record.into_value().to_string();
        let key = std::mem::take(&mut self.key);
        self.produce(&payload, &key)
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
