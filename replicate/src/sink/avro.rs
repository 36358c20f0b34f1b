use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde_json::Value;
use tracing::error;

use binlog::event::RepHeader;
use binlog::gtid::GtidPos;
use binlog::handler::{RowEvent, RowEventHandler};
use binlog::schema::Table;

use super::Record;

/// File sink: one records file per table version, written as one JSON
/// document per line, next to the `.avsc` schema files.
pub struct AvroFileSink {
    datadir: PathBuf,
    open_files: HashMap<String, BufWriter<File>>,
    record: Option<Record>,
}

impl AvroFileSink {
    pub fn new(datadir: impl Into<PathBuf>) -> AvroFileSink {
        AvroFileSink {
            datadir: datadir.into(),
            open_files: HashMap::new(),
            record: None,
        }
    }

    fn data_file_name(table: &Table) -> String {
        format!(
            "{}.{}.{:06}.avro.json",
            table.database, table.table, table.version
        )
    }

    fn open_file(&mut self, table: &Table) -> bool {
        let name = Self::data_file_name(table);

        if self.open_files.contains_key(&name) {
            return true;
        }

        let path = self.datadir.join(&name);

        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                self.open_files.insert(name, BufWriter::new(file));
                true
            }
            Err(e) => {
                error!("Failed to open data file '{}': {}", path.display(), e);
                false
            }
        }
    }
}

impl RowEventHandler for AvroFileSink {
    fn create_table(&mut self, table: &Table) -> bool {
        // A new version gets its own data file on the next open.
        if let Err(e) = table.serialize(&self.datadir) {
            error!("Failed to store schema for '{}': {}", table.id(), e);
            return false;
        }
        true
    }

    fn open_table(&mut self, table: &Table) -> bool {
        self.open_file(table)
    }

    fn prepare_table(&mut self, table: &Table) -> bool {
        self.open_file(table)
    }

    fn flush_tables(&mut self) {
        for (name, file) in self.open_files.iter_mut() {
            if let Err(e) = file.flush() {
                error!("Failed to flush data file '{}': {}", name, e);
            }
        }
    }

    fn prepare_row(&mut self, _table: &Table, gtid: &GtidPos, hdr: &RepHeader, event_type: RowEvent) {
        self.record = Some(Record::begin(gtid, hdr, event_type));
    }

    fn commit(&mut self, table: &Table, _gtid: &GtidPos) -> bool {
        let Some(record) = self.record.take() else {
            return false;
        };

        let name = Self::data_file_name(table);
        let Some(file) = self.open_files.get_mut(&name) else {
            error!("No open data file for '{}'", table.id());
            return false;
        };

        match writeln!(file, "{}", record.into_value()) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write record for '{}': {}", table.id(), e);
                false
            }
        }
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
            // Bytes travel as base16 text inside the JSON records.
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

#[cfg(test)]
mod test {
    use super::*;
    use binlog::schema::Column;

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("avro_sink_{}_{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn table() -> Table {
        Table::new(
            "d",
            "t",
            1,
            vec![Column::with_type("a", "int"), Column::with_type("b", "varchar")],
            GtidPos::parse("0-1-5").unwrap(),
        )
    }

    #[test]
    fn writes_one_json_line_per_record() {
        let dir = tempdir("lines");
        let mut sink = AvroFileSink::new(&dir);
        let table = table();
        let mut gtid = table.gtid;

        assert!(sink.create_table(&table));
        assert!(sink.open_table(&table));

        gtid.event_num = 1;
        sink.prepare_row(&table, &gtid, &RepHeader::default(), RowEvent::Write);
        sink.column_int(&table, 0, 42);
        sink.column_string(&table, 1, "hello".into());
        assert!(sink.commit(&table, &gtid));
        sink.flush_tables();

        let data = std::fs::read_to_string(dir.join("d.t.000001.avro.json")).unwrap();
        let lines: Vec<_> = data.lines().collect();
        assert_eq!(lines.len(), 1);

        let record: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["a"], 42);
        assert_eq!(record["b"], "hello");
        assert_eq!(record["event_type"], "insert");
        assert_eq!(record["event_number"], 1);

        // The schema file was written as well.
        assert!(dir.join("d.t.000001.avsc").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn null_and_bytes_values() {
        let dir = tempdir("nulls");
        let mut sink = AvroFileSink::new(&dir);
        let table = table();

        assert!(sink.prepare_table(&table));
        sink.prepare_row(&table, &table.gtid, &RepHeader::default(), RowEvent::Delete);
        sink.column_null(&table, 0);
        sink.column_bytes(&table, 1, vec![0xde, 0xad]);
        assert!(sink.commit(&table, &table.gtid));
        sink.flush_tables();

        let data = std::fs::read_to_string(dir.join("d.t.000001.avro.json")).unwrap();
        let record: Value = serde_json::from_str(data.lines().next().unwrap()).unwrap();
        assert!(record["a"].is_null());
        assert_eq!(record["b"], "dead");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
