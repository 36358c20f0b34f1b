use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::{error, warn};

use crate::column::leint;
use crate::gtid::GtidPos;
use common::err::{ReplicationError, Result};

pub const AVRO_DOMAIN: &str = "domain";
pub const AVRO_SERVER_ID: &str = "server_id";
pub const AVRO_SEQUENCE: &str = "sequence";
pub const AVRO_EVENT_NUMBER: &str = "event_number";
pub const AVRO_EVENT_TYPE: &str = "event_type";
pub const AVRO_TIMESTAMP: &str = "timestamp";

pub fn is_reserved_word(word: &str) -> bool {
    [
        AVRO_DOMAIN,
        AVRO_SERVER_ID,
        AVRO_SEQUENCE,
        AVRO_EVENT_NUMBER,
        AVRO_EVENT_TYPE,
        AVRO_TIMESTAMP,
    ]
    .iter()
    .any(|w| word.eq_ignore_ascii_case(w))
}

/// Identifier sanitizer for schema output. Non-word characters become `_`
/// and reserved record field names get a trailing `_`.
pub fn schema_sanitizer(s: &str) -> String {
    let mut rval: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if is_reserved_word(&rval) {
        rval.push('_');
    }

    rval
}

/// A single column of a CREATE TABLE statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub length: i64,
    pub is_unsigned: bool,

    // Placement hints from ALTER TABLE.
    pub first: bool,
    pub after: String,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            type_name: "unknown".to_string(),
            length: -1,
            is_unsigned: false,
            first: false,
            after: String::new(),
        }
    }

    pub fn with_type(name: impl Into<String>, type_name: impl Into<String>) -> Column {
        Column {
            type_name: type_name.into(),
            ..Column::new(name)
        }
    }
}

/// A tracked table schema, versioned across DDL changes.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub database: String,
    pub table: String,
    pub version: i64,

    /// Whether the sink has opened this version of the table.
    pub is_open: bool,

    /// GTID of the statement that produced this version.
    pub gtid: GtidPos,

    pub columns: Vec<Column>,

    // Latest TABLE_MAP data for this table.
    pub column_types: Vec<u8>,
    pub column_metadata: Vec<u8>,
    pub null_bitmap: Vec<u8>,
}

/// Shared handle; the registry is the single writer, row processing and the
/// bridge read through the lock.
pub type STable = Arc<RwLock<Table>>;

impl Table {
    pub fn new(database: impl Into<String>, table: impl Into<String>, version: i64,
               columns: Vec<Column>, gtid: GtidPos) -> Table {
        Table {
            database: database.into(),
            table: table.into(),
            version,
            is_open: false,
            gtid,
            columns,
            column_types: Vec::new(),
            column_metadata: Vec::new(),
            null_bitmap: Vec::new(),
        }
    }

    /// The table identifier, `database.table`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    /// Extract column types and metadata from a TABLE_MAP payload and
    /// return the table id the binding was made for.
    ///
    /// `post_header_len` is the TABLE_MAP post-header length from the
    /// format description; 6 means a 4 byte table id.
    pub fn map_table(&mut self, payload: &[u8], post_header_len: u8) -> Result<u64> {
        let (table_id, _, _, pos) = read_table_map_names(payload, post_header_len)?;
        let mut pos = pos;

        let short = || ReplicationError::Decode("short TABLE_MAP event".into());

        let (column_count, n) = leint(payload.get(pos..).ok_or_else(short)?)?;
        pos += n;

        let column_count = column_count as usize;
        let types = payload.get(pos..pos + column_count).ok_or_else(short)?;
        self.column_types = types.to_vec();
        pos += column_count;

        let (metadata_size, n) = leint(payload.get(pos..).ok_or_else(short)?)?;
        pos += n;
        let metadata = payload
            .get(pos..pos + metadata_size as usize)
            .ok_or_else(short)?;
        self.column_metadata = metadata.to_vec();
        pos += metadata_size as usize;

        let nullmap_size = (column_count + 7) / 8;
        let nullmap = payload.get(pos..pos + nullmap_size).ok_or_else(short)?;
        self.null_bitmap = nullmap.to_vec();

        Ok(table_id)
    }

    /// Serialize to the schema record format used on disk and on the wire.
    pub fn to_json(&self) -> Value {
        let mut fields = vec![
            json!({"name": AVRO_DOMAIN, "type": "int"}),
            json!({"name": AVRO_SERVER_ID, "type": "int"}),
            json!({"name": AVRO_SEQUENCE, "type": "int"}),
            json!({"name": AVRO_EVENT_NUMBER, "type": "int"}),
            json!({"name": AVRO_TIMESTAMP, "type": "int"}),
            json!({
                "name": AVRO_EVENT_TYPE,
                "type": {
                    "type": "enum",
                    "name": "EVENT_TYPES",
                    "symbols": ["insert", "update_before", "update_after", "delete"],
                }
            }),
        ];

        for c in &self.columns {
            fields.push(json!({
                "name": c.name,
                "type": ["null", column_type_to_avro_type(&c.type_name)],
                "real_type": c.type_name,
                "length": c.length,
                "unsigned": c.is_unsigned,
            }));
        }

        json!({
            "namespace": "ChangeDataSchema.avro",
            "type": "record",
            "name": "ChangeRecord",
            "table": self.table,
            "database": self.database,
            "version": self.version,
            "gtid": self.gtid.to_string(),
            "fields": fields,
        })
    }

    pub fn schema_file_name(&self) -> String {
        format!("{}.{}.{:06}.avsc", self.database, self.table, self.version)
    }

    /// Write the schema file for this version, only if it does not exist.
    /// The write goes through a temporary file and a rename.
    pub fn serialize(&self, dir: &Path) -> std::io::Result<()> {
        let path = dir.join(self.schema_file_name());

        if path.exists() {
            return Ok(());
        }

        let tmp = dir.join(format!("{}.tmp", self.schema_file_name()));
        fs::write(&tmp, format!("{}\n", self.to_json()))?;
        fs::rename(&tmp, &path)
    }

    /// Load a schema from a `<db>.<table>.<version>.avsc` file.
    pub fn deserialize(path: &Path) -> Option<Table> {
        let name = path.file_name()?.to_str()?;

        let mut parts = name.splitn(4, '.');
        let database = parts.next()?;
        let table = parts.next()?;
        let version: i64 = parts.next()?.parse().ok()?;
        if parts.next()? != "avsc" {
            return None;
        }

        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to read schema file '{}': {}", path.display(), e);
                return None;
            }
        };

        let json: Value = match serde_json::from_str(&text) {
            Ok(j) => j,
            Err(e) => {
                error!("Malformed schema file '{}': {}", path.display(), e);
                return None;
            }
        };

        let gtid = json
            .get("gtid")
            .and_then(Value::as_str)
            .and_then(GtidPos::parse)
            .unwrap_or_default();

        let mut columns = Vec::new();

        for field in json.get("fields")?.as_array()? {
            let name = field.get("name")?.as_str()?;

            if is_reserved_word(name) {
                continue;
            }

            let mut column = Column::new(name);

            match field.get("real_type").and_then(Value::as_str) {
                Some(t) => column.type_name = t.to_string(),
                None => warn!("No \"real_type\" in '{}'. Treating as unknown type field.", name),
            }

            match field.get("length").and_then(Value::as_i64) {
                Some(l) => column.length = l,
                None => warn!("No \"length\" in '{}'. Treating as default length field.", name),
            }

            if let Some(u) = field.get("unsigned").and_then(Value::as_bool) {
                column.is_unsigned = u;
            }

            columns.push(column);
        }

        Some(Table::new(database, table, version, columns, gtid))
    }
}

/// Parse the identifying part of a TABLE_MAP payload without mutating any
/// schema: (table_id, database, table, offset after the names).
pub fn read_table_map_names(payload: &[u8], post_header_len: u8) -> Result<(u64, String, String, usize)> {
    let short = || ReplicationError::Decode("short TABLE_MAP event".into());

    let id_size = if post_header_len == 6 { 4 } else { 6 };

    let id_bytes = payload.get(..id_size).ok_or_else(short)?;
    let mut table_id = 0u64;
    for (n, &b) in id_bytes.iter().enumerate() {
        table_id |= (b as u64) << (8 * n);
    }

    // Flags, unused.
    let mut pos = id_size + 2;

    let db_len = *payload.get(pos).ok_or_else(short)? as usize;
    pos += 1;
    let database = payload.get(pos..pos + db_len).ok_or_else(short)?;
    pos += db_len + 1; // NUL terminator

    let table_len = *payload.get(pos).ok_or_else(short)? as usize;
    pos += 1;
    let table = payload.get(pos..pos + table_len).ok_or_else(short)?;
    pos += table_len + 1;

    Ok((
        table_id,
        String::from_utf8_lossy(database).into_owned(),
        String::from_utf8_lossy(table).into_owned(),
        pos,
    ))
}

/// Map a declared column type to the wider storage buckets of the schema
/// record format.
pub fn column_type_to_avro_type(type_name: &str) -> &'static str {
    match type_name.to_ascii_lowercase().as_str() {
        "tinyint" | "boolean" | "smallint" | "mediumint" | "int" | "integer" => "int",
        "bigint" | "serial" => "long",
        "double" | "decimal" | "numeric" | "fixed" | "dec" | "real" => "double",
        "tinyblob" | "blob" | "mediumblob" | "longblob" | "tinytext" | "text" | "mediumtext"
        | "longtext" => "bytes",
        "float" => "float",
        _ => "string",
    }
}

/// Build a TABLE_MAP payload; only used by tests and tools.
pub fn build_table_map_payload(table_id: u64, database: &str, table: &str,
                               column_types: &[u8], column_metadata: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(&table_id.to_le_bytes()[..6]);
    buf.extend_from_slice(&0u16.to_le_bytes());

    buf.push(database.len() as u8);
    buf.extend_from_slice(database.as_bytes());
    buf.push(0);

    buf.push(table.len() as u8);
    buf.extend_from_slice(table.as_bytes());
    buf.push(0);

    buf.push(column_types.len() as u8); // length-encoded, small values only
    buf.extend_from_slice(column_types);

    buf.push(column_metadata.len() as u8);
    buf.extend_from_slice(column_metadata);

    let nullmap_size = (column_types.len() + 7) / 8;
    buf.extend(std::iter::repeat(0u8).take(nullmap_size));

    buf
}

pub fn schema_files_newest_first(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "avsc").unwrap_or(false))
            .collect(),
        Err(_) => Vec::new(),
    };

    // Name order is version order; newest first gives us the latest schema
    // on the first hit.
    files.sort();
    files.reverse();
    files
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::column::{COL_TYPE_LONG, COL_TYPE_TINY, COL_TYPE_VARCHAR};

    fn test_table() -> Table {
        Table::new(
            "d",
            "t",
            1,
            vec![
                Column::with_type("a", "int"),
                Column::with_type("b", "varchar"),
            ],
            GtidPos::parse("0-1-5").unwrap(),
        )
    }

    #[test]
    fn map_table_extracts_types_and_metadata() {
        let payload = build_table_map_payload(
            100,
            "d",
            "t",
            &[COL_TYPE_LONG, COL_TYPE_VARCHAR],
            &[0xff, 0x00],
        );

        let mut table = test_table();
        let id = table.map_table(&payload, 8).unwrap();

        assert_eq!(id, 100);
        assert_eq!(table.column_types, vec![COL_TYPE_LONG, COL_TYPE_VARCHAR]);
        assert_eq!(table.column_metadata, vec![0xff, 0x00]);
        assert_eq!(table.null_bitmap.len(), 1);
    }

    #[test]
    fn table_map_names() {
        let payload = build_table_map_payload(7, "mydb", "mytable", &[COL_TYPE_TINY], &[]);
        let (id, db, tbl, _) = read_table_map_names(&payload, 8).unwrap();
        assert_eq!(id, 7);
        assert_eq!(db, "mydb");
        assert_eq!(tbl, "mytable");
    }

    #[test]
    fn short_table_map_is_an_error() {
        let mut table = test_table();
        assert!(table.map_table(&[1, 2, 3], 8).is_err());
    }

    #[test]
    fn json_has_reserved_fields_first() {
        let json = test_table().to_json();
        let fields = json["fields"].as_array().unwrap();

        assert_eq!(fields[0]["name"], AVRO_DOMAIN);
        assert_eq!(fields[5]["name"], AVRO_EVENT_TYPE);
        assert_eq!(fields[6]["name"], "a");
        assert_eq!(fields[6]["type"], json!(["null", "int"]));
        assert_eq!(fields[7]["real_type"], "varchar");
        assert_eq!(json["gtid"], "0-1-5");
    }

    #[test]
    fn serialize_and_deserialize_round_trip() {
        let dir = std::env::temp_dir().join(format!("schema_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let table = test_table();
        table.serialize(&dir).unwrap();

        let path = dir.join("d.t.000001.avsc");
        let restored = Table::deserialize(&path).unwrap();

        assert_eq!(restored.database, "d");
        assert_eq!(restored.table, "t");
        assert_eq!(restored.version, 1);
        assert_eq!(restored.columns.len(), 2);
        assert_eq!(restored.columns[0].name, "a");
        assert_eq!(restored.columns[1].type_name, "varchar");
        assert_eq!(restored.gtid.seq, 5);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn serialize_does_not_overwrite() {
        let dir = std::env::temp_dir().join(format!("schema_test_ow_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let table = test_table();
        table.serialize(&dir).unwrap();

        let path = dir.join("d.t.000001.avsc");
        fs::write(&path, "sentinel").unwrap();
        table.serialize(&dir).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "sentinel");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn sanitizer_rewrites_reserved_and_special() {
        assert_eq!(schema_sanitizer("domain"), "domain_");
        assert_eq!(schema_sanitizer("a-b c"), "a_b_c");
        assert_eq!(schema_sanitizer("plain"), "plain");
    }

    #[test]
    fn avro_type_buckets() {
        assert_eq!(column_type_to_avro_type("INT"), "int");
        assert_eq!(column_type_to_avro_type("bigint"), "long");
        assert_eq!(column_type_to_avro_type("decimal"), "double");
        assert_eq!(column_type_to_avro_type("text"), "bytes");
        assert_eq!(column_type_to_avro_type("float"), "float");
        assert_eq!(column_type_to_avro_type("varchar"), "string");
    }
}
