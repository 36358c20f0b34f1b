use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Once, RwLock};

use tracing::{debug, error, info, warn};

use crate::column::process_row_data;
use crate::event::*;
use crate::filter::TableFilter;
use crate::gtid::GtidPos;
use crate::handler::{RowEvent, RowEventHandler};
use crate::normalize::normalize_sql;
use crate::schema::{
    read_table_map_names, schema_files_newest_first, schema_sanitizer, Column, STable, Table,
};
use crate::tokenizer::{self, Chain, Token, Type};
use common::err::{ReplicationError, Result};

// Format description layout: 2 bytes binlog version, 50 bytes server
// version, 4 bytes create timestamp, 1 byte header length.
const FDE_EVENT_TYPES_OFFSET: usize = 2 + 50 + 4 + 1;

// Checksum algorithm byte plus the checksum itself.
const FDE_EXTRA_BYTES: usize = 5;

static WARN_NOT_ROW_FORMAT: Once = Once::new();

/// Fetches CREATE TABLE statements from the upstream when a TABLE_MAP event
/// arrives before the DDL for its table was seen.
pub trait SchemaFetcher: Send {
    fn fetch_create_table(&mut self, ident: &str) -> Option<String>;
}

/// What the enclosing loop needs to know about a processed event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// A transaction committed; the position may be persisted.
    pub commit: bool,

    /// The stream is at a safe stop point.
    pub safe_stop: bool,
}

/// Stateful transformer of the replication stream into row event handler
/// calls. One instance per stream, driven from a single thread.
pub struct Rpl {
    handler: Box<dyn RowEventHandler>,

    binlog_checksum: u8,
    event_type_hdr_lens: Vec<u8>,

    gtid: GtidPos,
    implicit_commit_pending: bool,

    active_maps: HashMap<u64, STable>,
    created_tables: HashMap<String, STable>,
    versions: HashMap<String, i64>,

    filter: TableFilter,
    datadir: Option<PathBuf>,
    fetcher: Option<Box<dyn SchemaFetcher>>,
}

impl Rpl {
    pub fn new(handler: Box<dyn RowEventHandler>, filter: TableFilter) -> Rpl {
        Rpl {
            handler,
            binlog_checksum: 0,
            event_type_hdr_lens: Vec::new(),
            gtid: GtidPos::default(),
            implicit_commit_pending: false,
            active_maps: HashMap::new(),
            created_tables: HashMap::new(),
            versions: HashMap::new(),
            filter,
            datadir: None,
            fetcher: None,
        }
    }

    pub fn set_fetcher(&mut self, fetcher: Box<dyn SchemaFetcher>) {
        self.fetcher = Some(fetcher);
    }

    pub fn set_gtid(&mut self, gtid: GtidPos) {
        self.gtid = gtid;
    }

    pub fn gtid(&self) -> &GtidPos {
        &self.gtid
    }

    /// Ask the handler for an externally persisted position.
    pub fn load_gtid(&mut self) -> Option<GtidPos> {
        self.handler.load_latest_gtid()
    }

    pub fn have_checksums(&self) -> bool {
        self.binlog_checksum != 0
    }

    /// Look up a tracked table.
    pub fn table(&self, ident: &str) -> Option<STable> {
        self.created_tables.get(ident).cloned()
    }

    /// Flush the handler at a commit boundary.
    pub fn flush(&mut self) {
        self.handler.flush_tables();
    }

    /// Sets the data directory and seeds the registry from stored schemas.
    pub fn load_metadata(&mut self, datadir: &std::path::Path) {
        self.datadir = Some(datadir.to_path_buf());

        // Newest first, so the first file seen for a table is its latest
        // schema.
        for path in schema_files_newest_first(datadir) {
            if let Some(table) = Table::deserialize(&path) {
                let id = table.id();
                let version = table.version;

                if self.versions.get(&id).copied().unwrap_or(0) < version {
                    self.versions.insert(id.clone(), version);
                    self.created_tables.insert(id, Arc::new(RwLock::new(table)));
                }
            }
        }
    }

    /// Handle one replicated event. The payload excludes the 19 byte common
    /// header but includes the trailing checksum when enabled.
    pub fn handle_event(&mut self, hdr: &RepHeader, payload: &[u8]) -> Result<Outcome> {
        let mut outcome = Outcome::default();

        let data = if self.binlog_checksum != 0
            && hdr.event_type != FORMAT_DESCRIPTION_EVENT
            && payload.len() >= 4
        {
            &payload[..payload.len() - 4]
        } else {
            payload
        };

        match hdr.event_type {
            FORMAT_DESCRIPTION_EVENT => {
                self.handle_format_description(payload)?;
            }
            ROTATE_EVENT | HEARTBEAT_EVENT => {
                outcome.safe_stop = true;
            }
            GTID_EVENT => {
                outcome.safe_stop = true;

                if data.len() >= 13 && data[12] & GTID_IMPLICIT_COMMIT_FLAG != 0 {
                    self.implicit_commit_pending = true;
                }

                self.gtid = GtidPos::extract(hdr.timestamp, hdr.server_id, data)
                    .ok_or_else(|| ReplicationError::Decode("short GTID event".into()))?;
                debug!("GTID: {}", self.gtid);
            }
            XID_EVENT => {
                outcome.commit = true;
                outcome.safe_stop = true;
                debug!("XID for GTID '{}'", self.gtid);
            }
            TABLE_MAP_EVENT => {
                self.handle_table_map_event(hdr, data)?;
            }
            QUERY_EVENT => {
                let committed = self.handle_query_event(data)?;
                outcome.commit = committed || self.take_implicit_commit();
            }
            USER_VAR_EVENT => {
                outcome.commit = self.take_implicit_commit();
            }
            t if is_row_event(t) => {
                self.handle_row_event(hdr, data)?;
            }
            _ => {
                // Ignore the event.
            }
        }

        Ok(outcome)
    }

    fn take_implicit_commit(&mut self) -> bool {
        std::mem::take(&mut self.implicit_commit_pending)
    }

    fn handle_format_description(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < FDE_EVENT_TYPES_OFFSET + FDE_EXTRA_BYTES {
            return Err(ReplicationError::Decode("short format description".into()));
        }

        let n_events = payload.len() - FDE_EVENT_TYPES_OFFSET - FDE_EXTRA_BYTES;

        self.event_type_hdr_lens =
            payload[FDE_EVENT_TYPES_OFFSET..FDE_EVENT_TYPES_OFFSET + n_events].to_vec();
        self.binlog_checksum = payload[payload.len() - FDE_EXTRA_BYTES];

        debug!(
            "Format description: {} event types, checksums {}",
            n_events,
            if self.binlog_checksum != 0 { "on" } else { "off" }
        );

        Ok(())
    }

    /// Post-header length for an event type, learned from the format
    /// description. The array is indexed from event type 1.
    fn post_header_len(&self, event_type: u8) -> Result<u8> {
        self.event_type_hdr_lens
            .get(event_type as usize - 1)
            .copied()
            .ok_or_else(|| {
                ReplicationError::Decode(format!(
                    "no format description for event type {}",
                    event_type
                ))
            })
    }

    fn handle_table_map_event(&mut self, hdr: &RepHeader, payload: &[u8]) -> Result<()> {
        let ev_len = self.post_header_len(hdr.event_type)?;
        let (_, database, table, _) = read_table_map_names(payload, ev_len)?;
        let ident = format!("{}.{}", database, table);

        if !self.filter.matches(&ident) {
            return Ok(());
        }

        if !self.created_tables.contains_key(&ident) {
            self.fetch_table_schema(&ident, &database);
        }

        let Some(create) = self.created_tables.get(&ident).cloned() else {
            warn!(
                "Table map event for table '{}' read before the DDL statement for that table \
                 was read. Data will not be processed for this table until a DDL statement for \
                 it is read.",
                ident
            );
            return Ok(());
        };

        let (id, open_table) = {
            let mut table = create.write().unwrap();
            let id = table.map_table(payload, ev_len)?;
            (id, !table.is_open)
        };

        debug!("Table {} mapped to {}", ident, id);
        self.active_maps.insert(id, create.clone());

        if open_table {
            let mut table = create.write().unwrap();

            if let Some(datadir) = &self.datadir {
                if let Err(e) = table.serialize(datadir) {
                    error!("Failed to store schema for '{}': {}", ident, e);
                }
            }

            let opened = self.handler.open_table(&table);
            table.is_open = opened;
        }

        Ok(())
    }

    /// Fetch and apply the CREATE TABLE of a table seen for the first time.
    fn fetch_table_schema(&mut self, ident: &str, database: &str) {
        let Some(fetcher) = self.fetcher.as_mut() else {
            return;
        };

        if let Some(sql) = fetcher.fetch_create_table(ident) {
            let sql = normalize_sql(&sql);
            self.parse_sql(&sql, database);
        } else {
            error!("Failed to fetch CREATE TABLE for '{}'", ident);
        }
    }

    fn handle_row_event(&mut self, hdr: &RepHeader, payload: &[u8]) -> Result<()> {
        let short = || ReplicationError::Decode("short row event".into());

        let table_id_size = if self.post_header_len(hdr.event_type)? == 6 {
            4
        } else {
            6
        };

        let id_bytes = payload.get(..table_id_size).ok_or_else(short)?;
        let mut table_id = 0u64;
        for (n, &b) in id_bytes.iter().enumerate() {
            table_id |= (b as u64) << (8 * n);
        }
        let mut pos = table_id_size;

        let flags =
            u16::from_le_bytes(payload.get(pos..pos + 2).ok_or_else(short)?.try_into().unwrap());
        pos += 2;

        if table_id == TABLE_DUMMY_ID && flags & ROW_EVENT_END_STATEMENT != 0 {
            // A dummy event that releases all table maps.
            self.active_maps.clear();
            return Ok(());
        }

        if is_v2_row_event(hdr.event_type) {
            // Version 2 row event, skip the extra data.
            let extra_len = u16::from_le_bytes(
                payload.get(pos..pos + 2).ok_or_else(short)?.try_into().unwrap(),
            ) as usize;
            pos += 2 + extra_len.saturating_sub(2);
        }

        let (ncolumns, n) = crate::column::leint(payload.get(pos..).ok_or_else(short)?)?;
        pos += n;
        let ncolumns = ncolumns as usize;

        let coldata_size = (ncolumns + 7) / 8;
        let col_present = payload.get(pos..pos + coldata_size).ok_or_else(short)?.to_vec();
        pos += coldata_size;

        // Update events carry a second bitmap for the after image.
        if is_update_event(hdr.event_type) {
            pos += coldata_size;
        }

        let Some(create) = self.active_maps.get(&table_id).cloned() else {
            info!(
                "Row event for unknown table mapped to ID {}. Data will not be processed.",
                table_id
            );
            return Ok(());
        };

        let table = create.read().unwrap();

        if !self.filter.matches(&table.id()) {
            return Ok(());
        }

        if ncolumns != table.columns.len() {
            error!(
                "Row event and table map event have different column counts for table {}, \
                 only full row image is currently supported.",
                table.id()
            );
            return Ok(());
        }

        if !self.handler.prepare_table(&table) {
            error!(
                "Output handle was not opened for table {}. See earlier errors for more details.",
                table.id()
            );
            return Ok(());
        }

        let event_type = match hdr.event_type {
            t if is_update_event(t) => RowEvent::Update,
            WRITE_ROWS_EVENT_V0 | WRITE_ROWS_EVENT_V1 | WRITE_ROWS_EVENT_V2 => RowEvent::Write,
            _ => RowEvent::Delete,
        };

        // The number of rows is not known beforehand, the rows are processed
        // until the end of the event.
        while pos < payload.len() {
            self.gtid.event_num += 1;
            self.handler.prepare_row(&table, &self.gtid, hdr, event_type);
            pos += process_row_data(&mut *self.handler, &table, &payload[pos..], &col_present)?;
            self.handler.commit(&table, &self.gtid);

            if event_type == RowEvent::Update {
                self.gtid.event_num += 1;
                self.handler
                    .prepare_row(&table, &self.gtid, hdr, RowEvent::UpdateAfter);
                pos += process_row_data(&mut *self.handler, &table, &payload[pos..], &col_present)?;
                self.handler.commit(&table, &self.gtid);
            }
        }

        Ok(())
    }

    /// Returns true when the statement is a COMMIT.
    fn handle_query_event(&mut self, payload: &[u8]) -> Result<bool> {
        // Post-header: thread id (4), exec time (4), db length (1),
        // error code (2), status var block length (2).
        const DBNM_OFF: usize = 8;
        const VBLK_OFF: usize = 4 + 4 + 1 + 2;
        const PHDR_OFF: usize = 4 + 4 + 1 + 2 + 2;

        let short = || ReplicationError::Decode("short query event".into());

        let dblen = *payload.get(DBNM_OFF).ok_or_else(short)? as usize;
        let vblklen = u16::from_le_bytes(
            payload.get(VBLK_OFF..VBLK_OFF + 2).ok_or_else(short)?.try_into().unwrap(),
        ) as usize;

        let db_start = PHDR_OFF + vblklen;
        let sql_start = db_start + dblen + 1;

        let db = payload.get(db_start..db_start + dblen).ok_or_else(short)?;
        let sql = payload.get(sql_start..).ok_or_else(short)?;

        let db = String::from_utf8_lossy(db).into_owned();
        let sql = normalize_sql(&String::from_utf8_lossy(sql));

        if sql.eq_ignore_ascii_case("commit") {
            return Ok(true);
        }

        if statement_modifies_rows(&sql) {
            WARN_NOT_ROW_FORMAT.call_once(|| {
                warn!(
                    "Possible STATEMENT or MIXED format binary log. Check that 'binlog_format' \
                     is set to ROW on the master."
                );
            });
        } else {
            self.parse_sql(&sql, &db);
        }

        Ok(false)
    }

    //
    // DDL parsing
    //

    fn parse_sql(&mut self, sql: &str, db: &str) {
        info!("{}", sql);

        let tokens = tokenizer::tokenize(sql, &schema_sanitizer);
        let mut parser = Parser {
            db: db.to_string(),
            table: String::new(),
            tokens,
        };

        if let Err(e) = self.parse_statement(&mut parser) {
            info!("Parsing failed: {} ({})", e, sql);
        }
    }

    fn parse_statement(&mut self, p: &mut Parser) -> Result<()> {
        match p.chomp().ttype() {
            Type::Replace | Type::Create => {
                p.discard(&[Type::Or, Type::Replace]);
                p.assume(Type::Table)?;
                p.discard(&[Type::If, Type::Not, Type::Exists]);
                self.create_table(p)
            }
            Type::Alter => {
                p.discard(&[Type::Online, Type::Ignore]);
                p.assume(Type::Table)?;
                self.alter_table(p)
            }
            Type::Drop => {
                p.assume(Type::Table)?;
                p.discard(&[Type::If, Type::Exists]);
                self.drop_table(p)
            }
            Type::Rename => {
                p.assume(Type::Table)?;
                self.rename_table(p)
            }
            _ => Ok(()),
        }
    }

    fn create_table(&mut self, p: &mut Parser) -> Result<()> {
        p.table_identifier()?;

        if p.expect(&[Type::Like]) || p.expect(&[Type::Lp, Type::Like]) {
            // CREATE TABLE ... LIKE ...
            if p.chomp().ttype() == Type::Lp {
                p.chomp();
            }

            let new_db = p.db.clone();
            let new_table = p.table.clone();
            p.table_identifier()?;
            let old_db = p.db.clone();
            let old_table = p.table.clone();

            self.do_create_table_like(&old_db, &old_table, &new_db, &new_table);
        } else {
            // CREATE TABLE ...
            p.assume(Type::Lp)?;
            self.do_create_table(p)?;
        }

        Ok(())
    }

    fn drop_table(&mut self, p: &mut Parser) -> Result<()> {
        p.table_identifier()?;
        self.created_tables.remove(&p.ident());
        Ok(())
    }

    fn alter_table(&mut self, p: &mut Parser) -> Result<()> {
        p.table_identifier()?;

        let create = self
            .created_tables
            .get(&p.ident())
            .cloned()
            .ok_or_else(|| ReplicationError::Parse(format!("Table not found: {}", p.ident())))?;

        let mut updated = false;

        while p.next() != Type::Exhausted {
            match p.chomp().ttype() {
                Type::Add => {
                    p.discard(&[Type::Column, Type::If, Type::Not, Type::Exists]);

                    if p.next() == Type::Id || p.next() == Type::Lp {
                        self.alter_table_add_column(p, &create)?;
                        updated = true;
                    }
                }
                Type::Drop => {
                    p.discard(&[Type::Column, Type::If, Type::Exists]);

                    if p.next() == Type::Id {
                        let name = p.chomp().into_value();
                        self.do_drop_column(&create, &name, p)?;
                        p.discard(&[Type::Restrict, Type::Cascade]);
                        updated = true;
                    }
                }
                Type::Modify => {
                    p.discard(&[Type::Column, Type::If, Type::Exists]);

                    if p.next() == Type::Id {
                        let old_name = p.front().into_value();
                        self.do_change_column(p, &create, &old_name)?;
                        updated = true;
                    }
                }
                Type::Change => {
                    p.discard(&[Type::Column, Type::If, Type::Exists]);

                    if p.next() == Type::Id {
                        let old_name = p.chomp().into_value();
                        self.do_change_column(p, &create, &old_name)?;
                        updated = true;
                    }
                }
                Type::Rename => {
                    let old_db = p.db.clone();
                    let old_table = p.table.clone();
                    p.discard(&[Type::To]);

                    p.table_identifier()?;
                    let new_table = p.table.clone();
                    p.discard(&[Type::Comma]);

                    self.do_table_rename(&old_db, &old_table, &old_db, &new_table);
                }
                _ => {}
            }
        }

        // The table's GTID tracks the latest DDL statement so that
        // replication can be safely resumed from it.
        {
            let mut table = create.write().unwrap();
            table.gtid = self.gtid;
        }

        let reopen = updated && create.read().unwrap().is_open;

        if reopen {
            // The ALTER can modify several parts of the table, so the new
            // version is synced once the whole statement is processed, and
            // only if a row event had opened the table.
            let ident = create.read().unwrap().id();
            let version = self.next_version(&ident);

            let mut table = create.write().unwrap();
            table.version = version;
            table.is_open = false;
            self.handler.create_table(&table);
        }

        Ok(())
    }

    fn alter_table_add_column(&mut self, p: &mut Parser, create: &STable) -> Result<()> {
        if p.next() == Type::Lp {
            // ALTER TABLE ... ADD (column definition, ...)
            p.chomp();

            while p.next() != Type::Exhausted {
                let c = p.column_def()?;
                create.write().unwrap().columns.push(c);
            }
        } else {
            // ALTER TABLE ... ADD column definition [FIRST | AFTER ...]
            let c = p.column_def()?;
            self.do_add_column(create, c)?;
        }

        Ok(())
    }

    fn rename_table(&mut self, p: &mut Parser) -> Result<()> {
        loop {
            p.table_identifier()?;
            let old_db = p.db.clone();
            let old_table = p.table.clone();

            p.assume(Type::To)?;

            p.table_identifier()?;
            let new_db = p.db.clone();
            let new_table = p.table.clone();

            self.do_table_rename(&old_db, &old_table, &new_db, &new_table);

            p.discard(&[Type::Comma]);

            if p.next() == Type::Exhausted {
                return Ok(());
            }
        }
    }

    fn do_create_table(&mut self, p: &mut Parser) -> Result<()> {
        let mut columns = Vec::new();

        loop {
            columns.push(p.column_def()?);

            if p.next() != Type::Id {
                break;
            }
        }

        let table = Table::new(p.db.clone(), p.table.clone(), 0, columns, self.gtid);
        self.save_and_replace_table_create(table);
        Ok(())
    }

    fn do_create_table_like(&mut self, old_db: &str, old_table: &str, new_db: &str, new_table: &str) {
        let from = format!("{}.{}", old_db, old_table);

        match self.created_tables.get(&from) {
            Some(source) => {
                let columns = source.read().unwrap().columns.clone();
                let table = Table::new(new_db, new_table, 1, columns, self.gtid);
                self.save_and_replace_table_create(table);
            }
            None => {
                error!("Could not find source table {}.{}", old_db, old_table);
            }
        }
    }

    fn do_table_rename(&mut self, old_db: &str, old_table: &str, new_db: &str, new_table: &str) {
        let from = format!("{}.{}", old_db, old_table);

        if let Some(create) = self.created_tables.get(&from).cloned() {
            let renamed = {
                let mut table = create.write().unwrap();
                table.database = new_db.to_string();
                table.table = new_table.to_string();
                table.clone()
            };

            self.save_and_replace_table_create(renamed);
            // The old id is removed only after the new one is registered so
            // that at least one copy of the table exists at all times.
            self.created_tables.remove(&from);
        }
    }

    fn do_add_column(&mut self, create: &STable, c: Column) -> Result<()> {
        let mut table = create.write().unwrap();
        let cols = &mut table.columns;

        if c.first {
            cols.insert(0, c);
        } else if !c.after.is_empty() {
            let idx = cols
                .iter()
                .position(|a| a.name == c.after)
                .ok_or_else(|| {
                    ReplicationError::Parse(format!(
                        "Could not find field '{}' for ALTER TABLE ADD COLUMN ... AFTER",
                        c.after
                    ))
                })?;

            cols.insert(idx + 1, c);
        } else {
            cols.push(c);
        }

        Ok(())
    }

    fn do_drop_column(&mut self, create: &STable, name: &str, p: &Parser) -> Result<()> {
        let mut table = create.write().unwrap();
        let cols = &mut table.columns;

        let idx = cols.iter().position(|f| f.name == name).ok_or_else(|| {
            ReplicationError::Parse(format!(
                "Could not find field '{}' for table {}",
                name,
                p.ident()
            ))
        })?;

        cols.remove(idx);
        Ok(())
    }

    fn do_change_column(&mut self, p: &mut Parser, create: &STable, old_name: &str) -> Result<()> {
        let c = p.column_def()?;

        if c.first || !c.after.is_empty() {
            self.do_drop_column(create, old_name, p)?;
            self.do_add_column(create, c)?;
        } else {
            let mut table = create.write().unwrap();
            let cols = &mut table.columns;

            let idx = cols.iter().position(|a| a.name == old_name).ok_or_else(|| {
                ReplicationError::Parse(format!("Could not find column {}", old_name))
            })?;

            cols[idx] = c;
        }

        Ok(())
    }

    fn next_version(&mut self, ident: &str) -> i64 {
        let v = self.versions.entry(ident.to_string()).or_insert(0);
        *v += 1;
        *v
    }

    /// Register a new table version and notify the handler.
    fn save_and_replace_table_create(&mut self, mut created: Table) {
        let ident = created.id();
        created.version = self.next_version(&ident);
        created.is_open = false;

        self.handler.create_table(&created);
        self.created_tables
            .insert(ident, Arc::new(RwLock::new(created)));
    }
}

/// Leading-keyword classification of non-DDL statements. Stands in for a
/// full statement classifier; only used to warn about non-ROW binlogs.
fn statement_modifies_rows(sql: &str) -> bool {
    let word = sql
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    matches!(word.as_str(), "INSERT" | "UPDATE" | "DELETE" | "REPLACE")
}

/// Parser state shared by the grammar methods.
struct Parser {
    db: String,
    table: String,
    tokens: Chain,
}

impl Parser {
    fn ident(&self) -> String {
        format!("{}.{}", self.db, self.table)
    }

    fn next(&self) -> Type {
        self.tokens.front().ttype()
    }

    fn front(&self) -> Token {
        self.tokens.front()
    }

    fn chomp(&mut self) -> Token {
        self.tokens.chomp()
    }

    fn assume(&mut self, t: Type) -> Result<Token> {
        if self.next() != t {
            return Err(ReplicationError::Parse(format!(
                "Expected {:?}, got {}",
                t,
                self.tokens.front().describe()
            )));
        }

        Ok(self.chomp())
    }

    fn expect(&self, types: &[Type]) -> bool {
        let mut it = self.tokens.iter();

        for &t in types {
            match it.next() {
                Some(token) if token.ttype() == t => {}
                _ => return false,
            }
        }

        true
    }

    fn discard(&mut self, types: &[Type]) {
        while types.contains(&self.next()) {
            self.chomp();
        }
    }

    /// Skip a parenthesized section, balancing nested parentheses.
    fn parentheses(&mut self) -> Result<()> {
        if self.next() != Type::Lp {
            return Ok(());
        }

        self.chomp();
        let mut depth = 1;

        while self.next() != Type::Exhausted && depth > 0 {
            match self.chomp().ttype() {
                Type::Lp => depth += 1,
                Type::Rp => depth -= 1,
                _ => {}
            }
        }

        if depth > 0 {
            return Err(ReplicationError::Parse(
                "Could not find closing parenthesis".to_string(),
            ));
        }

        Ok(())
    }

    fn table_identifier(&mut self) -> Result<()> {
        if self.expect(&[Type::Id, Type::Dot, Type::Id]) {
            self.db = self.chomp().into_value();
            self.chomp();
            self.table = self.chomp().into_value();
        } else if self.expect(&[Type::Id]) {
            self.table = self.chomp().into_value();
        } else {
            return Err(ReplicationError::Parse(format!(
                "Syntax error, have {} expected identifier",
                self.tokens.front().describe()
            )));
        }

        Ok(())
    }

    /// Parse one column definition up to the next comma at depth zero.
    /// Unknown trailing attributes are skipped.
    fn column_def(&mut self) -> Result<Column> {
        let mut c = Column::new(self.assume(Type::Id)?.into_value());
        c.type_name = self.chomp().into_value();

        if let Some(length) = self.column_length()? {
            c.length = length;
        }

        while self.next() != Type::Exhausted {
            self.parentheses()?;

            match self.chomp().ttype() {
                Type::Unsigned => c.is_unsigned = true,
                Type::Comma => return Ok(c),
                Type::After => c.after = self.assume(Type::Id)?.into_value(),
                Type::First => c.first = true,
                _ => {}
            }
        }

        Ok(c)
    }

    /// A length declaration directly after the type token, e.g.
    /// `VARCHAR(255)` or `DECIMAL(10, 2)`. The first number is the length.
    fn column_length(&mut self) -> Result<Option<i64>> {
        if !self.expect(&[Type::Lp, Type::Id]) {
            return Ok(None);
        }

        let length = {
            let mut it = self.tokens.iter();
            it.next();
            it.next().and_then(|t| t.value().parse::<i64>().ok())
        };

        match length {
            Some(l) => {
                self.parentheses()?;
                Ok(Some(l))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::column::{COL_TYPE_LONG, COL_TYPE_TINY};
    use crate::schema::build_table_map_payload;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        CreateTable(String, i64, Vec<String>),
        OpenTable(String, i64),
        PrepareRow(String, RowEvent, u64),
        Int(usize, i32),
        Long(usize, i64),
        Str(usize, String),
        Null(usize),
        Commit(u64),
        Flush,
    }

    type Calls = std::sync::Arc<std::sync::Mutex<Vec<Call>>>;

    #[derive(Default)]
    struct Recorder {
        calls: Calls,
    }

    impl Recorder {
        fn with_handle() -> (Box<Recorder>, Calls) {
            let recorder = Recorder::default();
            let calls = recorder.calls.clone();
            (Box::new(recorder), calls)
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl RowEventHandler for Recorder {
        fn create_table(&mut self, table: &Table) -> bool {
            self.record(Call::CreateTable(
                table.id(),
                table.version,
                table.columns.iter().map(|c| c.name.clone()).collect(),
            ));
            true
        }

        fn open_table(&mut self, table: &Table) -> bool {
            self.record(Call::OpenTable(table.id(), table.version));
            true
        }

        fn prepare_table(&mut self, _table: &Table) -> bool {
            true
        }

        fn flush_tables(&mut self) {
            self.record(Call::Flush);
        }

        fn prepare_row(
            &mut self,
            table: &Table,
            gtid: &GtidPos,
            _hdr: &RepHeader,
            event_type: RowEvent,
        ) {
            self.record(Call::PrepareRow(table.id(), event_type, gtid.event_num));
        }

        fn commit(&mut self, _table: &Table, gtid: &GtidPos) -> bool {
            self.record(Call::Commit(gtid.event_num));
            true
        }

        fn column_int(&mut self, _t: &Table, i: usize, value: i32) {
            self.record(Call::Int(i, value));
        }

        fn column_long(&mut self, _t: &Table, i: usize, value: i64) {
            self.record(Call::Long(i, value));
        }

        fn column_float(&mut self, _t: &Table, _i: usize, _value: f32) {}

        fn column_double(&mut self, _t: &Table, _i: usize, _value: f64) {}

        fn column_string(&mut self, _t: &Table, i: usize, value: String) {
            self.record(Call::Str(i, value));
        }

        fn column_bytes(&mut self, _t: &Table, _i: usize, _value: Vec<u8>) {}

        fn column_null(&mut self, _t: &Table, i: usize) {
            self.record(Call::Null(i));
        }
    }

    fn new_rpl() -> (Rpl, Calls) {
        let (recorder, calls) = Recorder::with_handle();
        (Rpl::new(recorder, TableFilter::default()), calls)
    }

    /// A format description payload declaring a post-header length of 8 for
    /// every event type, checksums off.
    fn format_description_payload(checksum: u8) -> Vec<u8> {
        let mut payload = vec![0u8; FDE_EVENT_TYPES_OFFSET];
        payload[0] = 4; // binlog version
        payload[FDE_EVENT_TYPES_OFFSET - 1] = 19; // common header length
        payload.extend(std::iter::repeat(8u8).take(168));
        payload.push(checksum);
        payload.extend_from_slice(&[0, 0, 0, 0]);
        payload
    }

    fn header(event_type: u8) -> RepHeader {
        RepHeader {
            event_type,
            server_id: 3000,
            timestamp: 100,
            ..RepHeader::default()
        }
    }

    fn gtid_payload(domain: u32, seq: u64, flags: u8) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&seq.to_le_bytes());
        payload.extend_from_slice(&domain.to_le_bytes());
        payload.push(flags);
        payload
    }

    fn write_rows_payload(table_id: u64, ncolumns: usize, rows: &[&[u8]]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&table_id.to_le_bytes()[..6]);
        payload.extend_from_slice(&0u16.to_le_bytes()); // flags
        payload.push(ncolumns as u8); // length-encoded column count
        payload.extend(std::iter::repeat(0xffu8).take((ncolumns + 7) / 8));

        for row in rows {
            payload.push(0); // null bitmap, nothing null
            payload.extend_from_slice(row);
        }

        payload
    }

    fn setup_with_table(rpl: &mut Rpl, sql: &str) {
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(0))
            .unwrap();
        rpl.parse_sql(sql, "d");
    }

    #[test]
    fn create_table_registers_schema() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT UNSIGNED, b VARCHAR(10))");

        let table = rpl.table("d.t").unwrap();
        let table = table.read().unwrap();
        assert_eq!(table.version, 1);
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[0].name, "a");
        assert!(table.columns[0].is_unsigned);
        assert_eq!(table.columns[1].length, 10);
    }

    #[test]
    fn create_or_replace_and_if_not_exists() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE OR REPLACE TABLE t (a INT)");
        rpl.parse_sql("CREATE TABLE IF NOT EXISTS d.u (b INT)", "d");

        assert!(rpl.table("d.t").is_some());
        assert!(rpl.table("d.u").is_some());
    }

    #[test]
    fn create_table_like_copies_columns() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT, b INT)");
        rpl.parse_sql("CREATE TABLE d.u LIKE d.t", "d");

        let copy = rpl.table("d.u").unwrap();
        assert_eq!(copy.read().unwrap().columns.len(), 2);
    }

    #[test]
    fn drop_table_removes_schema() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT)");
        rpl.parse_sql("DROP TABLE IF EXISTS d.t", "d");
        assert!(rpl.table("d.t").is_none());
    }

    #[test]
    fn alter_add_drop_change() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT, b INT)");

        rpl.parse_sql("ALTER TABLE d.t ADD COLUMN c INT AFTER a", "d");
        let names = |rpl: &Rpl| -> Vec<String> {
            rpl.table("d.t")
                .unwrap()
                .read()
                .unwrap()
                .columns
                .iter()
                .map(|c| c.name.clone())
                .collect()
        };
        assert_eq!(names(&rpl), vec!["a", "c", "b"]);

        rpl.parse_sql("ALTER TABLE d.t DROP COLUMN a", "d");
        assert_eq!(names(&rpl), vec!["c", "b"]);

        rpl.parse_sql("ALTER TABLE d.t CHANGE COLUMN b b2 BIGINT", "d");
        assert_eq!(names(&rpl), vec!["c", "b2"]);

        // Dropping then re-adding without a placement hint appends.
        rpl.parse_sql("ALTER TABLE d.t DROP COLUMN c", "d");
        rpl.parse_sql("ALTER TABLE d.t ADD COLUMN c INT", "d");
        assert_eq!(names(&rpl), vec!["b2", "c"]);
    }

    #[test]
    fn alter_add_column_first_bumps_version_when_open() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT, b INT)");

        {
            let table = rpl.table("d.t").unwrap();
            table.write().unwrap().is_open = true;
        }

        rpl.parse_sql("ALTER TABLE t ADD COLUMN c INT FIRST", "d");

        let table = rpl.table("d.t").unwrap();
        let table = table.read().unwrap();
        let names: Vec<_> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(table.version, 2);
        assert!(!table.is_open);
    }

    #[test]
    fn alter_on_closed_table_keeps_version() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT)");
        rpl.parse_sql("ALTER TABLE d.t ADD COLUMN b INT", "d");

        let table = rpl.table("d.t").unwrap();
        assert_eq!(table.read().unwrap().version, 1);
    }

    #[test]
    fn rename_table_statement() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT)");
        rpl.parse_sql("RENAME TABLE d.t TO d.u", "d");

        assert!(rpl.table("d.t").is_none());
        let renamed = rpl.table("d.u").unwrap();
        assert_eq!(renamed.read().unwrap().version, 2);
    }

    #[test]
    fn unparseable_alter_leaves_state_alone() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT)");
        rpl.parse_sql("ALTER TABLE d.missing ADD COLUMN x INT", "d");
        assert!(rpl.table("d.missing").is_none());
    }

    #[test]
    fn write_rows_single_unsigned_tiny() {
        let (mut rpl, calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (col0 TINYINT UNSIGNED)");

        let map = build_table_map_payload(100, "d", "t", &[COL_TYPE_TINY], &[]);
        rpl.handle_event(&header(TABLE_MAP_EVENT), &map).unwrap();

        let rows = write_rows_payload(100, 1, &[&[0xff]]);
        rpl.handle_event(&header(WRITE_ROWS_EVENT_V1), &rows).unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            &calls[calls.len() - 3..],
            &[
                Call::PrepareRow("d.t".into(), RowEvent::Write, 1),
                Call::Int(0, 255),
                Call::Commit(1),
            ]
        );
    }

    #[test]
    fn update_rows_emit_before_and_after_images() {
        let (mut rpl, calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT)");

        let map = build_table_map_payload(5, "d", "t", &[COL_TYPE_LONG], &[]);
        rpl.handle_event(&header(TABLE_MAP_EVENT), &map).unwrap();

        // One updated row: before image 1, after image 2. The update event
        // carries both column bitmaps.
        let mut payload = Vec::new();
        payload.extend_from_slice(&5u64.to_le_bytes()[..6]);
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.push(1); // column count
        payload.push(0xff); // present bitmap
        payload.push(0xff); // after-image bitmap
        payload.push(0); // null bitmap (before)
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.push(0); // null bitmap (after)
        payload.extend_from_slice(&2i32.to_le_bytes());

        rpl.handle_event(&header(UPDATE_ROWS_EVENT_V1), &payload).unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            &calls[calls.len() - 6..],
            &[
                Call::PrepareRow("d.t".into(), RowEvent::Update, 1),
                Call::Long(0, 1),
                Call::Commit(1),
                Call::PrepareRow("d.t".into(), RowEvent::UpdateAfter, 2),
                Call::Long(0, 2),
                Call::Commit(2),
            ]
        );
    }

    #[test]
    fn row_event_without_table_map_is_dropped() {
        let (mut rpl, calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT)");

        let rows = write_rows_payload(42, 1, &[&1i32.to_le_bytes()]);
        rpl.handle_event(&header(WRITE_ROWS_EVENT_V1), &rows).unwrap();

        assert!(!calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, Call::PrepareRow(..))));
    }

    #[test]
    fn column_count_mismatch_drops_rows() {
        let (mut rpl, calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT, b INT)");

        let map = build_table_map_payload(9, "d", "t", &[COL_TYPE_LONG, COL_TYPE_LONG], &[]);
        rpl.handle_event(&header(TABLE_MAP_EVENT), &map).unwrap();

        // Row event claiming a single column.
        let rows = write_rows_payload(9, 1, &[&1i32.to_le_bytes()]);
        rpl.handle_event(&header(WRITE_ROWS_EVENT_V1), &rows).unwrap();

        assert!(!calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, Call::PrepareRow(..))));
    }

    #[test]
    fn gtid_and_commit_outcomes() {
        let (mut rpl, _calls) = new_rpl();
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(0))
            .unwrap();

        let outcome = rpl
            .handle_event(&header(GTID_EVENT), &gtid_payload(0, 10, 0))
            .unwrap();
        assert!(outcome.safe_stop);
        assert!(!outcome.commit);
        assert_eq!(rpl.gtid().seq, 10);
        assert_eq!(rpl.gtid().server_id, 3000);

        let outcome = rpl.handle_event(&header(XID_EVENT), &8u64.to_le_bytes()).unwrap();
        assert!(outcome.commit);
        assert!(outcome.safe_stop);
    }

    fn query_payload(db: &str, sql: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0; 4]); // thread id
        payload.extend_from_slice(&[0; 4]); // exec time
        payload.push(db.len() as u8);
        payload.extend_from_slice(&[0; 2]); // error code
        payload.extend_from_slice(&0u16.to_le_bytes()); // status block len
        payload.extend_from_slice(db.as_bytes());
        payload.push(0);
        payload.extend_from_slice(sql.as_bytes());
        payload
    }

    #[test]
    fn query_commit_detection() {
        let (mut rpl, _calls) = new_rpl();
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(0))
            .unwrap();

        let outcome = rpl
            .handle_event(&header(QUERY_EVENT), &query_payload("d", "COMMIT"))
            .unwrap();
        assert!(outcome.commit);
    }

    #[test]
    fn implicit_commit_applies_to_next_query() {
        let (mut rpl, _calls) = new_rpl();
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(0))
            .unwrap();

        rpl.handle_event(
            &header(GTID_EVENT),
            &gtid_payload(0, 11, GTID_IMPLICIT_COMMIT_FLAG),
        )
        .unwrap();

        let outcome = rpl
            .handle_event(
                &header(QUERY_EVENT),
                &query_payload("d", "CREATE TABLE d.t (a INT)"),
            )
            .unwrap();
        assert!(outcome.commit);

        // The flag is consumed.
        let outcome = rpl
            .handle_event(&header(QUERY_EVENT), &query_payload("d", "SELECT 1"))
            .unwrap();
        assert!(!outcome.commit);
    }

    #[test]
    fn query_event_parses_ddl() {
        let (mut rpl, _calls) = new_rpl();
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(0))
            .unwrap();

        rpl.handle_event(
            &header(QUERY_EVENT),
            &query_payload("d", "CREATE TABLE t (a INT)"),
        )
        .unwrap();

        assert!(rpl.table("d.t").is_some());
    }

    #[test]
    fn checksums_strip_trailing_bytes() {
        let (mut rpl, _calls) = new_rpl();
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(1))
            .unwrap();
        assert!(rpl.have_checksums());

        // GTID payload with 4 trailing checksum bytes.
        let mut payload = gtid_payload(3, 7, 0);
        payload.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        rpl.handle_event(&header(GTID_EVENT), &payload).unwrap();
        assert_eq!(rpl.gtid().domain, 3);
    }

    struct OneShotFetcher(Option<String>);

    impl SchemaFetcher for OneShotFetcher {
        fn fetch_create_table(&mut self, _ident: &str) -> Option<String> {
            self.0.take()
        }
    }

    #[test]
    fn table_map_fetches_missing_schema() {
        let (mut rpl, calls) = new_rpl();
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(0))
            .unwrap();
        rpl.set_fetcher(Box::new(OneShotFetcher(Some(
            "CREATE TABLE `t` (`a` INT)".to_string(),
        ))));

        let map = build_table_map_payload(55, "d", "t", &[COL_TYPE_LONG], &[]);
        rpl.handle_event(&header(TABLE_MAP_EVENT), &map).unwrap();

        assert!(rpl.table("d.t").is_some());

        let rows = write_rows_payload(55, 1, &[&7i32.to_le_bytes()]);
        rpl.handle_event(&header(WRITE_ROWS_EVENT_V1), &rows).unwrap();

        assert!(calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, Call::Long(0, 7))));
    }

    #[test]
    fn filtered_tables_are_ignored() {
        let filter = TableFilter::new(None, Some(regex::Regex::new("^d\\.t$").unwrap()));
        let (recorder, calls) = Recorder::with_handle();
        let mut rpl = Rpl::new(recorder, filter);
        rpl.handle_event(&header(FORMAT_DESCRIPTION_EVENT), &format_description_payload(0))
            .unwrap();
        rpl.parse_sql("CREATE TABLE d.t (a INT)", "d");

        let map = build_table_map_payload(3, "d", "t", &[COL_TYPE_LONG], &[]);
        rpl.handle_event(&header(TABLE_MAP_EVENT), &map).unwrap();

        let rows = write_rows_payload(3, 1, &[&1i32.to_le_bytes()]);
        rpl.handle_event(&header(WRITE_ROWS_EVENT_V1), &rows).unwrap();

        assert!(!calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, Call::PrepareRow(..))));
    }

    #[test]
    fn dummy_row_event_releases_maps() {
        let (mut rpl, _calls) = new_rpl();
        setup_with_table(&mut rpl, "CREATE TABLE d.t (a INT)");

        let map = build_table_map_payload(8, "d", "t", &[COL_TYPE_LONG], &[]);
        rpl.handle_event(&header(TABLE_MAP_EVENT), &map).unwrap();
        assert!(!rpl.active_maps.is_empty());

        let mut payload = Vec::new();
        payload.extend_from_slice(&TABLE_DUMMY_ID.to_le_bytes()[..6]);
        payload.extend_from_slice(&ROW_EVENT_END_STATEMENT.to_le_bytes());

        rpl.handle_event(&header(WRITE_ROWS_EVENT_V1), &payload).unwrap();
        assert!(rpl.active_maps.is_empty());
    }

    #[test]
    fn load_metadata_restores_latest_versions() {
        let dir = std::env::temp_dir().join(format!("rpl_meta_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        for version in 1..=2 {
            let table = Table::new(
                "d",
                "t",
                version,
                vec![Column::with_type("a", "int")],
                GtidPos::default(),
            );
            table.serialize(&dir).unwrap();
        }

        let (mut rpl, _calls) = new_rpl();
        rpl.load_metadata(&dir);

        let table = rpl.table("d.t").unwrap();
        assert_eq!(table.read().unwrap().version, 2);

        // The next version continues from the stored one.
        rpl.parse_sql("CREATE TABLE d.t (a INT, b INT)", "d");
        assert_eq!(rpl.table("d.t").unwrap().read().unwrap().version, 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
