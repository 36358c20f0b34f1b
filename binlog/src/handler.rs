use crate::event::RepHeader;
use crate::gtid::GtidPos;
use crate::schema::Table;

/// Row event types that map to INSERT, UPDATE and DELETE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEvent {
    /// A row was added.
    Write,
    /// The before image of a row.
    Update,
    /// The after image of a row.
    UpdateAfter,
    /// The row that was deleted.
    Delete,
}

impl RowEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowEvent::Write => "insert",
            RowEvent::Update => "update_before",
            RowEvent::UpdateAfter => "update_after",
            RowEvent::Delete => "delete",
        }
    }
}

/// Consumer of decoded row events.
///
/// For every row the decoder calls `prepare_row`, one `column_*` per column
/// in schema order, and finally `commit`. Sinks may buffer records but must
/// have persisted everything by the time `flush_tables` returns.
pub trait RowEventHandler: Send {
    /// Sinks that persist the replication position externally return it
    /// here on startup; it overrides the state file.
    fn load_latest_gtid(&mut self) -> Option<GtidPos> {
        None
    }

    /// A table was created or altered.
    fn create_table(&mut self, table: &Table) -> bool;

    /// A table was used for the first time.
    fn open_table(&mut self, table: &Table) -> bool;

    /// Prepare a table for row processing.
    fn prepare_table(&mut self, table: &Table) -> bool;

    /// Durability barrier, called at transaction commit boundaries.
    fn flush_tables(&mut self);

    /// Begin a new record.
    fn prepare_row(&mut self, table: &Table, gtid: &GtidPos, hdr: &RepHeader, event_type: RowEvent);

    /// Called once all columns are processed.
    fn commit(&mut self, table: &Table, gtid: &GtidPos) -> bool;

    // Integer handler for types up to 32 bits.
    fn column_int(&mut self, table: &Table, i: usize, value: i32);

    // Integer handler for long integer types.
    fn column_long(&mut self, table: &Table, i: usize, value: i64);

    fn column_float(&mut self, table: &Table, i: usize, value: f32);

    fn column_double(&mut self, table: &Table, i: usize, value: f64);

    fn column_string(&mut self, table: &Table, i: usize, value: String);

    fn column_bytes(&mut self, table: &Table, i: usize, value: Vec<u8>);

    fn column_null(&mut self, table: &Table, i: usize);
}
