use nom::number::complete::{le_u16, le_u32, le_u8};
use nom::IResult;
use serde::Serialize;

/// Length of the common event header.
pub const BINLOG_EVENT_HDR_LEN: u32 = 19;

/// Table id that marks a dummy row event releasing all table maps.
pub const TABLE_DUMMY_ID: u64 = 0x00ffffff;

/// Row event flag: last statement of the current binlog statement group.
pub const ROW_EVENT_END_STATEMENT: u16 = 0x0001;

/// Flag carried by a GTID event when the statement performs an implicit
/// commit.
pub const GTID_IMPLICIT_COMMIT_FLAG: u8 = 0x1;

// Event type codes, MariaDB numbering.
pub const QUERY_EVENT: u8 = 2;
pub const ROTATE_EVENT: u8 = 4;
pub const USER_VAR_EVENT: u8 = 14;
pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
pub const XID_EVENT: u8 = 16;
pub const TABLE_MAP_EVENT: u8 = 19;
pub const WRITE_ROWS_EVENT_V0: u8 = 20;
pub const UPDATE_ROWS_EVENT_V0: u8 = 21;
pub const DELETE_ROWS_EVENT_V0: u8 = 22;
pub const WRITE_ROWS_EVENT_V1: u8 = 23;
pub const UPDATE_ROWS_EVENT_V1: u8 = 24;
pub const DELETE_ROWS_EVENT_V1: u8 = 25;
pub const HEARTBEAT_EVENT: u8 = 27;
pub const WRITE_ROWS_EVENT_V2: u8 = 30;
pub const UPDATE_ROWS_EVENT_V2: u8 = 31;
pub const DELETE_ROWS_EVENT_V2: u8 = 32;
pub const GTID_EVENT: u8 = 162;
pub const GTID_LIST_EVENT: u8 = 163;

/// Header of one replicated event as received from the upstream.
///
/// ```text
///                      [startPos : Len]
/// +=====================================+
/// | event  | timestamp         0 : 4    |
/// | header +----------------------------+
/// |        | event_type        4 : 1    |
/// |        +----------------------------+
/// |        | server_id         5 : 4    |
/// |        +----------------------------+
/// |        | event_size        9 : 4    | header + post-header + body
/// |        +----------------------------+
/// |        | next_pos         13 : 4    |
/// |        +----------------------------+
/// |        | flags            17 : 2    |
/// +=====================================+
/// ```
///
/// `payload_len`, `seqno` and `ok` come from the wrapping replication
/// packet, not from the binlog itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepHeader {
    pub payload_len: u32,
    pub seqno: u8,
    pub ok: u8,
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_size: u32,
    pub next_pos: u32,
    pub flags: u16,
}

impl RepHeader {
    /// Parse the 19 byte event header.
    pub fn parse(input: &[u8]) -> IResult<&[u8], RepHeader> {
        let (i, timestamp) = le_u32(input)?;
        let (i, event_type) = le_u8(i)?;
        let (i, server_id) = le_u32(i)?;
        let (i, event_size) = le_u32(i)?;
        let (i, next_pos) = le_u32(i)?;
        let (i, flags) = le_u16(i)?;

        Ok((
            i,
            RepHeader {
                payload_len: event_size + 4,
                seqno: 0,
                ok: 0,
                timestamp,
                event_type,
                server_id,
                event_size,
                next_pos,
                flags,
            },
        ))
    }

    /// `next_pos == 0` is allowed, it is used by artificial events.
    pub fn position_is_consistent(&self, file_pos: u32) -> bool {
        self.next_pos == 0 || self.next_pos == file_pos + self.event_size
    }
}

pub fn is_row_event(event_type: u8) -> bool {
    (WRITE_ROWS_EVENT_V0..=DELETE_ROWS_EVENT_V1).contains(&event_type)
        || (WRITE_ROWS_EVENT_V2..=DELETE_ROWS_EVENT_V2).contains(&event_type)
}

pub fn is_update_event(event_type: u8) -> bool {
    matches!(
        event_type,
        UPDATE_ROWS_EVENT_V0 | UPDATE_ROWS_EVENT_V1 | UPDATE_ROWS_EVENT_V2
    )
}

/// v2 row events carry an extra variable-length data block after the flags.
pub fn is_v2_row_event(event_type: u8) -> bool {
    (WRITE_ROWS_EVENT_V2..=DELETE_ROWS_EVENT_V2).contains(&event_type)
}

#[cfg(test)]
mod test {
    use super::*;

    fn header_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x5f00_0000u32.to_le_bytes()); // timestamp
        buf.push(TABLE_MAP_EVENT);
        buf.extend_from_slice(&3000u32.to_le_bytes()); // server id
        buf.extend_from_slice(&52u32.to_le_bytes()); // event size
        buf.extend_from_slice(&1000u32.to_le_bytes()); // next pos
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf
    }

    #[test]
    fn parse_header() {
        let bytes = header_bytes();
        let (rest, hdr) = RepHeader::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(hdr.event_type, TABLE_MAP_EVENT);
        assert_eq!(hdr.server_id, 3000);
        assert_eq!(hdr.event_size, 52);
        assert_eq!(hdr.next_pos, 1000);
    }

    #[test]
    fn position_consistency() {
        let bytes = header_bytes();
        let (_, hdr) = RepHeader::parse(&bytes).unwrap();
        assert!(hdr.position_is_consistent(1000 - 52));
        assert!(!hdr.position_is_consistent(4));

        let artificial = RepHeader {
            next_pos: 0,
            ..hdr
        };
        assert!(artificial.position_is_consistent(4));
    }

    #[test]
    fn row_event_classification() {
        assert!(is_row_event(WRITE_ROWS_EVENT_V1));
        assert!(is_row_event(DELETE_ROWS_EVENT_V2));
        assert!(!is_row_event(TABLE_MAP_EVENT));
        assert!(is_update_event(UPDATE_ROWS_EVENT_V1));
        assert!(!is_update_event(WRITE_ROWS_EVENT_V1));
        assert!(is_v2_row_event(UPDATE_ROWS_EVENT_V2));
        assert!(!is_v2_row_event(UPDATE_ROWS_EVENT_V1));
    }
}
