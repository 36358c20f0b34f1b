use std::sync::Once;

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::handler::RowEventHandler;
use crate::schema::Table;
use common::err::{ReplicationError, Result};

// Column type codes used in TABLE_MAP events.
pub const COL_TYPE_DECIMAL: u8 = 0;
pub const COL_TYPE_TINY: u8 = 1;
pub const COL_TYPE_SHORT: u8 = 2;
pub const COL_TYPE_LONG: u8 = 3;
pub const COL_TYPE_FLOAT: u8 = 4;
pub const COL_TYPE_DOUBLE: u8 = 5;
pub const COL_TYPE_NULL: u8 = 6;
pub const COL_TYPE_TIMESTAMP: u8 = 7;
pub const COL_TYPE_LONGLONG: u8 = 8;
pub const COL_TYPE_INT24: u8 = 9;
pub const COL_TYPE_DATE: u8 = 10;
pub const COL_TYPE_TIME: u8 = 11;
pub const COL_TYPE_DATETIME: u8 = 12;
pub const COL_TYPE_YEAR: u8 = 13;
pub const COL_TYPE_NEWDATE: u8 = 14;
pub const COL_TYPE_VARCHAR: u8 = 15;
pub const COL_TYPE_BIT: u8 = 16;
pub const COL_TYPE_TIMESTAMP2: u8 = 17;
pub const COL_TYPE_DATETIME2: u8 = 18;
pub const COL_TYPE_TIME2: u8 = 19;
pub const COL_TYPE_NEWDECIMAL: u8 = 246;
pub const COL_TYPE_ENUM: u8 = 247;
pub const COL_TYPE_SET: u8 = 248;
pub const COL_TYPE_TINY_BLOB: u8 = 249;
pub const COL_TYPE_MEDIUM_BLOB: u8 = 250;
pub const COL_TYPE_LONG_BLOB: u8 = 251;
pub const COL_TYPE_BLOB: u8 = 252;
pub const COL_TYPE_VAR_STRING: u8 = 253;
pub const COL_TYPE_STRING: u8 = 254;
pub const COL_TYPE_GEOMETRY: u8 = 255;

static WARN_BIT: Once = Once::new();

pub fn column_type_to_string(col_type: u8) -> &'static str {
    match col_type {
        COL_TYPE_DECIMAL => "DECIMAL",
        COL_TYPE_TINY => "TINY",
        COL_TYPE_SHORT => "SHORT",
        COL_TYPE_LONG => "LONG",
        COL_TYPE_FLOAT => "FLOAT",
        COL_TYPE_DOUBLE => "DOUBLE",
        COL_TYPE_NULL => "NULL",
        COL_TYPE_TIMESTAMP => "TIMESTAMP",
        COL_TYPE_LONGLONG => "LONGLONG",
        COL_TYPE_INT24 => "INT24",
        COL_TYPE_DATE => "DATE",
        COL_TYPE_TIME => "TIME",
        COL_TYPE_DATETIME => "DATETIME",
        COL_TYPE_YEAR => "YEAR",
        COL_TYPE_NEWDATE => "NEWDATE",
        COL_TYPE_VARCHAR => "VARCHAR",
        COL_TYPE_BIT => "BIT",
        COL_TYPE_TIMESTAMP2 => "TIMESTAMP2",
        COL_TYPE_DATETIME2 => "DATETIME2",
        COL_TYPE_TIME2 => "TIME2",
        COL_TYPE_NEWDECIMAL => "NEWDECIMAL",
        COL_TYPE_ENUM => "ENUM",
        COL_TYPE_SET => "SET",
        COL_TYPE_TINY_BLOB => "TINY_BLOB",
        COL_TYPE_MEDIUM_BLOB => "MEDIUM_BLOB",
        COL_TYPE_LONG_BLOB => "LONG_BLOB",
        COL_TYPE_BLOB => "BLOB",
        COL_TYPE_VAR_STRING => "VAR_STRING",
        COL_TYPE_STRING => "STRING",
        COL_TYPE_GEOMETRY => "GEOMETRY",
        _ => "UNKNOWN",
    }
}

/// Length of the TABLE_MAP metadata block for one column of this type.
pub fn metadata_len(col_type: u8) -> usize {
    match col_type {
        COL_TYPE_STRING | COL_TYPE_VAR_STRING | COL_TYPE_VARCHAR | COL_TYPE_DECIMAL
        | COL_TYPE_NEWDECIMAL | COL_TYPE_ENUM | COL_TYPE_SET | COL_TYPE_BIT => 2,

        COL_TYPE_BLOB | COL_TYPE_FLOAT | COL_TYPE_DOUBLE | COL_TYPE_DATETIME2
        | COL_TYPE_TIMESTAMP2 | COL_TYPE_TIME2 | COL_TYPE_TINY_BLOB | COL_TYPE_MEDIUM_BLOB
        | COL_TYPE_LONG_BLOB | COL_TYPE_GEOMETRY => 1,

        _ => 0,
    }
}

pub fn column_is_blob(col_type: u8) -> bool {
    matches!(
        col_type,
        COL_TYPE_TINY_BLOB | COL_TYPE_MEDIUM_BLOB | COL_TYPE_LONG_BLOB | COL_TYPE_BLOB
    )
}

/// Values of these types carry a 1 or 2 byte length prefix in the row image.
pub fn column_is_variable_string(col_type: u8) -> bool {
    matches!(
        col_type,
        COL_TYPE_DECIMAL
            | COL_TYPE_VARCHAR
            | COL_TYPE_BIT
            | COL_TYPE_NEWDECIMAL
            | COL_TYPE_VAR_STRING
            | COL_TYPE_GEOMETRY
    )
}

pub fn column_is_fixed_string(col_type: u8) -> bool {
    col_type == COL_TYPE_STRING
}

pub fn column_is_temporal(col_type: u8) -> bool {
    matches!(
        col_type,
        COL_TYPE_YEAR
            | COL_TYPE_DATE
            | COL_TYPE_TIME
            | COL_TYPE_TIME2
            | COL_TYPE_DATETIME
            | COL_TYPE_DATETIME2
            | COL_TYPE_TIMESTAMP
            | COL_TYPE_TIMESTAMP2
    )
}

pub fn column_is_decimal(col_type: u8) -> bool {
    col_type == COL_TYPE_NEWDECIMAL
}

pub fn fixed_string_is_enum(col_type: u8) -> bool {
    col_type == COL_TYPE_ENUM || col_type == COL_TYPE_SET
}

/// Check a bit in a column bitmap.
pub fn bit_is_set(bitmap: &[u8], index: usize) -> bool {
    (bitmap[index / 8]) & (1 << (index % 8)) != 0
}

/// Big-endian integer of 1..=8 bytes.
pub fn unpack_bytes(data: &[u8]) -> u64 {
    let mut val = 0u64;
    for &b in data {
        val = (val << 8) | b as u64;
    }
    val
}

fn le_u16_at(data: &[u8]) -> u16 {
    LittleEndian::read_u16(data)
}

fn le_u24_at(data: &[u8]) -> u32 {
    LittleEndian::read_u24(data)
}

fn le_u32_at(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

fn le_u64_at(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

/// Length-encoded integer, returns (value, bytes consumed).
pub fn leint(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| ReplicationError::Decode("empty length-encoded integer".into()))?;

    let needed = match first {
        0xfb => return Ok((0, 1)), // NULL marker
        0xfc => 3,
        0xfd => 4,
        0xfe => 9,
        _ => return Ok((first as u64, 1)),
    };

    if data.len() < needed {
        return Err(ReplicationError::Decode(
            "truncated length-encoded integer".into(),
        ));
    }

    let val = match first {
        0xfc => le_u16_at(&data[1..]) as u64,
        0xfd => le_u24_at(&data[1..]) as u64,
        _ => le_u64_at(&data[1..]),
    };

    Ok((val, needed))
}

const DATETIME2_OFFSET: i64 = 0x8000000000;

fn fractional_seconds(data: &[u8], decimals: u8) -> (u32, usize) {
    if decimals == 0 {
        return (0, 0);
    }

    let bytes = ((decimals as usize) + 1) / 2;
    let raw = unpack_bytes(&data[..bytes]);
    let scale = 10u64.pow(6 - decimals as u32);

    ((raw * scale) as u32, bytes)
}

fn format_fraction(base: String, us: u32, decimals: u8) -> String {
    if decimals == 0 {
        base
    } else {
        format!("{}.{:06}", base, us)
    }
}

/// Size of a temporal value in the row image.
pub fn temporal_field_size(col_type: u8, decimals: u8) -> usize {
    match col_type {
        COL_TYPE_YEAR => 1,
        COL_TYPE_TIME | COL_TYPE_DATE => 3,
        COL_TYPE_TIME2 => 3 + ((decimals as usize) + 1) / 2,
        COL_TYPE_DATETIME => 8,
        COL_TYPE_TIMESTAMP => 4,
        COL_TYPE_TIMESTAMP2 => 4 + ((decimals as usize) + 1) / 2,
        COL_TYPE_DATETIME2 => 5 + ((decimals as usize) + 1) / 2,
        _ => 0,
    }
}

/// The old DATETIME packs YYYYMMDDHHMMSS as a base-100 integer.
fn unpack_datetime(data: &[u8]) -> String {
    let mut val = le_u64_at(data);

    let second = val % 100;
    val /= 100;
    let minute = val % 100;
    val /= 100;
    let hour = val % 100;
    val /= 100;
    let day = val % 100;
    val /= 100;
    let month = val % 100;
    val /= 100;
    let year = val;

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year, month, day, hour, minute, second
    )
}

fn unpack_datetime2(data: &[u8], decimals: u8) -> String {
    let mut packed = unpack_bytes(&data[..5]) as i64 - DATETIME2_OFFSET;
    if packed < 0 {
        packed = -packed;
    }

    let date = (packed >> 17) as u64;
    let yearmonth = date >> 5;
    let time = (packed % (1 << 17)) as u64;

    let base = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        yearmonth / 13,
        yearmonth % 13,
        date % (1 << 5),
        time >> 12,
        (time >> 6) % (1 << 6),
        time % (1 << 6)
    );

    let (us, _) = fractional_seconds(&data[5..], decimals);
    format_fraction(base, us, decimals)
}

/// Timestamps are seconds since the epoch, stored big-endian. The zero value
/// renders as the zero date.
fn unpack_timestamp(data: &[u8], decimals: u8) -> String {
    let t = unpack_bytes(&data[..4]) as i64;

    let base = if t == 0 {
        "0-00-00 00:00:00".to_string()
    } else {
        let days = t / 86_400;
        let secs = t % 86_400;
        let (year, month, day) = civil_from_days(days);
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year,
            month,
            day,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        )
    };

    let (us, _) = fractional_seconds(&data[4..], decimals);
    format_fraction(base, us, decimals)
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;

    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// The old TIME packs HHMMSS as a base-100 integer.
fn unpack_time(data: &[u8]) -> String {
    let mut val = le_u24_at(data) as u64;

    let second = val % 100;
    val /= 100;
    let minute = val % 100;
    val /= 100;
    let hour = val;

    format!("{:02}:{:02}:{:02}", hour, minute, second)
}

fn unpack_time2(data: &[u8], decimals: u8) -> String {
    let val = (unpack_bytes(&data[..3]) as i64 - 0x800000).unsigned_abs();

    let base = format!(
        "{:02}:{:02}:{:02}",
        (val >> 12) % (1 << 10),
        (val >> 6) % (1 << 6),
        val % (1 << 6)
    );

    let (us, _) = fractional_seconds(&data[3..], decimals);
    format_fraction(base, us, decimals)
}

fn unpack_date(data: &[u8]) -> String {
    let val = le_u24_at(data) as u64;
    format!(
        "{:04}-{:02}-{:02}",
        val >> 9,
        (val >> 5) & 15,
        val & 31
    )
}

fn unpack_year(data: &[u8]) -> String {
    if data[0] == 0 {
        "0000".to_string()
    } else {
        format!("{:04}", 1900 + data[0] as u32)
    }
}

/// Unpack a temporal value into its string form. Returns the rendered value
/// and the number of bytes consumed.
pub fn unpack_temporal_value(col_type: u8, data: &[u8], decimals: u8) -> (String, usize) {
    let size = temporal_field_size(col_type, decimals);

    let value = match col_type {
        COL_TYPE_YEAR => unpack_year(data),
        COL_TYPE_DATETIME => unpack_datetime(data),
        COL_TYPE_DATETIME2 => unpack_datetime2(data, decimals),
        COL_TYPE_TIME => unpack_time(data),
        COL_TYPE_TIME2 => unpack_time2(data, decimals),
        COL_TYPE_DATE => unpack_date(data),
        COL_TYPE_TIMESTAMP | COL_TYPE_TIMESTAMP2 => unpack_timestamp(data, decimals),
        _ => String::new(),
    };

    (value, size)
}

const DIG_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
const DEC_DIG: usize = 9;

fn decimal_part_bytes(digits: usize) -> usize {
    (digits / DEC_DIG) * 4 + DIG_BYTES[digits % DEC_DIG]
}

/// The on-disk size of a DECIMAL(precision, decimals) value.
pub fn decimal_field_size(precision: usize, decimals: usize) -> usize {
    decimal_part_bytes(precision - decimals) + decimal_part_bytes(decimals)
}

/// Unpack a packed-BCD DECIMAL into a double. Returns the value and the
/// field size in bytes. The sign lives in the top bit of the first byte;
/// negative values store the one's complement of the digits.
pub fn unpack_decimal_field(data: &[u8], precision: usize, decimals: usize) -> (f64, usize) {
    let ibytes = decimal_part_bytes(precision - decimals);
    let fbytes = decimal_part_bytes(decimals);
    let field_size = ibytes + fbytes;

    if field_size == 0 {
        return (0.0, 0);
    }

    let mut buf = data[..field_size].to_vec();

    let negative = (buf[0] & 0x80) == 0;
    buf[0] ^= 0x80;

    if negative {
        for b in buf.iter_mut() {
            *b = !*b;
        }
    }

    // Only the low 8 bytes of an oversized integer part fit in an i64.
    let istart = ibytes.saturating_sub(8);

    let val_i = unpack_bytes(&buf[istart..ibytes]) as i64;
    let val_f = if fbytes > 0 {
        unpack_bytes(&buf[ibytes..ibytes + fbytes]) as i64
    } else {
        0
    };

    let mut value = val_i as f64 + (val_f as f64) / 10f64.powi(decimals as i32);

    if negative {
        value = -value;
    }

    (value, field_size)
}

/// Dispatch one numeric value to the handler, honoring signedness.
fn set_numeric_field_value(
    handler: &mut dyn RowEventHandler,
    table: &Table,
    idx: usize,
    data: &[u8],
) -> Result<usize> {
    let col_type = table.column_types[idx];
    let is_unsigned = table.columns[idx].is_unsigned;

    let needed = match col_type {
        COL_TYPE_TINY => 1,
        COL_TYPE_SHORT => 2,
        COL_TYPE_INT24 => 3,
        COL_TYPE_LONG | COL_TYPE_FLOAT => 4,
        COL_TYPE_LONGLONG | COL_TYPE_DOUBLE => 8,
        _ => 0,
    };

    if data.len() < needed {
        return Err(ReplicationError::Decode(format!(
            "truncated {} value",
            column_type_to_string(col_type)
        )));
    }

    let size = match col_type {
        COL_TYPE_TINY => {
            if is_unsigned {
                handler.column_int(table, idx, data[0] as i32);
            } else {
                handler.column_int(table, idx, data[0] as i8 as i32);
            }
            1
        }
        COL_TYPE_SHORT => {
            let raw = le_u16_at(data);
            if is_unsigned {
                handler.column_int(table, idx, raw as i32);
            } else {
                handler.column_int(table, idx, raw as i16 as i32);
            }
            2
        }
        COL_TYPE_INT24 => {
            let raw = le_u24_at(data);
            if is_unsigned {
                handler.column_int(table, idx, raw as i32);
            } else {
                let signed = if raw & 0x800000 != 0 {
                    -(((!raw & 0xffffff) + 1) as i32)
                } else {
                    raw as i32
                };
                handler.column_int(table, idx, signed);
            }
            3
        }
        COL_TYPE_LONG => {
            let raw = le_u32_at(data);
            if is_unsigned {
                handler.column_long(table, idx, raw as i64);
            } else {
                handler.column_long(table, idx, raw as i32 as i64);
            }
            4
        }
        COL_TYPE_LONGLONG => {
            handler.column_long(table, idx, le_u64_at(data) as i64);
            8
        }
        COL_TYPE_FLOAT => {
            handler.column_float(table, idx, f32::from_le_bytes(data[0..4].try_into().unwrap()));
            4
        }
        COL_TYPE_DOUBLE => {
            handler.column_double(table, idx, f64::from_le_bytes(data[0..8].try_into().unwrap()));
            8
        }
        _ => {
            return Err(ReplicationError::Decode(format!(
                "bad column type: {:#x} {}",
                col_type,
                column_type_to_string(col_type)
            )));
        }
    };

    Ok(size)
}

/// Decode the columns of one row image, invoking the handler for each
/// present column in schema order. Returns the number of bytes consumed.
pub fn process_row_data(
    handler: &mut dyn RowEventHandler,
    table: &Table,
    data: &[u8],
    columns_present: &[u8],
) -> Result<usize> {
    let ncolumns = table.columns.len();
    let metadata = &table.column_metadata;

    let null_bytes = (ncolumns + 7) / 8;
    if data.len() < null_bytes {
        return Err(ReplicationError::Decode("row shorter than null bitmap".into()));
    }

    let null_bitmap = &data[..null_bytes];
    let mut pos = null_bytes;
    let mut metadata_offset = 0usize;
    let mut npresent = 0usize;

    let meta = |offset: usize| -> u8 { metadata.get(offset).copied().unwrap_or(0) };

    let overflow = |pos: usize| -> Result<()> {
        if pos > data.len() {
            Err(ReplicationError::Decode("row event overflows payload".into()))
        } else {
            Ok(())
        }
    };

    for i in 0..ncolumns {
        if npresent == ncolumns {
            break;
        }

        if !bit_is_set(columns_present, i) {
            continue;
        }

        npresent += 1;
        let col_type = table.column_types[i];

        if bit_is_set(null_bitmap, i) {
            handler.column_null(table, i);
        } else if column_is_fixed_string(col_type) {
            if fixed_string_is_enum(meta(metadata_offset)) {
                // ENUM and SET are stored as STRING with the real type in
                // the metadata; the value is rendered as hex.
                let bytes = meta(metadata_offset + 1) as usize;
                overflow(pos + bytes)?;
                handler.column_string(table, i, hex::encode(&data[pos..pos + bytes]));
                pos += bytes;
            } else {
                // The two metadata bytes encode the real type and the field
                // length, with the high bits of the length XOR'ed into the
                // upper nibble.
                let packed =
                    meta(metadata_offset + 1) as u16 + ((meta(metadata_offset) as u16) << 8);
                let extra_length = ((packed >> 4) & 0x300) ^ 0x300;
                let field_length = (packed & 0xff) + extra_length;

                let bytes = if field_length > 255 {
                    overflow(pos + 2)?;
                    let n = le_u16_at(&data[pos..]) as usize;
                    pos += 2;
                    n
                } else {
                    overflow(pos + 1)?;
                    let n = data[pos] as usize;
                    pos += 1;
                    n
                };

                overflow(pos + bytes)?;
                let value = String::from_utf8_lossy(&data[pos..pos + bytes]).into_owned();
                handler.column_string(table, i, value);
                pos += bytes;
            }
        } else if col_type == COL_TYPE_BIT {
            let len = meta(metadata_offset + 1) as usize;
            let bit_len = if meta(metadata_offset) > 0 { 1 } else { 0 };
            let bytes = len + bit_len;

            WARN_BIT.call_once(|| {
                warn!("BIT is not currently supported, values are stored as 0.");
            });

            handler.column_int(table, i, 0);
            pos += bytes;
            overflow(pos)?;
        } else if column_is_decimal(col_type) {
            let precision = (meta(metadata_offset) as usize).min(65);
            let decimals = (meta(metadata_offset + 1) as usize).min(precision);
            let field_size = decimal_field_size(precision, decimals);
            overflow(pos + field_size)?;
            let (value, size) = unpack_decimal_field(&data[pos..], precision, decimals);
            handler.column_double(table, i, value);
            pos += size;
            overflow(pos)?;
        } else if column_is_variable_string(col_type) {
            let field_bytes =
                meta(metadata_offset) as usize | (meta(metadata_offset + 1) as usize) << 8;

            let sz = if field_bytes > 255 {
                overflow(pos + 2)?;
                let n = le_u16_at(&data[pos..]) as usize;
                pos += 2;
                n
            } else {
                overflow(pos + 1)?;
                let n = data[pos] as usize;
                pos += 1;
                n
            };

            overflow(pos + sz)?;
            let value = String::from_utf8_lossy(&data[pos..pos + sz]).into_owned();
            handler.column_string(table, i, value);
            pos += sz;
        } else if column_is_blob(col_type) {
            // The length prefix is 1 to 4 bytes wide.
            let prefix = (meta(metadata_offset) as usize).min(4);
            overflow(pos + prefix)?;

            let mut len = 0u64;
            for (n, &b) in data[pos..pos + prefix].iter().enumerate() {
                len |= (b as u64) << (8 * n);
            }
            pos += prefix;

            if len > 0 {
                overflow(pos + len as usize)?;
                handler.column_bytes(table, i, data[pos..pos + len as usize].to_vec());
                pos += len as usize;
            } else {
                handler.column_bytes(table, i, vec![0]);
            }
        } else if column_is_temporal(col_type) {
            let decimals = if metadata_len(col_type) > 0 {
                meta(metadata_offset)
            } else {
                0
            };
            overflow(pos + temporal_field_size(col_type, decimals))?;
            let (value, size) = unpack_temporal_value(col_type, &data[pos..], decimals);
            handler.column_string(table, i, value);
            pos += size;
            overflow(pos)?;
        } else {
            let size = set_numeric_field_value(handler, table, i, &data[pos..])?;
            pos += size;
            overflow(pos)?;
        }

        metadata_offset += metadata_len(col_type);
    }

    Ok(pos)
}
