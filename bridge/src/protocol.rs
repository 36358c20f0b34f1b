/// Wire protocol constants of the document database protocol.

pub const HEADER_LEN: usize = 16;

pub const MAX_MSG_SIZE: usize = 48_000_000;
pub const MAX_BSON_OBJECT_SIZE: usize = 16_777_216;
pub const MAX_WRITE_BATCH_SIZE: usize = 100_000;

pub const OPCODE_REPLY: i32 = 1;
pub const OPCODE_UPDATE: i32 = 2001;
pub const OPCODE_INSERT: i32 = 2002;
pub const OPCODE_QUERY: i32 = 2004;
pub const OPCODE_GET_MORE: i32 = 2005;
pub const OPCODE_DELETE: i32 = 2006;
pub const OPCODE_KILL_CURSORS: i32 = 2007;
pub const OPCODE_COMPRESSED: i32 = 2012;
pub const OPCODE_MSG: i32 = 2013;

// OP_MSG flag bits.
pub const CHECKSUM_PRESENT: u32 = 0x01;
pub const MORE_TO_COME: u32 = 0x02;
pub const EXHAUST_ALLOWED: u32 = 0x10000;

// OP_REPLY response flags.
pub const REPLY_CURSOR_NOT_FOUND: i32 = 0x01;
pub const REPLY_QUERY_FAILURE: i32 = 0x02;

pub const DEFAULT_CURSOR_RETURN: i32 = 101;

pub fn opcode_to_string(code: i32) -> &'static str {
    match code {
        OPCODE_REPLY => "OP_REPLY",
        OPCODE_UPDATE => "OP_UPDATE",
        OPCODE_INSERT => "OP_INSERT",
        OPCODE_QUERY => "OP_QUERY",
        OPCODE_GET_MORE => "OP_GET_MORE",
        OPCODE_DELETE => "OP_DELETE",
        OPCODE_KILL_CURSORS => "OP_KILL_CURSORS",
        OPCODE_COMPRESSED => "OP_COMPRESSED",
        OPCODE_MSG => "OP_MSG",
        _ => "OP_UNKNOWN",
    }
}

/// Numeric type codes of document values, used by `$type`.
pub mod type_code {
    pub const DOUBLE: i32 = 1;
    pub const STRING: i32 = 2;
    pub const OBJECT: i32 = 3;
    pub const ARRAY: i32 = 4;
    pub const BIN_DATA: i32 = 5;
    pub const UNDEFINED: i32 = 6;
    pub const OBJECT_ID: i32 = 7;
    pub const BOOL: i32 = 8;
    pub const DATE: i32 = 9;
    pub const NULL: i32 = 10;
    pub const REGEX: i32 = 11;
    pub const DB_POINTER: i32 = 12;
    pub const JAVASCRIPT: i32 = 13;
    pub const SYMBOL: i32 = 14;
    pub const JAVASCRIPT_SCOPE: i32 = 15;
    pub const INT32: i32 = 16;
    pub const TIMESTAMP: i32 = 17;
    pub const INT64: i32 = 18;
    pub const DECIMAL128: i32 = 19;
    pub const MIN_KEY: i32 = -1;
    pub const MAX_KEY: i32 = 127;
}

/// String aliases accepted by `$type`.
pub fn alias_to_type_code(alias: &str) -> Option<i32> {
    use type_code::*;

    let code = match alias {
        "double" => DOUBLE,
        "string" => STRING,
        "object" => OBJECT,
        "array" => ARRAY,
        "binData" => BIN_DATA,
        "undefined" => UNDEFINED,
        "objectId" => OBJECT_ID,
        "bool" => BOOL,
        "date" => DATE,
        "null" => NULL,
        "regex" => REGEX,
        "dbPointer" => DB_POINTER,
        "javascript" => JAVASCRIPT,
        "symbol" => SYMBOL,
        "javascriptWithScope" => JAVASCRIPT_SCOPE,
        "int" => INT32,
        "timestamp" => TIMESTAMP,
        "long" => INT64,
        "decimal" => DECIMAL128,
        "minKey" => MIN_KEY,
        "maxKey" => MAX_KEY,
        _ => return None,
    };

    Some(code)
}

pub fn type_code_to_alias(code: i32) -> &'static str {
    use type_code::*;

    match code {
        DOUBLE => "double",
        STRING => "string",
        OBJECT => "object",
        ARRAY => "array",
        BIN_DATA => "binData",
        UNDEFINED => "undefined",
        OBJECT_ID => "objectId",
        BOOL => "bool",
        DATE => "date",
        NULL => "null",
        REGEX => "regex",
        DB_POINTER => "dbPointer",
        JAVASCRIPT => "javascript",
        SYMBOL => "symbol",
        JAVASCRIPT_SCOPE => "javascriptWithScope",
        INT32 => "int",
        TIMESTAMP => "timestamp",
        INT64 => "long",
        DECIMAL128 => "decimal",
        MIN_KEY => "minKey",
        MAX_KEY => "maxKey",
        _ => "unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alias_round_trip() {
        for alias in ["double", "string", "timestamp", "long", "minKey"] {
            let code = alias_to_type_code(alias).unwrap();
            assert_eq!(type_code_to_alias(code), alias);
        }

        assert!(alias_to_type_code("bogus").is_none());
    }

    #[test]
    fn opcode_names() {
        assert_eq!(opcode_to_string(OPCODE_MSG), "OP_MSG");
        assert_eq!(opcode_to_string(0), "OP_UNKNOWN");
    }
}
