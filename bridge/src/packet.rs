use std::collections::HashMap;

use bson::Document;
use bytes::{Bytes, BytesMut};

use crate::error::{BridgeError, Result};
use crate::protocol::*;

/// The 16 byte header every wire message starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_len: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub opcode: i32,
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Header> {
        if data.len() < HEADER_LEN {
            return Err(BridgeError::Protocol(
                "Malformed packet, header truncated.".to_string(),
            ));
        }

        Ok(Header {
            msg_len: i32::from_le_bytes(data[0..4].try_into().unwrap()),
            request_id: i32::from_le_bytes(data[4..8].try_into().unwrap()),
            response_to: i32::from_le_bytes(data[8..12].try_into().unwrap()),
            opcode: i32::from_le_bytes(data[12..16].try_into().unwrap()),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg_len.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.opcode.to_le_bytes());
    }
}

/// Accumulates transport bytes and hands out exactly one message at a time.
/// The framer owns the bytes until a full frame is available.
#[derive(Debug, Default)]
pub struct RequestFramer {
    buffer: BytesMut,
}

impl RequestFramer {
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The next complete frame, or None until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let msg_len = i32::from_le_bytes(self.buffer[0..4].try_into().unwrap());

        if msg_len < HEADER_LEN as i32 || msg_len as usize > MAX_MSG_SIZE {
            return Err(BridgeError::Protocol(format!(
                "Malformed packet, invalid message length {}.",
                msg_len
            )));
        }

        let msg_len = msg_len as usize;

        if self.buffer.len() < msg_len {
            return Ok(None);
        }

        Ok(Some(self.buffer.split_to(msg_len).freeze()))
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// A parsed client request.
#[derive(Debug)]
pub enum Request {
    Insert(Insert),
    Delete(Delete),
    Update(Update),
    Query(Query),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Msg(Msg),
}

impl Request {
    pub fn parse(frame: &[u8]) -> Result<Request> {
        let header = Header::parse(frame)?;

        if header.msg_len as usize != frame.len() {
            return Err(BridgeError::Protocol(format!(
                "Malformed packet, header claims {} bytes, frame has {}.",
                header.msg_len,
                frame.len()
            )));
        }

        match header.opcode {
            OPCODE_INSERT => Ok(Request::Insert(Insert::parse(header, frame)?)),
            OPCODE_DELETE => Ok(Request::Delete(Delete::parse(header, frame)?)),
            OPCODE_UPDATE => Ok(Request::Update(Update::parse(header, frame)?)),
            OPCODE_QUERY => Ok(Request::Query(Query::parse(header, frame)?)),
            OPCODE_GET_MORE => Ok(Request::GetMore(GetMore::parse(header, frame)?)),
            OPCODE_KILL_CURSORS => Ok(Request::KillCursors(KillCursors::parse(header, frame)?)),
            OPCODE_MSG => Ok(Request::Msg(Msg::parse(header, frame)?)),
            OPCODE_REPLY | OPCODE_COMPRESSED => Err(BridgeError::Protocol(format!(
                "Unsupported packet {} received.",
                opcode_to_string(header.opcode)
            ))),
            other => Err(BridgeError::Protocol(format!(
                "Unknown packet {} received.",
                other
            ))),
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Request::Insert(p) => &p.header,
            Request::Delete(p) => &p.header,
            Request::Update(p) => &p.header,
            Request::Query(p) => &p.header,
            Request::GetMore(p) => &p.header,
            Request::KillCursors(p) => &p.header,
            Request::Msg(p) => &p.header,
        }
    }

    /// The collection the request addresses, where the opcode carries one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Request::Insert(p) => Some(&p.collection),
            Request::Delete(p) => Some(&p.collection),
            Request::Update(p) => Some(&p.collection),
            Request::Query(p) => Some(&p.collection),
            Request::GetMore(p) => Some(&p.collection),
            _ => None,
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader {
            data,
            pos: HEADER_LEN,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn get_i32(&mut self) -> Result<i32> {
        if self.remaining() < 4 {
            return Err(BridgeError::Protocol(
                "Malformed packet, truncated int32.".to_string(),
            ));
        }

        let v = i32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(self.get_i32()? as u32)
    }

    fn get_i64(&mut self) -> Result<i64> {
        if self.remaining() < 8 {
            return Err(BridgeError::Protocol(
                "Malformed packet, truncated int64.".to_string(),
            ));
        }

        let v = i64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn get_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(BridgeError::Protocol(
                "Malformed packet, truncated byte.".to_string(),
            ));
        }

        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_cstring(&mut self) -> Result<String> {
        let start = self.pos;

        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }

        if self.pos == self.data.len() {
            return Err(BridgeError::Protocol(
                "Malformed packet, string not NULL-terminated.".to_string(),
            ));
        }

        let s = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(s)
    }

    /// A length-prefixed document; the declared size must fit in `limit`.
    fn get_document(&mut self, limit: usize) -> Result<Document> {
        if limit < self.pos + 4 {
            return Err(BridgeError::Protocol(
                "Malformed packet, expecting document, but not even document length received."
                    .to_string(),
            ));
        }

        let size =
            i32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap()) as usize;

        if size < 5 || self.pos + size > limit {
            return Err(BridgeError::Protocol(format!(
                "Malformed packet, document claimed to be {} bytes, but only {} available.",
                size,
                limit - self.pos
            )));
        }

        let mut slice = &self.data[self.pos..self.pos + size];
        let doc = Document::from_reader(&mut slice)
            .map_err(|e| BridgeError::Protocol(format!("Malformed document: {}", e)))?;

        self.pos += size;
        Ok(doc)
    }
}

#[derive(Debug)]
pub struct Insert {
    pub header: Header,
    pub flags: i32,
    pub collection: String,
    pub documents: Vec<Document>,
}

impl Insert {
    fn parse(header: Header, frame: &[u8]) -> Result<Insert> {
        let mut r = Reader::new(frame);

        let flags = r.get_i32()?;
        let collection = r.get_cstring()?;

        let mut documents = Vec::new();
        while r.pos < frame.len() {
            documents.push(r.get_document(frame.len())?);
        }

        Ok(Insert {
            header,
            flags,
            collection,
            documents,
        })
    }
}

#[derive(Debug)]
pub struct Delete {
    pub header: Header,
    pub collection: String,
    pub flags: i32,
    pub selector: Document,
}

impl Delete {
    fn parse(header: Header, frame: &[u8]) -> Result<Delete> {
        let mut r = Reader::new(frame);

        r.get_i32()?; // ZERO
        let collection = r.get_cstring()?;
        let flags = r.get_i32()?;
        let selector = r.get_document(frame.len())?;

        Ok(Delete {
            header,
            collection,
            flags,
            selector,
        })
    }
}

#[derive(Debug)]
pub struct Update {
    pub header: Header,
    pub collection: String,
    pub flags: i32,
    pub selector: Document,
    pub update: Document,
}

impl Update {
    fn parse(header: Header, frame: &[u8]) -> Result<Update> {
        let mut r = Reader::new(frame);

        r.get_i32()?; // ZERO
        let collection = r.get_cstring()?;
        let flags = r.get_i32()?;
        let selector = r.get_document(frame.len())?;
        let update = r.get_document(frame.len())?;

        Ok(Update {
            header,
            collection,
            flags,
            selector,
            update,
        })
    }
}

#[derive(Debug)]
pub struct Query {
    pub header: Header,
    pub flags: i32,
    pub collection: String,
    pub skip: i32,
    pub n_return: i32,
    pub query: Document,
    pub fields: Option<Document>,
}

impl Query {
    fn parse(header: Header, frame: &[u8]) -> Result<Query> {
        let mut r = Reader::new(frame);

        let flags = r.get_i32()?;
        let collection = r.get_cstring()?;
        let skip = r.get_i32()?;
        let n_return = r.get_i32()?;
        let query = r.get_document(frame.len())?;

        let fields = if r.pos < frame.len() {
            Some(r.get_document(frame.len())?)
        } else {
            None
        };

        if r.pos != frame.len() {
            return Err(BridgeError::Protocol(format!(
                "Malformed packet, {} trailing bytes found.",
                frame.len() - r.pos
            )));
        }

        Ok(Query {
            header,
            flags,
            collection,
            skip,
            n_return,
            query,
            fields,
        })
    }
}

#[derive(Debug)]
pub struct GetMore {
    pub header: Header,
    pub collection: String,
    pub n_return: i32,
    pub cursor_id: i64,
}

impl GetMore {
    fn parse(header: Header, frame: &[u8]) -> Result<GetMore> {
        let mut r = Reader::new(frame);

        r.get_i32()?; // ZERO
        let collection = r.get_cstring()?;
        let mut n_return = r.get_i32()?;
        let cursor_id = r.get_i64()?;

        if n_return == 0 {
            n_return = DEFAULT_CURSOR_RETURN;
        }

        Ok(GetMore {
            header,
            collection,
            n_return,
            cursor_id,
        })
    }
}

#[derive(Debug)]
pub struct KillCursors {
    pub header: Header,
    pub cursor_ids: Vec<i64>,
}

impl KillCursors {
    fn parse(header: Header, frame: &[u8]) -> Result<KillCursors> {
        let mut r = Reader::new(frame);

        r.get_i32()?; // ZERO
        let n_cursors = r.get_i32()?;

        let mut cursor_ids = Vec::new();
        for _ in 0..n_cursors {
            cursor_ids.push(r.get_i64()?);
        }

        Ok(KillCursors { header, cursor_ids })
    }
}

#[derive(Debug)]
pub struct Msg {
    pub header: Header,
    pub flags: u32,
    pub document: Document,
    pub arguments: HashMap<String, Vec<Document>>,
}

impl Msg {
    pub fn checksum_present(&self) -> bool {
        self.flags & CHECKSUM_PRESENT != 0
    }

    pub fn more_to_come(&self) -> bool {
        self.flags & MORE_TO_COME != 0
    }

    pub fn exhaust_allowed(&self) -> bool {
        self.flags & EXHAUST_ALLOWED != 0
    }

    fn parse(header: Header, frame: &[u8]) -> Result<Msg> {
        let mut r = Reader::new(frame);
        let flags = r.get_u32()?;

        if flags & CHECKSUM_PRESENT != 0 {
            if frame.len() < HEADER_LEN + 4 + 4 {
                return Err(BridgeError::Protocol(
                    "Malformed packet, no room for a checksum.".to_string(),
                ));
            }

            let expected = crc32c::crc32c(&frame[..frame.len() - 4]);
            let stored =
                u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());

            if expected != stored {
                return Err(BridgeError::Protocol(format!(
                    "Invalid checksum, expected {}, got {}.",
                    expected, stored
                )));
            }
        }

        let sections_end = frame.len() - if flags & CHECKSUM_PRESENT != 0 { 4 } else { 0 };

        let mut document: Option<Document> = None;
        let mut arguments: HashMap<String, Vec<Document>> = HashMap::new();

        while r.pos < sections_end {
            let kind = r.get_u8()?;

            match kind {
                0 => {
                    // Body section, a single document.
                    if document.is_some() {
                        return Err(BridgeError::Protocol(
                            "Malformed packet, multiple body sections.".to_string(),
                        ));
                    }

                    document = Some(r.get_document(sections_end)?);
                }
                1 => {
                    let section_start = r.pos;
                    let total_size = r.get_u32()? as usize;

                    if section_start + total_size > sections_end {
                        return Err(BridgeError::Protocol(format!(
                            "Malformed packet, section(1) size {} larger than available amount \
                             {} of data.",
                            total_size,
                            sections_end - section_start
                        )));
                    }

                    let section_end = section_start + total_size;
                    let identifier = r.get_cstring()?;
                    let documents = arguments.entry(identifier).or_default();

                    while r.pos < section_end {
                        documents.push(r.get_document(section_end)?);
                    }
                }
                other => {
                    return Err(BridgeError::Protocol(format!(
                        "Malformed packet, expected a 'kind' of 0 or 1, received {}.",
                        other
                    )));
                }
            }
        }

        if r.pos != sections_end {
            return Err(BridgeError::Protocol(format!(
                "Malformed packet, {} trailing bytes found.",
                sections_end - r.pos
            )));
        }

        let Some(document) = document else {
            return Err(BridgeError::Protocol(
                "Malformed packet, no body section.".to_string(),
            ));
        };

        Ok(Msg {
            header,
            flags,
            document,
            arguments,
        })
    }
}

fn document_bytes(doc: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    // Serialization of an in-memory document does not fail.
    let _unused = doc.to_writer(&mut out);
    out
}

/// Build an OP_REPLY response.
pub fn create_reply_response(
    request_id: i32,
    response_to: i32,
    cursor_id: i64,
    starting_from: i32,
    documents: &[Document],
    is_error: bool,
) -> Vec<u8> {
    let payload: Vec<u8> = documents.iter().flat_map(|d| document_bytes(d)).collect();

    let msg_len = HEADER_LEN + 4 + 8 + 4 + 4 + payload.len();
    let mut out = Vec::with_capacity(msg_len);

    Header {
        msg_len: msg_len as i32,
        request_id,
        response_to,
        opcode: OPCODE_REPLY,
    }
    .write_to(&mut out);

    let response_flags: i32 = if is_error { REPLY_QUERY_FAILURE } else { 0 };
    out.extend_from_slice(&response_flags.to_le_bytes());
    out.extend_from_slice(&cursor_id.to_le_bytes());
    out.extend_from_slice(&starting_from.to_le_bytes());
    out.extend_from_slice(&(documents.len() as i32).to_le_bytes());
    out.extend_from_slice(&payload);

    out
}

/// Build an OP_MSG response, optionally with a trailing CRC32C.
pub fn create_msg_response(
    request_id: i32,
    response_to: i32,
    doc: &Document,
    with_checksum: bool,
) -> Vec<u8> {
    let payload = document_bytes(doc);

    let mut msg_len = HEADER_LEN + 4 + 1 + payload.len();
    let mut flags: u32 = 0;

    if with_checksum {
        flags |= CHECKSUM_PRESENT;
        msg_len += 4;
    }

    let mut out = Vec::with_capacity(msg_len);

    Header {
        msg_len: msg_len as i32,
        request_id,
        response_to,
        opcode: OPCODE_MSG,
    }
    .write_to(&mut out);

    out.extend_from_slice(&flags.to_le_bytes());
    out.push(0); // section kind
    out.extend_from_slice(&payload);

    if with_checksum {
        let checksum = crc32c::crc32c(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
    }

    out
}

/// Build an OP_MSG request frame; requests and responses share the layout.
pub fn create_msg_request(request_id: i32, doc: &Document, with_checksum: bool) -> Vec<u8> {
    create_msg_response(request_id, 0, doc, with_checksum)
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn insert_frame() -> Vec<u8> {
        let doc = document_bytes(&doc! {"a": 1});

        let mut out = Vec::new();
        let msg_len = HEADER_LEN + 4 + 5 + doc.len();

        Header {
            msg_len: msg_len as i32,
            request_id: 1,
            response_to: 0,
            opcode: OPCODE_INSERT,
        }
        .write_to(&mut out);

        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(b"d.t\0");
        out.extend_from_slice(&doc);
        out
    }

    #[test]
    fn framer_waits_for_full_frames() {
        let frame = insert_frame();
        let mut framer = RequestFramer::default();

        framer.feed(&frame[..10]);
        assert!(framer.next_frame().unwrap().is_none());

        framer.feed(&frame[10..]);
        let out = framer.next_frame().unwrap().unwrap();
        assert_eq!(&out[..], &frame[..]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn framer_keeps_the_remainder() {
        let frame = insert_frame();
        let mut bytes = frame.clone();
        bytes.extend_from_slice(&frame[..7]);

        let mut framer = RequestFramer::default();
        framer.feed(&bytes);

        assert!(framer.next_frame().unwrap().is_some());
        assert_eq!(framer.pending(), 7);
        assert!(framer.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_message_is_malformed() {
        let mut framer = RequestFramer::default();
        let mut bytes = Vec::new();

        Header {
            msg_len: (MAX_MSG_SIZE + 1) as i32,
            request_id: 1,
            response_to: 0,
            opcode: OPCODE_MSG,
        }
        .write_to(&mut bytes);

        framer.feed(&bytes);
        assert!(framer.next_frame().is_err());
    }

    #[test]
    fn parse_insert() {
        let frame = insert_frame();
        let request = Request::parse(&frame).unwrap();

        let Request::Insert(insert) = request else {
            panic!("not an insert");
        };

        assert_eq!(insert.collection, "d.t");
        assert_eq!(insert.documents.len(), 1);
        assert_eq!(insert.documents[0], doc! {"a": 1});
    }

    #[test]
    fn parse_update_and_delete() {
        let selector = document_bytes(&doc! {"a": 1});
        let update = document_bytes(&doc! {"$set": {"b": 2}});

        let mut out = Vec::new();
        let msg_len = HEADER_LEN + 4 + 4 + 4 + selector.len() + update.len();
        Header {
            msg_len: msg_len as i32,
            request_id: 2,
            response_to: 0,
            opcode: OPCODE_UPDATE,
        }
        .write_to(&mut out);
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(b"d.t\0");
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&selector);
        out.extend_from_slice(&update);

        let Request::Update(update) = Request::parse(&out).unwrap() else {
            panic!("not an update");
        };
        assert_eq!(update.selector, doc! {"a": 1});
        assert_eq!(update.update, doc! {"$set": {"b": 2}});
    }

    #[test]
    fn parse_msg_with_body_and_arguments() {
        let body = doc! {"insert": "t", "$db": "d"};
        let arg_doc = document_bytes(&doc! {"a": 1});

        let mut section1 = Vec::new();
        let identifier = b"documents\0";
        let total = 4 + identifier.len() + arg_doc.len();
        section1.extend_from_slice(&(total as u32).to_le_bytes());
        section1.extend_from_slice(identifier);
        section1.extend_from_slice(&arg_doc);

        let body_bytes = document_bytes(&body);
        let msg_len = HEADER_LEN + 4 + 1 + body_bytes.len() + 1 + section1.len();

        let mut out = Vec::new();
        Header {
            msg_len: msg_len as i32,
            request_id: 3,
            response_to: 0,
            opcode: OPCODE_MSG,
        }
        .write_to(&mut out);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(0);
        out.extend_from_slice(&body_bytes);
        out.push(1);
        out.extend_from_slice(&section1);

        let Request::Msg(msg) = Request::parse(&out).unwrap() else {
            panic!("not a msg");
        };

        assert_eq!(msg.document, body);
        assert_eq!(msg.arguments["documents"], vec![doc! {"a": 1}]);
        assert!(!msg.checksum_present());
    }

    #[test]
    fn msg_checksum_round_trip() {
        let frame = create_msg_request(7, &doc! {"ping": 1, "$db": "admin"}, true);

        let Request::Msg(msg) = Request::parse(&frame).unwrap() else {
            panic!("not a msg");
        };

        assert!(msg.checksum_present());
        assert_eq!(msg.document.get_str("$db").unwrap(), "admin");
    }

    #[test]
    fn corrupted_checksum_is_fatal() {
        let mut frame = create_msg_request(7, &doc! {"ping": 1}, true);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let err = Request::parse(&frame).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn unknown_section_kind_is_fatal() {
        let body = document_bytes(&doc! {"ping": 1});
        let msg_len = HEADER_LEN + 4 + 1 + body.len();

        let mut out = Vec::new();
        Header {
            msg_len: msg_len as i32,
            request_id: 3,
            response_to: 0,
            opcode: OPCODE_MSG,
        }
        .write_to(&mut out);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(9);
        out.extend_from_slice(&body);

        assert!(Request::parse(&out).is_err());
    }

    #[test]
    fn reply_and_compressed_are_unsupported() {
        for opcode in [OPCODE_REPLY, OPCODE_COMPRESSED] {
            let mut out = Vec::new();
            Header {
                msg_len: HEADER_LEN as i32,
                request_id: 1,
                response_to: 0,
                opcode,
            }
            .write_to(&mut out);

            let err = Request::parse(&out).unwrap_err();
            assert!(err.to_string().contains("Unsupported"));
        }
    }

    #[test]
    fn parse_query_with_fields() {
        let query = document_bytes(&doc! {"a": 1});
        let fields = document_bytes(&doc! {"b": 1});

        let mut out = Vec::new();
        let msg_len = HEADER_LEN + 4 + 4 + 4 + 4 + query.len() + fields.len();
        Header {
            msg_len: msg_len as i32,
            request_id: 4,
            response_to: 0,
            opcode: OPCODE_QUERY,
        }
        .write_to(&mut out);
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(b"d.t\0");
        out.extend_from_slice(&3i32.to_le_bytes()); // skip
        out.extend_from_slice(&5i32.to_le_bytes()); // return
        out.extend_from_slice(&query);
        out.extend_from_slice(&fields);

        let Request::Query(q) = Request::parse(&out).unwrap() else {
            panic!("not a query");
        };
        assert_eq!(q.skip, 3);
        assert_eq!(q.n_return, 5);
        assert_eq!(q.fields, Some(doc! {"b": 1}));
    }

    #[test]
    fn get_more_default_return() {
        let mut out = Vec::new();
        let msg_len = HEADER_LEN + 4 + 4 + 4 + 8;
        Header {
            msg_len: msg_len as i32,
            request_id: 5,
            response_to: 0,
            opcode: OPCODE_GET_MORE,
        }
        .write_to(&mut out);
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(b"d.t\0");
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&42i64.to_le_bytes());

        let Request::GetMore(g) = Request::parse(&out).unwrap() else {
            panic!("not a get_more");
        };
        assert_eq!(g.n_return, DEFAULT_CURSOR_RETURN);
        assert_eq!(g.cursor_id, 42);
    }

    #[test]
    fn reply_response_layout() {
        let docs = vec![doc! {"ok": 1}];
        let bytes = create_reply_response(10, 7, 0, 0, &docs, false);

        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.msg_len as usize, bytes.len());
        assert_eq!(header.opcode, OPCODE_REPLY);
        assert_eq!(header.request_id, 10);
        assert_eq!(header.response_to, 7);

        let number_returned =
            i32::from_le_bytes(bytes[HEADER_LEN + 12..HEADER_LEN + 16].try_into().unwrap());
        assert_eq!(number_returned, 1);
    }

    #[test]
    fn msg_response_checksum_is_valid() {
        let bytes = create_msg_response(10, 7, &doc! {"ok": 1}, true);
        let stored = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(stored, crc32c::crc32c(&bytes[..bytes.len() - 4]));
    }
}
