use std::collections::HashMap;
use std::sync::Mutex;

use bson::Document;

use crate::protocol::{CHECKSUM_PRESENT, HEADER_LEN};

/// A stable fingerprint over the caller identity and the request document.
///
/// Equal requests produce equal keys; requests that differ in key order are
/// allowed to produce different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<u8>);

impl CacheKey {
    pub fn new(user: &str, host: &str, default_db: &str, request: &Document) -> CacheKey {
        let mut data = Vec::new();

        for part in [user, host, default_db] {
            data.extend_from_slice(part.as_bytes());
            data.push(0);
        }

        // Serialization of an in-memory document does not fail.
        let _unused = request.to_writer(&mut data);

        CacheKey(data)
    }
}

/// How the trailing four bytes of a patched response are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseChecksum {
    /// The request did not carry a checksum, zero the field.
    Reset,

    /// Recompute the CRC32C over the patched bytes.
    Update,
}

/// Rewrite the ids of a stored response for its new consumer, fixing up the
/// trailing CRC32C when the response carries one.
pub fn patch_response(response: &mut [u8], request_id: i32, response_to: i32, mode: ResponseChecksum) {
    if response.len() < HEADER_LEN {
        return;
    }

    response[4..8].copy_from_slice(&request_id.to_le_bytes());
    response[8..12].copy_from_slice(&response_to.to_le_bytes());

    let flags = u32::from_le_bytes(
        response[HEADER_LEN..HEADER_LEN + 4]
            .try_into()
            .unwrap_or_default(),
    );

    if flags & CHECKSUM_PRESENT == 0 {
        return;
    }

    let body_len = response.len() - 4;

    let checksum = match mode {
        ResponseChecksum::Reset => 0,
        ResponseChecksum::Update => crc32c::crc32c(&response[..body_len]),
    };

    response[body_len..].copy_from_slice(&checksum.to_le_bytes());
}

struct Entry {
    response: Vec<u8>,
    table: String,
}

/// Content-addressed store of wire responses with table-scoped
/// invalidation. Shared by every session of a service.
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl ResponseCache {
    pub fn new() -> ResponseCache {
        ResponseCache::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.response.clone())
    }

    /// Store a response, tagged with the table it came from.
    pub fn put(&self, key: CacheKey, response: Vec<u8>, table: impl Into<String>) {
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                response,
                table: table.into(),
            },
        );
    }

    /// Drop every entry tagged with any of the listed tables.
    pub fn invalidate(&self, tables: &[String]) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| !tables.contains(&entry.table));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::create_msg_response;
    use bson::doc;

    fn key(n: i32) -> CacheKey {
        CacheKey::new("user", "host", "db", &doc! {"find": "t", "n": n})
    }

    #[test]
    fn equal_requests_alias() {
        assert_eq!(key(1), key(1));
        assert_ne!(key(1), key(2));
        assert_ne!(
            CacheKey::new("a", "h", "db", &doc! {"find": "t"}),
            CacheKey::new("b", "h", "db", &doc! {"find": "t"}),
        );
    }

    #[test]
    fn store_hit_and_invalidate() {
        let cache = ResponseCache::new();

        cache.put(key(1), vec![1, 2, 3], "d.t");
        cache.put(key(2), vec![4, 5], "d.u");

        assert_eq!(cache.get(&key(1)).unwrap(), vec![1, 2, 3]);
        assert!(cache.get(&key(3)).is_none());

        cache.invalidate(&["d.t".to_string()]);
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.get(&key(2)).unwrap(), vec![4, 5]);
    }

    #[test]
    fn invalidate_multiple_tables() {
        let cache = ResponseCache::new();
        cache.put(key(1), vec![1], "d.t");
        cache.put(key(2), vec![2], "d.u");
        cache.put(key(3), vec![3], "d.v");

        cache.invalidate(&["d.t".to_string(), "d.v".to_string()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn patched_response_gets_new_ids_and_checksum() {
        // Scenario: a response cached for request_id 7 is served to a
        // request with id 42; the ids and the CRC32C must be rewritten.
        let mut cached = create_msg_response(100, 7, &doc! {"ok": 1}, true);

        patch_response(&mut cached, 43, 42, ResponseChecksum::Update);

        assert_eq!(
            i32::from_le_bytes(cached[4..8].try_into().unwrap()),
            43
        );
        assert_eq!(
            i32::from_le_bytes(cached[8..12].try_into().unwrap()),
            42
        );

        let stored = u32::from_le_bytes(cached[cached.len() - 4..].try_into().unwrap());
        assert_eq!(stored, crc32c::crc32c(&cached[..cached.len() - 4]));
    }

    #[test]
    fn patching_without_checksum_leaves_tail_alone() {
        let mut response = create_msg_response(100, 7, &doc! {"ok": 1}, false);
        let tail = response[response.len() - 4..].to_vec();

        patch_response(&mut response, 1, 2, ResponseChecksum::Update);
        assert_eq!(&response[response.len() - 4..], &tail[..]);
    }

    #[test]
    fn reset_zeroes_the_checksum() {
        let mut response = create_msg_response(100, 7, &doc! {"ok": 1}, true);
        patch_response(&mut response, 1, 2, ResponseChecksum::Reset);

        let stored = u32::from_le_bytes(response[response.len() - 4..].try_into().unwrap());
        assert_eq!(stored, 0);
    }
}
