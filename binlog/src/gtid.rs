use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// A GTID position.
///
/// `event_num` is a sub-position that increases monotonically for every row
/// image produced inside one GTID-bracketed transaction. It is not part of
/// the upstream GTID, it exists so that the records of one transaction can
/// be rebuilt in source order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GtidPos {
    pub domain: u64,
    pub server_id: u64,
    pub seq: u64,
    pub event_num: u64,

    /// Timestamp of the GTID event.
    pub timestamp: u32,
}

impl GtidPos {
    /// Parse `domain-server_id-seq[-event_num]`, also accepting `:` as the
    /// separator.
    pub fn parse(s: &str) -> Option<GtidPos> {
        let mut parts = s.trim().split(|c| c == '-' || c == ':');

        let domain = parts.next()?.parse().ok()?;
        let server_id = parts.next()?.parse().ok()?;
        let seq = parts.next()?.parse().ok()?;
        let event_num = match parts.next() {
            Some(sub) => sub.parse().ok()?,
            None => 0,
        };

        Some(GtidPos {
            domain,
            server_id,
            seq,
            event_num,
            timestamp: 0,
        })
    }

    /// Extract the GTID from a GTID event payload. The sequence number is
    /// the first 8 bytes, the domain the following 4, both little-endian.
    pub fn extract(timestamp: u32, server_id: u32, payload: &[u8]) -> Option<GtidPos> {
        if payload.len() < 12 {
            return None;
        }

        let seq = u64::from_le_bytes(payload[0..8].try_into().ok()?);
        let domain = u32::from_le_bytes(payload[8..12].try_into().ok()?) as u64;

        Some(GtidPos {
            domain,
            server_id: server_id as u64,
            seq,
            event_num: 0,
            timestamp,
        })
    }

    pub fn empty(&self) -> bool {
        self.timestamp == 0
            && self.domain == 0
            && self.server_id == 0
            && self.seq == 0
            && self.event_num == 0
    }

    /// Same transaction, ignoring `event_num` and `timestamp`.
    pub fn is_same_transaction(&self, rhs: &GtidPos) -> bool {
        self.domain == rhs.domain && self.server_id == rhs.server_id && self.seq == rhs.seq
    }
}

impl fmt::Display for GtidPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.seq)
    }
}

/// The committed position of every replication domain seen so far.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GtidList {
    positions: BTreeMap<u64, GtidPos>,
}

impl GtidList {
    /// Parse a comma-separated GTID list. Unparseable elements are skipped,
    /// matching how a hand-edited state file is treated.
    pub fn parse(s: &str) -> GtidList {
        let mut rval = GtidList::default();

        for elem in s.split(',') {
            let trimmed = elem.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(gtid) = GtidPos::parse(trimmed) {
                if !gtid.empty() || gtid.seq != 0 {
                    rval.update(gtid);
                }
            }
        }

        rval
    }

    pub fn update(&mut self, gtid: GtidPos) {
        self.positions.insert(gtid.domain, gtid);
    }

    pub fn get(&self, domain: u64) -> Option<&GtidPos> {
        self.positions.get(&domain)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The newest position of any single domain; used when only one domain
    /// is tracked.
    pub fn first(&self) -> Option<&GtidPos> {
        self.positions.values().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GtidPos> {
        self.positions.values()
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for gtid in self.positions.values() {
            write!(f, "{}{}", sep, gtid)?;
            sep = ",";
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_format() {
        let gtid = GtidPos::parse("0-3000-1234").unwrap();
        assert_eq!(gtid.domain, 0);
        assert_eq!(gtid.server_id, 3000);
        assert_eq!(gtid.seq, 1234);
        assert_eq!(gtid.event_num, 0);
        assert_eq!(gtid.to_string(), "0-3000-1234");
    }

    #[test]
    fn parse_with_subsequence() {
        let gtid = GtidPos::parse("1:2:3:4").unwrap();
        assert_eq!(gtid.event_num, 4);
    }

    #[test]
    fn parse_garbage() {
        assert!(GtidPos::parse("").is_none());
        assert!(GtidPos::parse("1-2").is_none());
        assert!(GtidPos::parse("a-b-c").is_none());
    }

    #[test]
    fn extract_from_payload() {
        let mut payload = vec![0u8; 13];
        payload[0..8].copy_from_slice(&10u64.to_le_bytes());
        payload[8..12].copy_from_slice(&2u32.to_le_bytes());

        let gtid = GtidPos::extract(99, 3000, &payload).unwrap();
        assert_eq!(gtid.seq, 10);
        assert_eq!(gtid.domain, 2);
        assert_eq!(gtid.server_id, 3000);
        assert_eq!(gtid.timestamp, 99);
        assert_eq!(gtid.event_num, 0);
    }

    #[test]
    fn list_round_trip() {
        let list = GtidList::parse("0-3000-17, 1-3000-4,,bad");
        assert_eq!(list.to_string(), "0-3000-17,1-3000-4");
        assert_eq!(list.get(1).unwrap().seq, 4);
        assert!(list.get(2).is_none());
    }

    #[test]
    fn list_update_replaces_domain() {
        let mut list = GtidList::parse("0-3000-17");
        list.update(GtidPos::parse("0-3000-18").unwrap());
        assert_eq!(list.to_string(), "0-3000-18");
    }
}
