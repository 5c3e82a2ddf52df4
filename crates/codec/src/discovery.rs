//! LAN multicast discovery frame and the directory-publish record line
//! (spec §4.9, §6). Both are intentionally simple, fixed-layout text/byte
//! formats — the original (ANNOUNCE/QUERY/RESPONSE over UDP multicast,
//! colon-separated directory lines) carries no structured encoding either.

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastKind {
    Announce = 1,
    Query = 2,
    Response = 3,
}

impl MulticastKind {
    fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(Self::Announce),
            2 => Ok(Self::Query),
            3 => Ok(Self::Response),
            _ => Err(Error::UnknownType),
        }
    }
}

/// `{ type, node_id, ip, port, public_ip, public_port, is_public,
///   timestamp, sequence }`, colon-separated for readability (the field
/// widths in the original C source are fixed `char[16]` IP strings; we
/// just use UTF-8 strings bounded to 15 chars, the max length of a
/// dotted-quad IPv4 address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastFrame {
    pub kind: MulticastKind,
    pub node_id: i32,
    pub ip: String,
    pub port: i32,
    pub public_ip: String,
    pub public_port: i32,
    pub is_public: bool,
    pub timestamp: u32,
    pub sequence: u32,
}

impl MulticastFrame {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.kind as i32,
            self.node_id,
            self.ip,
            self.port,
            self.public_ip,
            self.public_port,
            if self.is_public { 1 } else { 0 },
            self.timestamp,
            self.sequence,
        )
    }

    pub fn decode(s: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() != 9 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            kind: MulticastKind::from_u8(fields[0].parse().map_err(|_| Error::InvalidInput)?)?,
            node_id: fields[1].parse().map_err(|_| Error::InvalidInput)?,
            ip: fields[2].to_string(),
            port: fields[3].parse().map_err(|_| Error::InvalidInput)?,
            public_ip: fields[4].to_string(),
            public_port: fields[5].parse().map_err(|_| Error::InvalidInput)?,
            is_public: fields[6] == "1",
            timestamp: fields[7].parse().map_err(|_| Error::InvalidInput)?,
            sequence: fields[8].parse().map_err(|_| Error::InvalidInput)?,
        })
    }
}

/// Directory publish record: `id:ip:port:public_ip:public_port:is_public`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub id: i32,
    pub ip: String,
    pub port: u16,
    pub public_ip: String,
    pub public_port: u16,
    pub is_public: bool,
}

impl DirectoryRecord {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.id,
            self.ip,
            self.port,
            self.public_ip,
            self.public_port,
            if self.is_public { 1 } else { 0 },
        )
    }

    pub fn decode(line: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() != 6 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            id: fields[0].parse().map_err(|_| Error::InvalidInput)?,
            ip: fields[1].to_string(),
            port: fields[2].parse().map_err(|_| Error::InvalidInput)?,
            public_ip: fields[3].to_string(),
            public_port: fields[4].parse().map_err(|_| Error::InvalidInput)?,
            is_public: fields[5] == "1",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multicast_frame_round_trips() {
        let frame = MulticastFrame {
            kind: MulticastKind::Announce,
            node_id: 42,
            ip: "10.0.0.5".into(),
            port: 8000,
            public_ip: "0.0.0.0".into(),
            public_port: 0,
            is_public: false,
            timestamp: 1700000000,
            sequence: 5,
        };

        assert_eq!(MulticastFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn directory_record_round_trips() {
        let record = DirectoryRecord {
            id: 1,
            ip: "127.0.0.1".into(),
            port: 8000,
            public_ip: "203.0.113.5".into(),
            public_port: 40000,
            is_public: true,
        };

        assert_eq!(DirectoryRecord::decode(&record.encode()).unwrap(), record);
    }
}
