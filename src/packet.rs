//! Wire codec (§4.B, §6): parses and serializes the line-oriented text
//! protocol, and validates a packet's required fields per its `type`.
//!
//! A `Packet` is an immutable request/reply value (§9 "Packet as mutable
//! bag" — the source mutates a shared instance across handlers; here every
//! handler builds a fresh `Packet` for its reply instead).

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::ring::{HashRange, NodeInfo};

/// Literal first line every packet must carry.
pub const MAGIC: &str = "CSE473 DHTPv0.1";

/// Default hop budget when a packet doesn't specify one (§6 "Defaults").
pub const DEFAULT_TTL: u32 = 100;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("missing magic header line")]
    MissingMagic,
    #[error("payload is not valid utf-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("unrecognized line: {0:?}")]
    UnrecognizedLine(String),
    #[error("invalid value for field {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Get,
    Put,
    Success,
    NoMatch,
    Failure,
    Join,
    Leave,
    Update,
    Transfer,
}

impl PacketType {
    fn as_wire(self) -> &'static str {
        match self {
            PacketType::Get => "get",
            PacketType::Put => "put",
            PacketType::Success => "success",
            PacketType::NoMatch => "no match",
            PacketType::Failure => "failure",
            PacketType::Join => "join",
            PacketType::Leave => "leave",
            PacketType::Update => "update",
            PacketType::Transfer => "transfer",
        }
    }
}

impl FromStr for PacketType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "get" => PacketType::Get,
            "put" => PacketType::Put,
            "success" => PacketType::Success,
            "no match" => PacketType::NoMatch,
            "failure" => PacketType::Failure,
            "join" => PacketType::Join,
            "leave" => PacketType::Leave,
            "update" => PacketType::Update,
            "transfer" => PacketType::Transfer,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A single parsed packet, request or reply. All fields beyond `kind` are
/// optional per §6's per-type table; `check()` enforces which combinations
/// are actually required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub key: Option<String>,
    pub val: Option<String>,
    pub tag: Option<u64>,
    pub ttl: Option<u32>,
    pub reason: Option<String>,
    pub client_adr: Option<SocketAddr>,
    pub relay_adr: Option<SocketAddr>,
    pub hash_range: Option<HashRange>,
    pub succ_info: Option<NodeInfo>,
    pub pred_info: Option<NodeInfo>,
    pub sender_info: Option<NodeInfo>,
}

impl Packet {
    /// A bare packet of the given type with every optional field absent.
    pub fn new(kind: PacketType) -> Self {
        Self {
            kind,
            key: None,
            val: None,
            tag: None,
            ttl: None,
            reason: None,
            client_adr: None,
            relay_adr: None,
            hash_range: None,
            succ_info: None,
            pred_info: None,
            sender_info: None,
        }
    }

    /// Effective ttl, defaulting per §6.
    pub fn ttl_or_default(&self) -> u32 {
        self.ttl.unwrap_or(DEFAULT_TTL)
    }

    /// Validates required fields per `type` (§4.B, §6's per-type table).
    /// On failure returns the diagnostic `reason` string for a `failure`
    /// reply; does not mutate `self`.
    pub fn check(&self) -> Result<(), String> {
        match self.kind {
            PacketType::Get => {
                if self.key.is_none() {
                    return Err("get requires key".to_string());
                }
            }
            PacketType::Put => {
                if self.key.is_none() {
                    return Err("put requires key".to_string());
                }
            }
            PacketType::Success => {
                if self.hash_range.is_none() {
                    return Err("success requires hashRange".to_string());
                }
            }
            PacketType::NoMatch => {
                if self.key.is_none() {
                    return Err("no match requires key".to_string());
                }
                if self.hash_range.is_none() {
                    return Err("no match requires hashRange".to_string());
                }
            }
            PacketType::Failure => {
                if self.reason.is_none() {
                    return Err("failure requires reason".to_string());
                }
            }
            PacketType::Join => {
                if self.sender_info.is_none() {
                    return Err("join requires senderInfo".to_string());
                }
                if self.pred_info.is_none() {
                    return Err("join requires predInfo".to_string());
                }
            }
            PacketType::Leave => {
                if self.sender_info.is_none() {
                    return Err("leave requires senderInfo".to_string());
                }
            }
            PacketType::Update => {
                if self.pred_info.is_none() && self.succ_info.is_none() && self.hash_range.is_none() {
                    return Err("update requires at least one of predInfo, succInfo, hashRange".to_string());
                }
            }
            PacketType::Transfer => {
                if self.key.is_none() {
                    return Err("transfer requires key".to_string());
                }
                if self.val.is_none() {
                    return Err("transfer requires val".to_string());
                }
                if self.sender_info.is_none() {
                    return Err("transfer requires senderInfo".to_string());
                }
            }
        }
        Ok(())
    }

    /// Serializes this packet to the wire format (§6). `tag` is assigned by
    /// the caller before this is invoked — see `dispatcher.rs`'s send path.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(MAGIC);
        out.push('\n');
        out.push_str(&format!("type:{}\n", self.kind));

        if let Some(ref key) = self.key {
            out.push_str(&format!("key:{key}\n"));
        }
        if let Some(ref val) = self.val {
            out.push_str(&format!("val:{val}\n"));
        }
        if let Some(tag) = self.tag {
            out.push_str(&format!("tag:{tag}\n"));
        }
        if let Some(ttl) = self.ttl {
            out.push_str(&format!("ttl:{ttl}\n"));
        }
        if let Some(ref reason) = self.reason {
            out.push_str(&format!("reason:{reason}\n"));
        }
        if let Some(adr) = self.client_adr {
            out.push_str(&format!("clientAdr:{adr}\n"));
        }
        if let Some(adr) = self.relay_adr {
            out.push_str(&format!("relayAdr:{adr}\n"));
        }
        if let Some(range) = self.hash_range {
            out.push_str(&format!("hashRange:{}:{}\n", range.low, range.high));
        }
        if let Some(info) = self.succ_info {
            out.push_str(&format!("succInfo:{}\n", encode_node_info(info)));
        }
        if let Some(info) = self.pred_info {
            out.push_str(&format!("predInfo:{}\n", encode_node_info(info)));
        }
        if let Some(info) = self.sender_info {
            out.push_str(&format!("senderInfo:{}\n", encode_node_info(info)));
        }

        out
    }

    /// Parses a received UDP payload into a `Packet`.
    pub fn decode(payload: &[u8]) -> Result<Self, PacketError> {
        let text = std::str::from_utf8(payload)?;
        let mut lines = text.lines();

        let magic = lines.next().ok_or(PacketError::MissingMagic)?;
        if magic != MAGIC {
            return Err(PacketError::MissingMagic);
        }

        let mut kind = None;
        let mut packet = Packet::new(PacketType::Get);

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (field, value) = line
                .split_once(':')
                .ok_or_else(|| PacketError::UnrecognizedLine(line.to_string()))?;

            match field {
                "type" => {
                    kind = Some(value.parse::<PacketType>().map_err(|_| PacketError::InvalidField {
                        field: "type",
                        value: value.to_string(),
                    })?);
                }
                "key" => packet.key = Some(value.to_string()),
                "val" => packet.val = Some(value.to_string()),
                "tag" => {
                    packet.tag = Some(value.parse().map_err(|_| PacketError::InvalidField {
                        field: "tag",
                        value: value.to_string(),
                    })?)
                }
                "ttl" => {
                    packet.ttl = Some(value.parse().map_err(|_| PacketError::InvalidField {
                        field: "ttl",
                        value: value.to_string(),
                    })?)
                }
                "reason" => packet.reason = Some(value.to_string()),
                "clientAdr" => {
                    packet.client_adr = Some(value.parse().map_err(|_| PacketError::InvalidField {
                        field: "clientAdr",
                        value: value.to_string(),
                    })?)
                }
                "relayAdr" => {
                    packet.relay_adr = Some(value.parse().map_err(|_| PacketError::InvalidField {
                        field: "relayAdr",
                        value: value.to_string(),
                    })?)
                }
                "hashRange" => {
                    packet.hash_range = Some(decode_hash_range(value).ok_or_else(|| PacketError::InvalidField {
                        field: "hashRange",
                        value: value.to_string(),
                    })?)
                }
                "succInfo" => {
                    packet.succ_info = Some(decode_node_info(value).ok_or_else(|| PacketError::InvalidField {
                        field: "succInfo",
                        value: value.to_string(),
                    })?)
                }
                "predInfo" => {
                    packet.pred_info = Some(decode_node_info(value).ok_or_else(|| PacketError::InvalidField {
                        field: "predInfo",
                        value: value.to_string(),
                    })?)
                }
                "senderInfo" => {
                    packet.sender_info = Some(decode_node_info(value).ok_or_else(|| PacketError::InvalidField {
                        field: "senderInfo",
                        value: value.to_string(),
                    })?)
                }
                _ => return Err(PacketError::UnrecognizedLine(line.to_string())),
            }
        }

        packet.kind = kind.ok_or_else(|| PacketError::UnrecognizedLine("missing type line".to_string()))?;
        Ok(packet)
    }
}

/// `ip:port:firstHash`. Split off the trailing `firstHash` field first (via
/// `rsplitn`) so an IPv6 address's own colons don't confuse the split.
fn encode_node_info(info: NodeInfo) -> String {
    format!("{}:{}", info.address, info.first_hash)
}

fn decode_node_info(value: &str) -> Option<NodeInfo> {
    let mut parts = value.rsplitn(2, ':');
    let first_hash: u32 = parts.next()?.parse().ok()?;
    let address_part = parts.next()?;
    let address: SocketAddr = address_part.parse().ok()?;
    Some(NodeInfo::new(address, first_hash))
}

fn decode_hash_range(value: &str) -> Option<HashRange> {
    let mut parts = value.splitn(2, ':');
    let low: u32 = parts.next()?.parse().ok()?;
    let high: u32 = parts.next()?.parse().ok()?;
    Some(HashRange::new(low, high))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn round_trips_a_get_packet() {
        let mut p = Packet::new(PacketType::Get);
        p.key = Some("dungeons".to_string());
        p.tag = Some(7);
        p.ttl = Some(100);
        p.client_adr = Some(addr(9000));

        let encoded = p.encode();
        let decoded = Packet::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn round_trips_node_info_fields() {
        let mut p = Packet::new(PacketType::Join);
        p.sender_info = Some(NodeInfo::new(addr(9001), 42));
        p.pred_info = Some(NodeInfo::new(addr(9000), 0));

        let encoded = p.encode();
        let decoded = Packet::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.sender_info, p.sender_info);
        assert_eq!(decoded.pred_info, p.pred_info);
    }

    #[test]
    fn decode_rejects_missing_magic() {
        let payload = b"type:get\nkey:x\n";
        let err = Packet::decode(payload).unwrap_err();
        assert!(matches!(err, PacketError::MissingMagic));
    }

    #[test]
    fn decode_rejects_unrecognized_line() {
        let payload = format!("{MAGIC}\ntype:get\nkey:x\nbogus:1\n");
        let err = Packet::decode(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, PacketError::UnrecognizedLine(_)));
    }

    #[test]
    fn check_requires_key_for_get() {
        let p = Packet::new(PacketType::Get);
        assert_eq!(p.check(), Err("get requires key".to_string()));
    }

    #[test]
    fn check_requires_senderinfo_and_predinfo_for_join() {
        let mut p = Packet::new(PacketType::Join);
        assert!(p.check().is_err());
        p.sender_info = Some(NodeInfo::new(addr(9000), 0));
        assert!(p.check().is_err());
        p.pred_info = Some(NodeInfo::new(addr(9001), 0));
        assert!(p.check().is_ok());
    }

    #[test]
    fn check_update_requires_at_least_one_field() {
        let p = Packet::new(PacketType::Update);
        assert!(p.check().is_err());
        let mut p2 = Packet::new(PacketType::Update);
        p2.hash_range = Some(HashRange::new(0, 10));
        assert!(p2.check().is_ok());
    }

    #[test]
    fn hash_range_wire_format_is_low_colon_high() {
        let mut p = Packet::new(PacketType::Success);
        p.hash_range = Some(HashRange::new(5, 10));
        let encoded = p.encode();
        assert!(encoded.contains("hashRange:5:10\n"));
    }

    #[test]
    fn no_match_type_serializes_with_space() {
        let mut p = Packet::new(PacketType::NoMatch);
        p.key = Some("k".to_string());
        p.hash_range = Some(HashRange::new(0, 1));
        let encoded = p.encode();
        assert!(encoded.contains("type:no match\n"));
        let decoded = Packet::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.kind, PacketType::NoMatch);
    }

    #[test]
    fn ttl_defaults_when_absent() {
        let p = Packet::new(PacketType::Get);
        assert_eq!(p.ttl_or_default(), DEFAULT_TTL);
    }
}
