//! C2: bidirectional UID/GID mapping and the `user.rootlesscontainers`
//! rootless-emulation xattr codec.

use crate::error::{Error, IdKind, Result};

/// One interval of a piecewise-linear UID/GID mapping: `size` consecutive
/// ids starting at `host_id` correspond to `size` consecutive ids starting
/// at `container_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub host_id: u32,
    pub container_id: u32,
    pub size: u32,
}

impl IdMap {
    fn to_container(&self, host_id: u32) -> Option<u32> {
        let offset = host_id.checked_sub(self.host_id)?;
        (offset < self.size).then(|| self.container_id + offset)
    }

    fn to_host(&self, container_id: u32) -> Option<u32> {
        let offset = container_id.checked_sub(self.container_id)?;
        (offset < self.size).then(|| self.host_id + offset)
    }
}

/// Map a host-side id to its container-side equivalent through the first
/// matching interval. No mappings at all means no mapping is configured:
/// treat it as identity rather than rejecting every id.
pub fn to_container(host_id: u32, maps: &[IdMap], kind: IdKind) -> Result<u32> {
    if maps.is_empty() {
        return Ok(host_id);
    }
    maps.iter()
        .find_map(|m| m.to_container(host_id))
        .ok_or(Error::IdMapError { id: host_id, kind })
}

/// Map a container-side id to its host-side equivalent through the first
/// matching interval. No mappings at all means no mapping is configured:
/// treat it as identity rather than rejecting every id.
pub fn to_host(container_id: u32, maps: &[IdMap], kind: IdKind) -> Result<u32> {
    if maps.is_empty() {
        return Ok(container_id);
    }
    maps.iter()
        .find_map(|m| m.to_host(container_id))
        .ok_or(Error::IdMapError {
            id: container_id,
            kind,
        })
}

/// Name of the xattr used to carry the rootless-emulation payload.
pub const ROOTLESS_XATTR: &str = "user.rootlesscontainers";

/// Sentinel value in the wire protocol meaning "leave this field unchanged".
const UNSET: u32 = 0xFFFF_FFFF;

/// The decoded payload of a `user.rootlesscontainers` xattr: a two-field
/// Protocol Buffers message (`uid`, `gid`, both optional `uint32`) where the
/// sentinel `0xFFFFFFFF` means the field was not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootlessResource {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl RootlessResource {
    pub fn new(uid: u32, gid: u32) -> Self {
        RootlessResource {
            uid: (uid != UNSET).then_some(uid),
            gid: (gid != UNSET).then_some(gid),
        }
    }

    /// Encode as the minimal protobuf wire format: field 1 (`uid`) and field
    /// 2 (`gid`), both varint-encoded, tag `(field_number << 3) | wire_type`
    /// with `wire_type = 0` (varint). A field whose value is the sentinel is
    /// still emitted explicitly, since the encoder has no "absent" concept
    /// separate from the sentinel by design (this mirrors the upstream
    /// rootlesscontainers proto, which always sets both fields).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        encode_field(&mut buf, 1, self.uid.unwrap_or(UNSET));
        encode_field(&mut buf, 2, self.gid.unwrap_or(UNSET));
        buf
    }

    /// Decode a protobuf payload produced by `encode`. Unknown fields are
    /// skipped (wire-compatible with future additions to the message).
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut uid = None;
        let mut gid = None;
        let mut pos = 0;

        while pos < data.len() {
            let (tag, n) = decode_varint(&data[pos..])?;
            pos += n;
            let field_number = tag >> 3;
            let wire_type = tag & 0x7;
            if wire_type != 0 {
                // only varint fields are defined on this message; bail out
                // rather than guess at how to skip an unknown wire type.
                return None;
            }
            let (value, n) = decode_varint(&data[pos..])?;
            pos += n;
            let value = value as u32;
            match field_number {
                1 => uid = (value != UNSET).then_some(value),
                2 => gid = (value != UNSET).then_some(value),
                _ => {}
            }
        }

        Some(RootlessResource { uid, gid })
    }
}

fn encode_field(buf: &mut Vec<u8>, field_number: u64, value: u32) {
    encode_varint(buf, (field_number << 3) | 0);
    encode_varint(buf, value as u64);
}

fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn decode_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}
