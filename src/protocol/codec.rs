//! Wire codec
//!
//! Converts between typed field values and on-wire bytes using a packet
//! layout. Multi-byte integers are little-endian, strings are NUL-padded to
//! their declared width, and variable-length packets carry their total length
//! as a u16 at offset 2.

use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::net::buffer::{get_cstr, get_u16_le, get_u32_le, put_u16_le, put_u32_le, MAX_PACKET_SIZE};
use crate::protocol::layout::{
    FieldDef, FieldKind, PackedMove, PackedPos, PacketLayout, PacketLen, MAX_VARIABLE_LEN,
    MIN_VARIABLE_LEN,
};
use crate::protocol::packet_db::PacketDb;

/// A single field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Str(String),
    Pos(PackedPos),
    Move(PackedMove),
}

macro_rules! int_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                FieldValue::Int(v as i64)
            }
        })*
    };
}

int_value!(u8, i8, u16, i16, u32, i32, i64);

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<PackedPos> for FieldValue {
    fn from(v: PackedPos) -> Self {
        FieldValue::Pos(v)
    }
}

impl From<PackedMove> for FieldValue {
    fn from(v: PackedMove) -> Self {
        FieldValue::Move(v)
    }
}

/// Named field values in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues {
    entries: Vec<(&'static str, FieldValue)>,
}

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: &'static str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a value
    pub fn set(&mut self, name: &'static str, value: impl Into<FieldValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, FieldValue)> {
        self.entries.iter()
    }

    pub fn int(&self, name: &'static str) -> Result<i64, ProtocolError> {
        match self.get(name) {
            Some(FieldValue::Int(v)) => Ok(*v),
            Some(_) => Err(ProtocolError::TypeMismatch { field: name }),
            None => Err(ProtocolError::MissingField { field: name }),
        }
    }

    /// Integer field narrowed to `T`, out of range values are an error
    pub fn int_as<T: TryFrom<i64>>(&self, name: &'static str) -> Result<T, ProtocolError> {
        T::try_from(self.int(name)?).map_err(|_| ProtocolError::FieldOutOfRange { field: name })
    }

    pub fn string(&self, name: &'static str) -> Result<&str, ProtocolError> {
        match self.get(name) {
            Some(FieldValue::Str(v)) => Ok(v),
            Some(_) => Err(ProtocolError::TypeMismatch { field: name }),
            None => Err(ProtocolError::MissingField { field: name }),
        }
    }

    pub fn pos(&self, name: &'static str) -> Result<PackedPos, ProtocolError> {
        match self.get(name) {
            Some(FieldValue::Pos(v)) => Ok(*v),
            Some(_) => Err(ProtocolError::TypeMismatch { field: name }),
            None => Err(ProtocolError::MissingField { field: name }),
        }
    }
}

/// A complete inbound packet after opcode resolution
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub opcode: u16,
    pub values: FieldValues,
    /// The raw frame, header included
    pub frame: Bytes,
}

impl DecodedPacket {
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
}

impl fmt::Debug for DecodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedPacket")
            .field("opcode", &format_args!("0x{:04x}", self.opcode))
            .field("len", &self.frame.len())
            .field("values", &self.values)
            .finish()
    }
}

/// Encode a packet from named values
///
/// Every field of the layout must be supplied. Values for names the layout
/// does not carry are ignored, which lets builders supply fields that only
/// exist in some client versions.
pub fn encode(layout: &PacketLayout, values: &FieldValues) -> Result<Vec<u8>, ProtocolError> {
    let mut total = layout.len.min_len();
    for field in layout.fields.iter().filter(|f| f.kind == FieldKind::Tail) {
        total = field.offset + tail_len(field, values)?;
    }

    if total > MAX_PACKET_SIZE {
        return Err(ProtocolError::BufferOverflow {
            requested: total,
            remaining: MAX_PACKET_SIZE,
        });
    }

    let mut buf = vec![0u8; total];
    put_u16_le(&mut buf, 0, layout.opcode);
    if layout.len.is_variable() {
        put_u16_le(&mut buf, 2, total as u16);
    }

    for field in layout.fields {
        let value = values
            .get(field.name)
            .ok_or(ProtocolError::MissingField { field: field.name })?;
        write_field(&mut buf, field, value)?;
    }

    Ok(buf)
}

fn tail_len(field: &FieldDef, values: &FieldValues) -> Result<usize, ProtocolError> {
    match values.get(field.name) {
        // Text tails go out NUL-terminated
        Some(FieldValue::Str(s)) => Ok(s.len() + 1),
        Some(_) => Err(ProtocolError::TypeMismatch { field: field.name }),
        None => Err(ProtocolError::MissingField { field: field.name }),
    }
}

fn write_field(buf: &mut [u8], field: &FieldDef, value: &FieldValue) -> Result<(), ProtocolError> {
    let at = field.offset;
    match (field.kind, value) {
        (kind, FieldValue::Int(v)) => {
            let Some((lo, hi)) = kind.int_range() else {
                return Err(ProtocolError::TypeMismatch { field: field.name });
            };
            if *v < lo || *v > hi {
                return Err(ProtocolError::FieldOutOfRange { field: field.name });
            }
            match kind {
                FieldKind::U8 | FieldKind::I8 => buf[at] = *v as u8,
                FieldKind::U16 | FieldKind::I16 => put_u16_le(buf, at, *v as u16),
                _ => put_u32_le(buf, at, *v as u32),
            }
        }
        // An embedded NUL would end the string early on the client
        (FieldKind::Str(_) | FieldKind::Tail, FieldValue::Str(s)) if s.contains('\0') => {
            return Err(ProtocolError::FieldOutOfRange { field: field.name });
        }
        (FieldKind::Str(width), FieldValue::Str(s)) => {
            let bytes = s.as_bytes();
            if bytes.len() > width {
                return Err(ProtocolError::StringTooLong {
                    field: field.name,
                    width,
                });
            }
            buf[at..at + bytes.len()].copy_from_slice(bytes);
        }
        (FieldKind::Pos, FieldValue::Pos(p)) => {
            if !p.is_encodable() {
                return Err(ProtocolError::FieldOutOfRange { field: field.name });
            }
            buf[at..at + 3].copy_from_slice(&p.to_bytes());
        }
        (FieldKind::Move, FieldValue::Move(m)) => {
            if !m.is_encodable() {
                return Err(ProtocolError::FieldOutOfRange { field: field.name });
            }
            buf[at..at + 6].copy_from_slice(&m.to_bytes());
        }
        (FieldKind::Tail, FieldValue::Str(s)) => {
            buf[at..at + s.len()].copy_from_slice(s.as_bytes());
        }
        _ => return Err(ProtocolError::TypeMismatch { field: field.name }),
    }
    Ok(())
}

/// Length of the packet at the front of `buf`
///
/// Returns `Ok(None)` while a variable-length header is still incomplete.
pub fn frame_length(opcode: u16, len: PacketLen, buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    match len {
        PacketLen::Fixed(len) => Ok(Some(len as usize)),
        PacketLen::Variable { min } => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let declared = get_u16_le(buf, 2) as usize;
            let floor = (min as usize).max(MIN_VARIABLE_LEN);
            if declared < floor || declared > MAX_VARIABLE_LEN {
                return Err(ProtocolError::InvalidLength {
                    opcode,
                    length: declared,
                });
            }
            Ok(Some(declared))
        }
    }
}

/// Decode the fields of a complete frame
pub fn decode_fields(layout: &PacketLayout, frame: &[u8]) -> Result<FieldValues, ProtocolError> {
    let mut values = FieldValues::new();
    for field in layout.fields {
        let at = field.offset;
        let needed = at + field.kind.width().unwrap_or(0);
        if needed > frame.len() {
            return Err(ProtocolError::Truncated {
                opcode: layout.opcode,
                needed,
                available: frame.len(),
            });
        }
        let value = match field.kind {
            FieldKind::U8 => FieldValue::Int(frame[at] as i64),
            FieldKind::I8 => FieldValue::Int(frame[at] as i8 as i64),
            FieldKind::U16 => FieldValue::Int(get_u16_le(frame, at) as i64),
            FieldKind::I16 => FieldValue::Int(get_u16_le(frame, at) as i16 as i64),
            FieldKind::U32 => FieldValue::Int(get_u32_le(frame, at) as i64),
            FieldKind::I32 => FieldValue::Int(get_u32_le(frame, at) as i32 as i64),
            FieldKind::Str(width) => FieldValue::Str(get_cstr(&frame[at..at + width])),
            FieldKind::Pos => FieldValue::Pos(PackedPos::from_bytes([
                frame[at],
                frame[at + 1],
                frame[at + 2],
            ])),
            FieldKind::Move => {
                let mut raw = [0u8; 6];
                raw.copy_from_slice(&frame[at..at + 6]);
                FieldValue::Move(PackedMove::from_bytes(raw))
            }
            FieldKind::Tail => FieldValue::Str(get_cstr(&frame[at..])),
        };
        values.set(field.name, value);
    }
    Ok(values)
}

/// Decode one complete packet
///
/// `buf` must hold exactly one packet: fewer bytes than its length is
/// `Truncated`, more is `LengthMismatch`. The opcode is read as-is.
pub fn decode(db: &PacketDb, buf: &[u8]) -> Result<DecodedPacket, ProtocolError> {
    if buf.len() < 2 {
        return Err(ProtocolError::Truncated {
            opcode: 0,
            needed: 2,
            available: buf.len(),
        });
    }
    let opcode = get_u16_le(buf, 0);
    let descriptor = db
        .lookup(opcode)
        .ok_or(ProtocolError::UnknownOpcode { opcode })?;

    let needed = frame_length(opcode, descriptor.len, buf)?.ok_or(ProtocolError::Truncated {
        opcode,
        needed: MIN_VARIABLE_LEN,
        available: buf.len(),
    })?;

    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            opcode,
            needed,
            available: buf.len(),
        });
    }
    if buf.len() > needed {
        return Err(ProtocolError::LengthMismatch {
            opcode,
            expected: needed,
            actual: buf.len(),
        });
    }

    decode_frame(descriptor.layout, opcode, Bytes::copy_from_slice(buf))
}

/// Build a decoded packet from a frame whose length is already validated
pub fn decode_frame(
    layout: Option<&PacketLayout>,
    opcode: u16,
    frame: Bytes,
) -> Result<DecodedPacket, ProtocolError> {
    let values = match layout {
        Some(layout) => decode_fields(layout, &frame)?,
        None => FieldValues::new(),
    };
    Ok(DecodedPacket {
        opcode,
        values,
        frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::layout::FieldDef;
    use crate::protocol::packet_db::PacketDbBuilder;
    use crate::protocol::version::PacketVersion;
    use pretty_assertions::assert_eq;

    static VANISH_FIELDS: [FieldDef; 2] = [
        FieldDef::new("id", 2, FieldKind::U32),
        FieldDef::new("type", 6, FieldKind::U8),
    ];

    static VANISH: PacketLayout = PacketLayout {
        name: "vanish",
        opcode: 0x0080,
        len: PacketLen::Fixed(7),
        fields: &VANISH_FIELDS,
    };

    static MESSAGE_FIELDS: [FieldDef; 2] = [
        FieldDef::new("id", 4, FieldKind::U32),
        FieldDef::new("message", 8, FieldKind::Tail),
    ];

    static MESSAGE: PacketLayout = PacketLayout {
        name: "message",
        opcode: 0x008d,
        len: PacketLen::Variable { min: 8 },
        fields: &MESSAGE_FIELDS,
    };

    static NAME_FIELDS: [FieldDef; 2] = [
        FieldDef::new("id", 2, FieldKind::U32),
        FieldDef::new("name", 6, FieldKind::Str(24)),
    ];

    static NAME: PacketLayout = PacketLayout {
        name: "name",
        opcode: 0x0095,
        len: PacketLen::Fixed(30),
        fields: &NAME_FIELDS,
    };

    fn db() -> PacketDb {
        let mut builder = PacketDbBuilder::new(PacketVersion(20101124));
        builder.register_layout(&VANISH, None).unwrap();
        builder.register_layout(&MESSAGE, None).unwrap();
        builder.register_layout(&NAME, None).unwrap();
        builder.build()
    }

    #[test]
    fn test_encode_fixed() {
        let values = FieldValues::new().with("id", 0x0102_0304u32).with("type", 1u8);
        let bytes = encode(&VANISH, &values).unwrap();
        assert_eq!(bytes, vec![0x80, 0x00, 0x04, 0x03, 0x02, 0x01, 0x01]);
    }

    #[test]
    fn test_encode_variable_sets_length() {
        let values = FieldValues::new()
            .with("id", 5u32)
            .with("message", "hi");
        let bytes = encode(&MESSAGE, &values).unwrap();
        assert_eq!(bytes.len(), 11);
        assert_eq!(get_u16_le(&bytes, 2), 11);
        assert_eq!(&bytes[8..], b"hi\0");
    }

    #[test]
    fn test_encode_errors() {
        let values = FieldValues::new().with("id", 1u32);
        assert_eq!(
            encode(&VANISH, &values),
            Err(ProtocolError::MissingField { field: "type" })
        );

        let values = FieldValues::new().with("id", 1u32).with("type", 300);
        assert_eq!(
            encode(&VANISH, &values),
            Err(ProtocolError::FieldOutOfRange { field: "type" })
        );

        let values = FieldValues::new().with("id", -1).with("type", 0u8);
        assert_eq!(
            encode(&VANISH, &values),
            Err(ProtocolError::FieldOutOfRange { field: "id" })
        );

        let values = FieldValues::new()
            .with("id", 1u32)
            .with("name", "a".repeat(25));
        assert_eq!(
            encode(&NAME, &values),
            Err(ProtocolError::StringTooLong {
                field: "name",
                width: 24
            })
        );

        let values = FieldValues::new().with("id", "oops").with("type", 0u8);
        assert_eq!(
            encode(&VANISH, &values),
            Err(ProtocolError::TypeMismatch { field: "id" })
        );
    }

    #[test]
    fn test_extra_values_ignored() {
        let values = FieldValues::new()
            .with("id", 9u32)
            .with("type", 0u8)
            .with("object_type", 1u8);
        assert_eq!(encode(&VANISH, &values).unwrap().len(), 7);
    }

    #[test]
    fn test_decode_roundtrip_name() {
        let values = FieldValues::new().with("id", 42u32).with("name", "Poring");
        let bytes = encode(&NAME, &values).unwrap();
        let packet = decode(&db(), &bytes).unwrap();
        assert_eq!(packet.opcode, 0x0095);
        assert_eq!(packet.len(), 30);
        assert_eq!(packet.values, values);
    }

    #[test]
    fn test_decode_text_tail() {
        let values = FieldValues::new().with("id", 5u32).with("message", "hi");
        let bytes = encode(&MESSAGE, &values).unwrap();
        let decoded = decode_fields(&MESSAGE, &bytes).unwrap();
        assert_eq!(decoded.get("message"), Some(&FieldValue::Str("hi".to_string())));
        assert_eq!(decoded, values);

        // Clients sometimes pad past the terminator
        let mut padded = bytes.clone();
        padded.extend_from_slice(&[0, 0x41]);
        assert_eq!(decode_fields(&MESSAGE, &padded).unwrap().string("message"), Ok("hi"));

        let values = FieldValues::new().with("id", 5u32).with("message", "a\0b");
        assert_eq!(
            encode(&MESSAGE, &values),
            Err(ProtocolError::FieldOutOfRange { field: "message" })
        );
        let values = FieldValues::new().with("id", 5u32).with("message", 7);
        assert_eq!(
            encode(&MESSAGE, &values),
            Err(ProtocolError::TypeMismatch { field: "message" })
        );
    }

    fn sample_values(layout: &PacketLayout) -> FieldValues {
        let mut values = FieldValues::new();
        for (i, field) in layout.fields.iter().enumerate() {
            let step = i as i64;
            let value = match field.kind {
                FieldKind::Str(width) => FieldValue::Str(field.name[..field.name.len().min(width)].to_string()),
                FieldKind::Tail => FieldValue::Str(format!("{} text", field.name)),
                FieldKind::Pos => FieldValue::Pos(PackedPos::new(100 + i as u16, 200, 3)),
                FieldKind::Move => FieldValue::Move(PackedMove::new((10, 20), (30 + i as u16, 40))),
                kind => {
                    let (lo, hi) = kind.int_range().unwrap();
                    // Signed kinds go negative to exercise sign extension
                    FieldValue::Int(if lo < 0 { lo + 1 + step } else { hi - step })
                }
            };
            values.set(field.name, value);
        }
        values
    }

    fn assert_roundtrip(layout: &PacketLayout) {
        let values = sample_values(layout);
        let bytes = encode(layout, &values).unwrap();
        let decoded = decode_fields(layout, &bytes).unwrap();
        assert_eq!(decoded, values, "{} 0x{:04x}", layout.name, layout.opcode);
    }

    #[test]
    fn test_every_layout_roundtrips() {
        use crate::protocol::{builders, handlers};

        let tables = [
            &builders::UNIT_IDLE,
            &builders::UNIT_SPAWN,
            &builders::UNIT_WALKING,
            &builders::DAMAGE,
            &handlers::ENTER,
            &handlers::LOAD_END,
            &handlers::TICK,
            &handlers::WALK,
            &handlers::ACTION,
            &handlers::GLOBAL_MESSAGE,
            &handlers::CHANGE_DIR,
            &handlers::EMOTION,
            &handlers::LEAVE_CHAT,
            &handlers::QUIT,
        ];
        for table in tables {
            for row in table.rows {
                assert_roundtrip(&row.layout);
            }
        }

        for layout in [
            &builders::VANISH,
            &builders::NOTIFY_TIME,
            &builders::NOTIFY_CHAT,
            &builders::NOTIFY_SELF_CHAT,
            &builders::CHANGE_DIR,
            &builders::EMOTION,
            &builders::QUIT_ACK,
            &builders::ITEM_ENTRY,
            &builders::ITEM_DISAPPEAR,
            &builders::SKILL_ENTRY,
            &builders::SKILL_DISAPPEAR,
            &builders::ROOM_ENTRY,
            &builders::ROOM_DESTROY,
        ] {
            assert_roundtrip(layout);
        }
    }

    #[test]
    fn test_registered_handlers_roundtrip_per_version() {
        use crate::protocol::handlers::register_core_handlers;

        for version in [20040701, 20040710, 20080102, 20091103, 20101124, 20120410] {
            let mut builder = PacketDbBuilder::new(PacketVersion(version));
            register_core_handlers(&mut builder).unwrap();
            let db = builder.build();
            for opcode in db.opcodes() {
                let layout = db.lookup(opcode).and_then(|d| d.layout).unwrap();
                let values = sample_values(layout);
                let bytes = encode(layout, &values).unwrap();
                let packet = decode(&db, &bytes).unwrap();
                assert_eq!(packet.values, values, "{} at {}", layout.name, version);
            }
        }
    }

    #[test]
    fn test_decode_length_checks() {
        let db = db();

        assert_eq!(
            decode(&db, &[0x80, 0x00, 1, 2, 3]),
            Err(ProtocolError::Truncated {
                opcode: 0x0080,
                needed: 7,
                available: 5
            })
        );

        assert_eq!(
            decode(&db, &[0x80, 0x00, 1, 2, 3, 4, 5, 6]),
            Err(ProtocolError::LengthMismatch {
                opcode: 0x0080,
                expected: 7,
                actual: 8
            })
        );

        assert_eq!(
            decode(&db, &[0x34, 0x12, 0, 0]),
            Err(ProtocolError::UnknownOpcode { opcode: 0x1234 })
        );

        // Declared length below the fixed part
        assert_eq!(
            decode(&db, &[0x8d, 0x00, 0x03, 0x00]),
            Err(ProtocolError::InvalidLength {
                opcode: 0x008d,
                length: 3
            })
        );
    }

    #[test]
    fn test_frame_length_bounds() {
        let var = PacketLen::Variable { min: 4 };
        assert_eq!(frame_length(1, var, &[0, 0, 4]), Ok(None));
        assert_eq!(frame_length(1, var, &[0, 0, 4, 0]), Ok(Some(4)));
        assert_eq!(frame_length(1, var, &[0, 0, 0x00, 0x80]), Ok(Some(32768)));
        assert_eq!(
            frame_length(1, var, &[0, 0, 0x01, 0x80]),
            Err(ProtocolError::InvalidLength {
                opcode: 1,
                length: 32769
            })
        );
        assert_eq!(frame_length(1, PacketLen::Fixed(9), &[]), Ok(Some(9)));
    }
}
