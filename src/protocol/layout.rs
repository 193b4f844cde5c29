//! Static packet layouts
//!
//! A layout names every field of a packet together with its byte offset and
//! wire type. Layouts are grouped into tables of version-ranged rows so the
//! same logical packet can move opcodes, grow fields or shift offsets between
//! client releases while the rest of the server keeps using field names.

use crate::error::RegistryError;
use crate::protocol::version::{PacketVersion, VersionRange};

/// Largest declared length a variable-length packet may carry
pub const MAX_VARIABLE_LEN: usize = 32768;

/// Smallest declared length a variable-length packet may carry (opcode + length)
pub const MIN_VARIABLE_LEN: usize = 4;

/// Wire type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    /// Fixed-width, NUL-padded string
    Str(usize),
    /// 3-byte packed x/y/direction
    Pos,
    /// 6-byte packed source/destination cells
    Move,
    /// NUL-terminated text running from the offset to the end of a
    /// variable-length packet
    Tail,
}

impl FieldKind {
    /// Width on the wire, `None` for the open-ended tail
    pub const fn width(&self) -> Option<usize> {
        match self {
            FieldKind::U8 | FieldKind::I8 => Some(1),
            FieldKind::U16 | FieldKind::I16 => Some(2),
            FieldKind::U32 | FieldKind::I32 => Some(4),
            FieldKind::Str(width) => Some(*width),
            FieldKind::Pos => Some(3),
            FieldKind::Move => Some(6),
            FieldKind::Tail => None,
        }
    }

    /// Inclusive numeric range for integer kinds
    pub const fn int_range(&self) -> Option<(i64, i64)> {
        match self {
            FieldKind::U8 => Some((0, u8::MAX as i64)),
            FieldKind::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
            FieldKind::U16 => Some((0, u16::MAX as i64)),
            FieldKind::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            FieldKind::U32 => Some((0, u32::MAX as i64)),
            FieldKind::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
            _ => None,
        }
    }
}

/// A named field at a fixed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const fn new(name: &'static str, offset: usize, kind: FieldKind) -> Self {
        Self { name, offset, kind }
    }
}

/// Declared packet length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLen {
    Fixed(u16),
    /// Length carried in bytes 2..4; `min` covers opcode, length and fixed fields
    Variable { min: u16 },
}

impl PacketLen {
    pub fn is_variable(&self) -> bool {
        matches!(self, PacketLen::Variable { .. })
    }

    /// Bytes every instance carries at minimum
    pub fn min_len(&self) -> usize {
        match self {
            PacketLen::Fixed(len) => *len as usize,
            PacketLen::Variable { min } => *min as usize,
        }
    }
}

/// Layout of one packet for one range of client versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub name: &'static str,
    pub opcode: u16,
    pub len: PacketLen,
    pub fields: &'static [FieldDef],
}

impl PacketLayout {
    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check that every field fits inside the declared length and that fields
    /// do not overlap each other or the header.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let header = if self.len.is_variable() { 4 } else { 2 };
        let min_len = self.len.min_len();

        if min_len < header {
            return Err(RegistryError::LengthMismatch {
                opcode: self.opcode,
                declared: min_len,
                layout: header,
            });
        }

        let mut cursor = header;
        for (i, field) in self.fields.iter().enumerate() {
            if field.offset < cursor {
                return Err(RegistryError::OffsetOutOfBounds {
                    opcode: self.opcode,
                    offset: field.offset,
                });
            }
            match field.kind.width() {
                Some(width) => {
                    if field.offset + width > min_len {
                        return Err(RegistryError::OffsetOutOfBounds {
                            opcode: self.opcode,
                            offset: field.offset,
                        });
                    }
                    cursor = field.offset + width;
                }
                None => {
                    // The tail only makes sense as the last field of a variable packet
                    let is_last = i + 1 == self.fields.len();
                    if !self.len.is_variable() || !is_last || field.offset != min_len {
                        return Err(RegistryError::OffsetOutOfBounds {
                            opcode: self.opcode,
                            offset: field.offset,
                        });
                    }
                    cursor = field.offset;
                }
            }
        }

        Ok(())
    }
}

/// A layout valid for a range of client versions
#[derive(Debug, Clone, Copy)]
pub struct LayoutRow {
    pub versions: VersionRange,
    pub layout: PacketLayout,
}

/// Every known layout of a logical packet, newest row first
#[derive(Debug, Clone, Copy)]
pub struct LayoutTable {
    pub name: &'static str,
    pub rows: &'static [LayoutRow],
}

impl LayoutTable {
    /// Pick the first row whose range contains `version`
    pub fn resolve(&self, version: PacketVersion) -> Result<&'static PacketLayout, RegistryError> {
        self.rows
            .iter()
            .find(|row| row.versions.contains(version))
            .map(|row| &row.layout)
            .ok_or(RegistryError::NoLayoutForVersion {
                packet: self.name,
                version: version.0,
            })
    }
}

/// Cell coordinates packed into three bytes (x:10, y:10, dir:4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedPos {
    pub x: u16,
    pub y: u16,
    pub dir: u8,
}

impl PackedPos {
    pub fn new(x: u16, y: u16, dir: u8) -> Self {
        Self { x, y, dir }
    }

    pub fn is_encodable(&self) -> bool {
        self.x < 1024 && self.y < 1024 && self.dir < 16
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [
            (self.x >> 2) as u8,
            ((self.x << 6) | ((self.y >> 4) & 0x3f)) as u8,
            ((self.y << 4) | (self.dir as u16 & 0x0f)) as u8,
        ]
    }

    pub fn from_bytes(p: [u8; 3]) -> Self {
        Self {
            x: ((p[0] as u16) << 2) | ((p[1] as u16) >> 6),
            y: (((p[1] as u16) & 0x3f) << 4) | ((p[2] as u16) >> 4),
            dir: p[2] & 0x0f,
        }
    }
}

/// Source and destination cells packed into six bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedMove {
    pub from_x: u16,
    pub from_y: u16,
    pub to_x: u16,
    pub to_y: u16,
    pub sub_x: u8,
    pub sub_y: u8,
}

impl PackedMove {
    pub fn new(from: (u16, u16), to: (u16, u16)) -> Self {
        Self {
            from_x: from.0,
            from_y: from.1,
            to_x: to.0,
            to_y: to.1,
            sub_x: 8,
            sub_y: 8,
        }
    }

    pub fn is_encodable(&self) -> bool {
        self.from_x < 1024
            && self.from_y < 1024
            && self.to_x < 1024
            && self.to_y < 1024
            && self.sub_x < 16
            && self.sub_y < 16
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        [
            (self.from_x >> 2) as u8,
            ((self.from_x << 6) | ((self.from_y >> 4) & 0x3f)) as u8,
            ((self.from_y << 4) | ((self.to_x >> 6) & 0x0f)) as u8,
            ((self.to_x << 2) | ((self.to_y >> 8) & 0x03)) as u8,
            self.to_y as u8,
            (self.sub_x << 4) | (self.sub_y & 0x0f),
        ]
    }

    pub fn from_bytes(p: [u8; 6]) -> Self {
        Self {
            from_x: ((p[0] as u16) << 2) | ((p[1] as u16) >> 6),
            from_y: (((p[1] as u16) & 0x3f) << 4) | ((p[2] as u16) >> 4),
            to_x: (((p[2] as u16) & 0x0f) << 6) | ((p[3] as u16) >> 2),
            to_y: (((p[3] as u16) & 0x03) << 8) | p[4] as u16,
            sub_x: p[5] >> 4,
            sub_y: p[5] & 0x0f,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    static WALK_FIELDS: [FieldDef; 1] = [FieldDef::new("dest", 2, FieldKind::Pos)];

    static OVERLAP_FIELDS: [FieldDef; 2] = [
        FieldDef::new("a", 2, FieldKind::U32),
        FieldDef::new("b", 4, FieldKind::U16),
    ];

    static ROWS: [LayoutRow; 2] = [
        LayoutRow {
            versions: VersionRange::from(5),
            layout: PacketLayout {
                name: "walk",
                opcode: 0x0087,
                len: PacketLen::Fixed(10),
                fields: &WALK_FIELDS,
            },
        },
        LayoutRow {
            versions: VersionRange::before(5),
            layout: PacketLayout {
                name: "walk",
                opcode: 0x0087,
                len: PacketLen::Fixed(8),
                fields: &WALK_FIELDS,
            },
        },
    ];

    #[test]
    fn test_resolve_picks_matching_row() {
        let table = LayoutTable {
            name: "walk",
            rows: &ROWS,
        };
        assert_eq!(table.resolve(PacketVersion(7)).unwrap().len, PacketLen::Fixed(10));
        assert_eq!(table.resolve(PacketVersion(4)).unwrap().len, PacketLen::Fixed(8));
    }

    #[test]
    fn test_resolve_without_row() {
        let table = LayoutTable {
            name: "walk",
            rows: &ROWS[..1],
        };
        assert_eq!(
            table.resolve(PacketVersion(4)),
            Err(RegistryError::NoLayoutForVersion {
                packet: "walk",
                version: 4
            })
        );
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let layout = PacketLayout {
            name: "bad",
            opcode: 0x0001,
            len: PacketLen::Fixed(8),
            fields: &OVERLAP_FIELDS,
        };
        assert!(layout.validate().is_err());

        let layout = PacketLayout {
            name: "short",
            opcode: 0x0002,
            len: PacketLen::Fixed(4),
            fields: &WALK_FIELDS,
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_length_below_header() {
        let layout = PacketLayout {
            name: "empty",
            opcode: 0x0003,
            len: PacketLen::Fixed(1),
            fields: &[],
        };
        assert_eq!(
            layout.validate(),
            Err(RegistryError::LengthMismatch {
                opcode: 0x0003,
                declared: 1,
                layout: 2
            })
        );
    }

    #[test]
    fn test_packed_pos() {
        let pos = PackedPos::new(153, 967, 5);
        assert_eq!(PackedPos::from_bytes(pos.to_bytes()), pos);
        // Known client encoding of (100, 200) facing 0
        assert_eq!(PackedPos::new(100, 200, 0).to_bytes(), [0x19, 0x0c, 0x80]);
    }

    #[test]
    fn test_packed_move() {
        let mv = PackedMove::new((1023, 0), (512, 777));
        assert!(mv.is_encodable());
        assert_eq!(PackedMove::from_bytes(mv.to_bytes()), mv);
    }
}
