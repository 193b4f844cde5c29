//! Packet dispatch table
//!
//! One `PacketDb` is built at startup for the configured client version and
//! is read-only afterwards. Registration fails fast on duplicate opcodes and
//! on length declarations that disagree with a layout.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::error::{ProtocolError, RegistryError};
use crate::protocol::codec::DecodedPacket;
use crate::protocol::handlers::HandlerContext;
use crate::protocol::layout::{LayoutTable, PacketLayout, PacketLen, MIN_VARIABLE_LEN};
use crate::protocol::version::PacketVersion;

/// Bytes taken by the opcode at the front of every packet
const OPCODE_LEN: usize = 2;

/// Most field offsets a descriptor may declare
pub const MAX_FIELD_OFFSETS: usize = 5;

/// Inbound packet handler
pub type Handler = fn(&mut HandlerContext, &DecodedPacket) -> Result<(), ProtocolError>;

/// Everything the dispatcher knows about one opcode
#[derive(Clone)]
pub struct PacketDescriptor {
    pub opcode: u16,
    pub len: PacketLen,
    field_offsets: Vec<usize>,
    pub handler: Option<Handler>,
    pub layout: Option<&'static PacketLayout>,
}

impl PacketDescriptor {
    /// Byte offsets of the fields a handler reads
    pub fn field_offsets(&self) -> &[usize] {
        &self.field_offsets
    }

    /// Offset of the `n`th declared field
    pub fn offset(&self, n: usize) -> Option<usize> {
        self.field_offsets.get(n).copied()
    }
}

impl fmt::Debug for PacketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketDescriptor")
            .field("opcode", &format_args!("0x{:04x}", self.opcode))
            .field("len", &self.len)
            .field("field_offsets", &self.field_offsets)
            .field("has_handler", &self.handler.is_some())
            .field("layout", &self.layout.map(|l| l.name))
            .finish()
    }
}

/// Builds the table for one client version
#[derive(Debug)]
pub struct PacketDbBuilder {
    version: PacketVersion,
    entries: HashMap<u16, PacketDescriptor>,
}

impl PacketDbBuilder {
    pub fn new(version: PacketVersion) -> Self {
        Self {
            version,
            entries: HashMap::new(),
        }
    }

    pub fn version(&self) -> PacketVersion {
        self.version
    }

    /// Declare only the length of an opcode
    ///
    /// A later layout registration for the same opcode must agree with it.
    pub fn declare_len(&mut self, opcode: u16, len: PacketLen) -> Result<&mut Self, RegistryError> {
        self.insert(opcode, len, Vec::new(), None, None)?;
        Ok(self)
    }

    /// Register an opcode by length and raw field offsets
    pub fn register(
        &mut self,
        opcode: u16,
        len: PacketLen,
        field_offsets: &[usize],
        handler: Option<Handler>,
    ) -> Result<&mut Self, RegistryError> {
        if field_offsets.len() > MAX_FIELD_OFFSETS {
            return Err(RegistryError::TooManyFields {
                opcode,
                count: field_offsets.len(),
                max: MAX_FIELD_OFFSETS,
            });
        }
        for &offset in field_offsets {
            if offset < 2 || offset >= len.min_len().max(MIN_VARIABLE_LEN) {
                return Err(RegistryError::OffsetOutOfBounds { opcode, offset });
            }
        }
        self.insert(opcode, len, field_offsets.to_vec(), handler, None)?;
        Ok(self)
    }

    /// Register an opcode from its layout
    pub fn register_layout(
        &mut self,
        layout: &'static PacketLayout,
        handler: Option<Handler>,
    ) -> Result<&mut Self, RegistryError> {
        layout.validate()?;
        if layout.fields.len() > MAX_FIELD_OFFSETS {
            return Err(RegistryError::TooManyFields {
                opcode: layout.opcode,
                count: layout.fields.len(),
                max: MAX_FIELD_OFFSETS,
            });
        }
        let offsets = layout.fields.iter().map(|f| f.offset).collect();
        self.insert(layout.opcode, layout.len, offsets, handler, Some(layout))?;
        Ok(self)
    }

    /// Register the row of `table` matching this builder's version
    pub fn register_table(
        &mut self,
        table: &LayoutTable,
        handler: Option<Handler>,
    ) -> Result<&mut Self, RegistryError> {
        let layout = table.resolve(self.version)?;
        self.register_layout(layout, handler)
    }

    fn insert(
        &mut self,
        opcode: u16,
        len: PacketLen,
        field_offsets: Vec<usize>,
        handler: Option<Handler>,
        layout: Option<&'static PacketLayout>,
    ) -> Result<(), RegistryError> {
        // A fixed packet must at least hold its own opcode
        if let PacketLen::Fixed(n) = len {
            if (n as usize) < OPCODE_LEN {
                return Err(RegistryError::LengthMismatch {
                    opcode,
                    declared: n as usize,
                    layout: OPCODE_LEN,
                });
            }
        }
        if let Some(existing) = self.entries.get_mut(&opcode) {
            let length_only =
                existing.handler.is_none() && existing.layout.is_none() && existing.field_offsets.is_empty();
            let incoming_length_only = handler.is_none() && layout.is_none() && field_offsets.is_empty();
            if !length_only || incoming_length_only {
                return Err(RegistryError::DuplicateOpcode(opcode));
            }
            if existing.len != len {
                return Err(RegistryError::LengthMismatch {
                    opcode,
                    declared: existing.len.min_len(),
                    layout: len.min_len(),
                });
            }
            existing.field_offsets = field_offsets;
            existing.handler = handler;
            existing.layout = layout;
            return Ok(());
        }

        self.entries.insert(
            opcode,
            PacketDescriptor {
                opcode,
                len,
                field_offsets,
                handler,
                layout,
            },
        );
        Ok(())
    }

    pub fn build(self) -> PacketDb {
        debug!(
            version = self.version.0,
            opcodes = self.entries.len(),
            "Packet table built"
        );
        PacketDb {
            version: self.version,
            entries: self.entries,
        }
    }
}

/// Read-only packet table for one client version
#[derive(Debug)]
pub struct PacketDb {
    version: PacketVersion,
    entries: HashMap<u16, PacketDescriptor>,
}

impl PacketDb {
    pub fn version(&self) -> PacketVersion {
        self.version
    }

    pub fn lookup(&self, opcode: u16) -> Option<&PacketDescriptor> {
        self.entries.get(&opcode)
    }

    pub fn contains(&self, opcode: u16) -> bool {
        self.entries.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered opcodes in ascending order
    pub fn opcodes(&self) -> Vec<u16> {
        let mut ops: Vec<u16> = self.entries.keys().copied().collect();
        ops.sort_unstable();
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::layout::{FieldDef, FieldKind, LayoutRow};
    use crate::protocol::version::VersionRange;

    static WALK_FIELDS: [FieldDef; 1] = [FieldDef::new("dest", 2, FieldKind::Pos)];

    static WALK_ROWS: [LayoutRow; 2] = [
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

    static WALK: LayoutTable = LayoutTable {
        name: "walk",
        rows: &WALK_ROWS,
    };

    fn noop(_: &mut HandlerContext, _: &DecodedPacket) -> Result<(), ProtocolError> {
        Ok(())
    }

    #[test]
    fn test_version_selects_length() {
        for (version, len) in [(7, 10), (5, 10), (4, 8)] {
            let mut builder = PacketDbBuilder::new(PacketVersion(version));
            builder.register_table(&WALK, Some(noop)).unwrap();
            let db = builder.build();
            assert_eq!(db.lookup(0x0087).unwrap().len, PacketLen::Fixed(len));
        }
    }

    #[test]
    fn test_duplicate_opcode_rejected() {
        let mut builder = PacketDbBuilder::new(PacketVersion(7));
        builder.register(0x0087, PacketLen::Fixed(10), &[2], Some(noop)).unwrap();
        assert_eq!(
            builder.register(0x0087, PacketLen::Fixed(10), &[2], Some(noop)).err(),
            Some(RegistryError::DuplicateOpcode(0x0087))
        );
    }

    #[test]
    fn test_declared_length_must_match_layout() {
        let mut builder = PacketDbBuilder::new(PacketVersion(7));
        builder.declare_len(0x0087, PacketLen::Fixed(10)).unwrap();
        builder.register_table(&WALK, Some(noop)).unwrap();
        let db = builder.build();
        let desc = db.lookup(0x0087).unwrap();
        assert!(desc.handler.is_some());
        assert_eq!(desc.field_offsets(), &[2]);

        let mut builder = PacketDbBuilder::new(PacketVersion(7));
        builder.declare_len(0x0087, PacketLen::Fixed(12)).unwrap();
        assert_eq!(
            builder.register_table(&WALK, Some(noop)).err(),
            Some(RegistryError::LengthMismatch {
                opcode: 0x0087,
                declared: 12,
                layout: 10
            })
        );
    }

    #[test]
    fn test_offset_limits() {
        let mut builder = PacketDbBuilder::new(PacketVersion(7));
        assert_eq!(
            builder.register(0x0001, PacketLen::Fixed(6), &[6], None).err(),
            Some(RegistryError::OffsetOutOfBounds {
                opcode: 0x0001,
                offset: 6
            })
        );
        let offsets = [2usize; MAX_FIELD_OFFSETS + 1];
        assert!(matches!(
            builder.register(0x0002, PacketLen::Fixed(6), &offsets, None),
            Err(RegistryError::TooManyFields { .. })
        ));
    }

    #[test]
    fn test_fixed_length_below_opcode_rejected() {
        let mut builder = PacketDbBuilder::new(PacketVersion(20120410));
        assert_eq!(
            builder.declare_len(0x0999, PacketLen::Fixed(0)).err(),
            Some(RegistryError::LengthMismatch {
                opcode: 0x0999,
                declared: 0,
                layout: 2
            })
        );
        assert_eq!(
            builder.register(0x099a, PacketLen::Fixed(1), &[], None).err(),
            Some(RegistryError::LengthMismatch {
                opcode: 0x099a,
                declared: 1,
                layout: 2
            })
        );
        assert!(builder.build().is_empty());
    }

    #[test]
    fn test_opcodes_sorted() {
        let mut builder = PacketDbBuilder::new(PacketVersion(7));
        builder.register(0x0200, PacketLen::Fixed(2), &[], None).unwrap();
        builder.register(0x0010, PacketLen::Variable { min: 4 }, &[], None).unwrap();
        let db = builder.build();
        assert_eq!(db.opcodes(), vec![0x0010, 0x0200]);
        assert_eq!(db.len(), 2);
    }
}
