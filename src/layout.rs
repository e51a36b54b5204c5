//! Versioned memory layouts for the kernel objects the capturers read
//!
//! The attachment layer hands the engine raw object memory. Every structure
//! the engine copies from is described by a [`StructLayout`]: its size and the
//! offset/width of each field it cares about. A [`LayoutSet`] groups the
//! layouts for one kernel build and is validated once, at attach time, so a
//! mismatched kernel is refused up front instead of producing garbage records.
//!
//! Reads go through [`ObjectView`]; each field read returns its own `Result`,
//! which keeps capture failures observable in tests while the hot path simply
//! skips fields that fail.

use thiserror::Error;

use crate::call_record::{DNAME_INLINE_LEN, NFS_MAXFHSIZE, STATEID_OTHER_SIZE};

/// Kernel structures read by the capturers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructKind {
    /// `nfs4_stateid`
    Stateid,
    /// `nfs_fh`
    FileHandle,
    /// `nfs4_state`
    State,
    /// `nfs4_opendata`
    Opendata,
    /// `dentry`
    Dentry,
    /// `nfs_client`
    Client,
}

impl StructKind {
    pub fn c_name(self) -> &'static str {
        match self {
            StructKind::Stateid => "nfs4_stateid",
            StructKind::FileHandle => "nfs_fh",
            StructKind::State => "nfs4_state",
            StructKind::Opendata => "nfs4_opendata",
            StructKind::Dentry => "dentry",
            StructKind::Client => "nfs_client",
        }
    }

    /// Fields a layout of this kind must describe
    pub fn required_fields(self) -> &'static [Field] {
        match self {
            StructKind::Stateid => &[Field::Seqid, Field::Other, Field::Type],
            StructKind::FileHandle => &[Field::FhSize, Field::FhData],
            StructKind::State => &[
                Field::Flags,
                Field::Stateid,
                Field::OpenStateid,
                Field::NRdonly,
                Field::NWronly,
                Field::NRdwr,
                Field::Mode,
            ],
            StructKind::Opendata => &[Field::ShareAccess, Field::Claim, Field::OResStateid],
            StructKind::Dentry => &[Field::DIname],
            StructKind::Client => &[Field::ClState],
        }
    }
}

/// Fields read out of kernel objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Seqid,
    Other,
    Type,
    FhSize,
    FhData,
    Flags,
    Stateid,
    OpenStateid,
    NRdonly,
    NWronly,
    NRdwr,
    Mode,
    ShareAccess,
    Claim,
    OResStateid,
    DIname,
    ClState,
}

impl Field {
    pub fn c_name(self) -> &'static str {
        match self {
            Field::Seqid => "seqid",
            Field::Other => "other",
            Field::Type => "type",
            Field::FhSize => "size",
            Field::FhData => "data",
            Field::Flags => "flags",
            Field::Stateid => "stateid",
            Field::OpenStateid => "open_stateid",
            Field::NRdonly => "n_rdonly",
            Field::NWronly => "n_wronly",
            Field::NRdwr => "n_rdwr",
            Field::Mode => "state",
            Field::ShareAccess => "o_arg.share_access",
            Field::Claim => "o_arg.claim",
            Field::OResStateid => "o_res.stateid",
            Field::DIname => "d_iname",
            Field::ClState => "cl_state",
        }
    }

    /// Width the capturers expect; `None` for nested stateids, sized by the stateid layout
    fn expected_width(self) -> Option<usize> {
        match self {
            Field::Seqid => Some(4),
            Field::Other => Some(STATEID_OTHER_SIZE),
            Field::Type => Some(4),
            Field::FhSize => Some(2),
            Field::FhData => Some(NFS_MAXFHSIZE),
            Field::Flags => Some(8),
            Field::NRdonly | Field::NWronly | Field::NRdwr | Field::Mode => Some(4),
            Field::ShareAccess | Field::Claim => Some(4),
            Field::DIname => Some(DNAME_INLINE_LEN),
            Field::ClState => Some(8),
            Field::Stateid | Field::OpenStateid | Field::OResStateid => None,
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.c_name())
    }
}

/// Position of one field inside its structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub field: Field,
    pub offset: usize,
    pub len: usize,
}

impl FieldLayout {
    pub const fn new(field: Field, offset: usize, len: usize) -> Self {
        FieldLayout { field, offset, len }
    }

    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Layout of one kernel structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub kind: StructKind,
    pub size: usize,
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    pub fn new(kind: StructKind, size: usize, fields: Vec<FieldLayout>) -> Self {
        StructLayout { kind, size, fields }
    }

    pub fn field(&self, field: Field) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.field == field)
    }

    fn validate(&self, stateid_size: usize) -> Result<(), LayoutError> {
        for &field in self.kind.required_fields() {
            let layout = self.field(field).ok_or(LayoutError::MissingField {
                structure: self.kind.c_name(),
                field,
            })?;

            if layout.end() > self.size {
                return Err(LayoutError::FieldOutOfBounds {
                    structure: self.kind.c_name(),
                    field,
                    end: layout.end(),
                    size: self.size,
                });
            }

            let expected = field.expected_width().unwrap_or(stateid_size);
            if layout.len != expected {
                return Err(LayoutError::WidthMismatch {
                    structure: self.kind.c_name(),
                    field,
                    expected,
                    found: layout.len,
                });
            }
        }
        Ok(())
    }
}

/// Errors found while validating a layout set at attach time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{structure}: required field '{field}' is not described")]
    MissingField {
        structure: &'static str,
        field: Field,
    },

    #[error("{structure}: field '{field}' ends at byte {end}, past structure size {size}")]
    FieldOutOfBounds {
        structure: &'static str,
        field: Field,
        end: usize,
        size: usize,
    },

    #[error("{structure}: field '{field}' is {found} bytes wide, expected {expected}")]
    WidthMismatch {
        structure: &'static str,
        field: Field,
        expected: usize,
        found: usize,
    },

    #[error("layout for {found} registered in the {expected} slot")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },
}

/// Layouts for one kernel build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSet {
    pub version: String,
    pub stateid: StructLayout,
    pub file_handle: StructLayout,
    pub state: StructLayout,
    pub opendata: StructLayout,
    pub dentry: StructLayout,
    pub client: StructLayout,
}

impl LayoutSet {
    /// Reference layout used by the replay format and the test suite
    ///
    /// Live attachment must supply the set matching the running kernel.
    pub fn reference() -> Self {
        use Field as F;
        use StructKind as K;

        LayoutSet {
            version: "reference-1".to_string(),
            stateid: StructLayout::new(
                K::Stateid,
                20,
                vec![
                    FieldLayout::new(F::Seqid, 0, 4),
                    FieldLayout::new(F::Other, 4, STATEID_OTHER_SIZE),
                    FieldLayout::new(F::Type, 16, 4),
                ],
            ),
            file_handle: StructLayout::new(
                K::FileHandle,
                130,
                vec![
                    FieldLayout::new(F::FhSize, 0, 2),
                    FieldLayout::new(F::FhData, 2, NFS_MAXFHSIZE),
                ],
            ),
            state: StructLayout::new(
                K::State,
                160,
                vec![
                    FieldLayout::new(F::Flags, 64, 8),
                    FieldLayout::new(F::Stateid, 88, 20),
                    FieldLayout::new(F::OpenStateid, 108, 20),
                    FieldLayout::new(F::NRdonly, 128, 4),
                    FieldLayout::new(F::NWronly, 132, 4),
                    FieldLayout::new(F::NRdwr, 136, 4),
                    FieldLayout::new(F::Mode, 140, 4),
                ],
            ),
            opendata: StructLayout::new(
                K::Opendata,
                256,
                vec![
                    FieldLayout::new(F::ShareAccess, 48, 4),
                    FieldLayout::new(F::Claim, 60, 4),
                    FieldLayout::new(F::OResStateid, 200, 20),
                ],
            ),
            dentry: StructLayout::new(
                K::Dentry,
                192,
                vec![FieldLayout::new(F::DIname, 56, DNAME_INLINE_LEN)],
            ),
            client: StructLayout::new(K::Client, 96, vec![FieldLayout::new(F::ClState, 40, 8)]),
        }
    }

    /// Check every layout before any probe is attached
    pub fn validate(&self) -> Result<(), LayoutError> {
        let slots = [
            (StructKind::Stateid, &self.stateid),
            (StructKind::FileHandle, &self.file_handle),
            (StructKind::State, &self.state),
            (StructKind::Opendata, &self.opendata),
            (StructKind::Dentry, &self.dentry),
            (StructKind::Client, &self.client),
        ];

        for (kind, layout) in slots {
            if layout.kind != kind {
                return Err(LayoutError::WrongKind {
                    expected: kind.c_name(),
                    found: layout.kind.c_name(),
                });
            }
            layout.validate(self.stateid.size)?;
        }
        Ok(())
    }

    pub fn get(&self, kind: StructKind) -> &StructLayout {
        match kind {
            StructKind::Stateid => &self.stateid,
            StructKind::FileHandle => &self.file_handle,
            StructKind::State => &self.state,
            StructKind::Opendata => &self.opendata,
            StructKind::Dentry => &self.dentry,
            StructKind::Client => &self.client,
        }
    }
}

/// Failure to read one field from a live object
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("no object supplied for this read")]
    NoObject,

    #[error("field '{0}' is not part of this layout")]
    MissingField(Field),

    #[error("field '{field}' needs bytes up to {end}, only {available} available")]
    OutOfBounds {
        field: Field,
        end: usize,
        available: usize,
    },

    #[error("field '{field}' is {len} bytes wide, cannot read as {wanted}")]
    Width {
        field: Field,
        len: usize,
        wanted: usize,
    },
}

/// Borrowed view of a live object, valid for the duration of one notification
#[derive(Debug, Clone, Copy)]
pub struct ObjectView<'a> {
    bytes: &'a [u8],
    layout: &'a StructLayout,
}

impl<'a> ObjectView<'a> {
    pub fn new(bytes: &'a [u8], layout: &'a StructLayout) -> Self {
        ObjectView { bytes, layout }
    }

    pub fn kind(&self) -> StructKind {
        self.layout.kind
    }

    fn slice(&self, field: Field) -> Result<&'a [u8], ReadError> {
        let layout = self
            .layout
            .field(field)
            .ok_or(ReadError::MissingField(field))?;
        self.bytes
            .get(layout.offset..layout.end())
            .ok_or(ReadError::OutOfBounds {
                field,
                end: layout.end(),
                available: self.bytes.len(),
            })
    }

    /// Copy a field that is exactly `N` bytes wide
    pub fn read_array<const N: usize>(&self, field: Field) -> Result<[u8; N], ReadError> {
        let bytes = self.slice(field)?;
        bytes.try_into().map_err(|_| ReadError::Width {
            field,
            len: bytes.len(),
            wanted: N,
        })
    }

    /// Read a native-endian unsigned integer of up to 8 bytes
    pub fn read_uint(&self, field: Field) -> Result<u64, ReadError> {
        let bytes = self.slice(field)?;
        if bytes.len() > 8 {
            return Err(ReadError::Width {
                field,
                len: bytes.len(),
                wanted: 8,
            });
        }
        let mut buf = [0u8; 8];
        if cfg!(target_endian = "little") {
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(u64::from_le_bytes(buf))
        } else {
            buf[8 - bytes.len()..].copy_from_slice(bytes);
            Ok(u64::from_be_bytes(buf))
        }
    }

    /// Embedded structure at `field`, read with `layout`
    pub fn nested(&self, field: Field, layout: &'a StructLayout) -> Result<ObjectView<'a>, ReadError> {
        Ok(ObjectView::new(self.slice(field)?, layout))
    }
}

/// Owned object memory built field by field; the replay driver and tests use it
/// to stand in for live kernel objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectImage {
    kind: StructKind,
    bytes: Vec<u8>,
}

impl ObjectImage {
    /// Zeroed image the size of `layout`
    pub fn zeroed(layout: &StructLayout) -> Self {
        ObjectImage {
            kind: layout.kind,
            bytes: vec![0; layout.size],
        }
    }

    pub fn from_bytes(kind: StructKind, bytes: Vec<u8>) -> Self {
        ObjectImage { kind, bytes }
    }

    /// Write raw bytes into `field`; panics if the layout does not describe it
    pub fn put(mut self, layout: &StructLayout, field: Field, value: &[u8]) -> Self {
        let place = layout
            .field(field)
            .unwrap_or_else(|| panic!("{} has no field {}", layout.kind.c_name(), field));
        let len = value.len().min(place.len);
        self.bytes[place.offset..place.offset + len].copy_from_slice(&value[..len]);
        self
    }

    /// Write a native-endian integer, truncated to the field width
    pub fn put_uint(self, layout: &StructLayout, field: Field, value: u64) -> Self {
        let width = layout.field(field).map_or(8, |f| f.len.min(8));
        let bytes = value.to_ne_bytes();
        if cfg!(target_endian = "little") {
            self.put(layout, field, &bytes[..width])
        } else {
            self.put(layout, field, &bytes[8 - width..])
        }
    }

    pub fn kind(&self) -> StructKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn view<'a>(&'a self, layouts: &'a LayoutSet) -> ObjectView<'a> {
        ObjectView::new(&self.bytes, layouts.get(self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_layout_validates() {
        assert_eq!(LayoutSet::reference().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_field_past_end() {
        let mut layouts = LayoutSet::reference();
        layouts.client.fields[0].offset = 90;
        assert!(matches!(
            layouts.validate(),
            Err(LayoutError::FieldOutOfBounds {
                field: Field::ClState,
                end: 98,
                size: 96,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_width_mismatch() {
        let mut layouts = LayoutSet::reference();
        layouts.stateid.fields[0].len = 8;
        assert!(matches!(
            layouts.validate(),
            Err(LayoutError::WidthMismatch {
                field: Field::Seqid,
                expected: 4,
                found: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_field() {
        let mut layouts = LayoutSet::reference();
        layouts.state.fields.retain(|f| f.field != Field::NRdwr);
        assert_eq!(
            layouts.validate(),
            Err(LayoutError::MissingField {
                structure: "nfs4_state",
                field: Field::NRdwr
            })
        );
    }

    #[test]
    fn test_validate_rejects_swapped_slot() {
        let mut layouts = LayoutSet::reference();
        layouts.client = layouts.dentry.clone();
        assert!(matches!(layouts.validate(), Err(LayoutError::WrongKind { .. })));
    }

    #[test]
    fn test_view_reads_each_field_independently() {
        let layouts = LayoutSet::reference();
        let image = ObjectImage::zeroed(&layouts.state)
            .put_uint(&layouts.state, Field::Flags, 0x84)
            .put_uint(&layouts.state, Field::NRdwr, 3);

        // Truncate so the counters are readable but the mode word is not
        let bytes = &image.as_bytes()[..140];
        let view = ObjectView::new(bytes, &layouts.state);

        assert_eq!(view.read_uint(Field::Flags), Ok(0x84));
        assert_eq!(view.read_uint(Field::NRdwr), Ok(3));
        assert_eq!(
            view.read_uint(Field::Mode),
            Err(ReadError::OutOfBounds {
                field: Field::Mode,
                end: 144,
                available: 140
            })
        );
        assert_eq!(
            view.read_uint(Field::ClState),
            Err(ReadError::MissingField(Field::ClState))
        );
    }

    #[test]
    fn test_nested_stateid_view() {
        let layouts = LayoutSet::reference();
        let image = ObjectImage::zeroed(&layouts.opendata).put(
            &layouts.opendata,
            Field::OResStateid,
            &[0, 0, 0, 7, 0xaa],
        );
        let view = image.view(&layouts);
        let stateid = view.nested(Field::OResStateid, &layouts.stateid).unwrap();
        assert_eq!(stateid.read_array::<4>(Field::Seqid), Ok([0, 0, 0, 7]));
        assert_eq!(stateid.read_array::<12>(Field::Other).unwrap()[0], 0xaa);
    }

    #[test]
    fn test_read_array_width_mismatch() {
        let layouts = LayoutSet::reference();
        let image = ObjectImage::zeroed(&layouts.stateid);
        let view = image.view(&layouts);
        assert_eq!(
            view.read_array::<8>(Field::Seqid),
            Err(ReadError::Width {
                field: Field::Seqid,
                len: 4,
                wanted: 8
            })
        );
    }
}
