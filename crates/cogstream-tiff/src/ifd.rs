//! Low-level TIFF header and image file directory decoding.
//!
//! Classic TIFF and BigTIFF differ only in field widths; both byte orders
//! are handled by [`ByteOrder`]. Values that fit in an entry are decoded in
//! place, larger ones are read from their offset through the stream cursor.

use bytes::Bytes;
use cogstream_stream::StreamCursor;
use tiff::tags::{Tag, Type};
use tracing::trace;

use crate::{ParseError, Result};

/// Upper bound on entries in one directory.
const MAX_IFD_ENTRIES: u64 = 4096;

/// Upper bound on the out-of-line bytes of a single tag value.
const MAX_VALUE_BYTES: u64 = 256 * 1024 * 1024;

/// Byte order declared by the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// `II`
    LittleEndian,
    /// `MM`
    BigEndian,
}

impl ByteOrder {
    pub(crate) fn u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        }
    }

    pub(crate) fn u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
        }
    }

    pub(crate) fn u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            ByteOrder::LittleEndian => u64::from_le_bytes(bytes),
            ByteOrder::BigEndian => u64::from_be_bytes(bytes),
        }
    }
}

/// Read `N` bytes at `at`, failing instead of panicking on short input.
fn array<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N]> {
    bytes
        .get(at..at + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| ParseError::malformed(format!("truncated field at byte {at}")))
}

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order of every multi-byte field.
    pub byte_order: ByteOrder,
    /// True for BigTIFF (magic 43, 64-bit offsets).
    pub bigtiff: bool,
    /// Offset of the first directory.
    pub first_ifd: u64,
}

impl TiffHeader {
    /// Bytes needed to decode any header.
    pub const MAX_LEN: usize = 16;

    /// Decode the header from the first bytes of the object.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let byte_order = match bytes.get(0..2) {
            Some(b"II") => ByteOrder::LittleEndian,
            Some(b"MM") => ByteOrder::BigEndian,
            _ => return Err(ParseError::NotTiff("missing II/MM byte order mark".into())),
        };
        let magic = byte_order.u16(array(bytes, 2).map_err(|_| not_tiff("header too short"))?);

        match magic {
            42 => {
                let first_ifd = byte_order.u32(array(bytes, 4).map_err(|_| not_tiff("header too short"))?);
                Ok(Self {
                    byte_order,
                    bigtiff: false,
                    first_ifd: first_ifd as u64,
                })
            }
            43 => {
                let fields = array::<12>(bytes, 4).map_err(|_| not_tiff("BigTIFF header too short"))?;
                let offset_size = byte_order.u16([fields[0], fields[1]]);
                let reserved = byte_order.u16([fields[2], fields[3]]);
                if offset_size != 8 || reserved != 0 {
                    return Err(ParseError::NotTiff(format!(
                        "BigTIFF offset size {offset_size} (reserved {reserved})"
                    )));
                }
                let first_ifd = byte_order.u64(array(&fields, 4)?);
                Ok(Self {
                    byte_order,
                    bigtiff: true,
                    first_ifd,
                })
            }
            other => Err(ParseError::NotTiff(format!("magic number {other}"))),
        }
    }

    /// Size of the header itself.
    pub fn size(&self) -> u64 {
        if self.bigtiff {
            16
        } else {
            8
        }
    }

    fn count_size(&self) -> usize {
        if self.bigtiff {
            8
        } else {
            2
        }
    }

    fn entry_size(&self) -> usize {
        if self.bigtiff {
            20
        } else {
            12
        }
    }

    fn offset_size(&self) -> usize {
        if self.bigtiff {
            8
        } else {
            4
        }
    }

    /// Bytes of value stored directly in an entry.
    fn inline_size(&self) -> usize {
        self.offset_size()
    }

    fn read_offset(&self, bytes: &[u8], at: usize) -> Result<u64> {
        if self.bigtiff {
            Ok(self.byte_order.u64(array(bytes, at)?))
        } else {
            Ok(self.byte_order.u32(array(bytes, at)?) as u64)
        }
    }
}

fn not_tiff(message: &str) -> ParseError {
    ParseError::NotTiff(message.into())
}

/// Size in bytes of one value of `field_type`.
pub(crate) fn type_size(field_type: Type) -> u64 {
    match field_type {
        Type::BYTE | Type::ASCII | Type::SBYTE | Type::UNDEFINED => 1,
        Type::SHORT | Type::SSHORT => 2,
        Type::LONG | Type::SLONG | Type::FLOAT | Type::IFD => 4,
        Type::RATIONAL
        | Type::SRATIONAL
        | Type::DOUBLE
        | Type::LONG8
        | Type::SLONG8
        | Type::IFD8 => 8,
        // Any field type added to the tags table later is treated as opaque bytes.
        #[allow(unreachable_patterns)]
        _ => 1,
    }
}

/// One directory entry with its value still undecoded.
#[derive(Debug, Clone)]
pub(crate) struct IfdEntry {
    pub(crate) tag: Tag,
    pub(crate) field_type: Type,
    pub(crate) count: u64,
    /// The raw value-or-offset field.
    field: [u8; 8],
}

/// One decoded directory.
#[derive(Debug, Clone)]
pub(crate) struct Ifd {
    pub(crate) offset: u64,
    pub(crate) entries: Vec<IfdEntry>,
    pub(crate) next: u64,
}

impl Ifd {
    pub(crate) fn entry(&self, tag: Tag) -> Option<&IfdEntry> {
        self.entries.iter().find(|entry| entry.tag == tag)
    }
}

/// Reads directories and tag values through a stream cursor.
#[derive(Debug)]
pub(crate) struct IfdReader<'a> {
    cursor: StreamCursor<'a>,
    header: TiffHeader,
}

impl<'a> IfdReader<'a> {
    pub(crate) fn new(cursor: StreamCursor<'a>, header: TiffHeader) -> Self {
        Self { cursor, header }
    }

    pub(crate) fn header(&self) -> &TiffHeader {
        &self.header
    }

    pub(crate) fn object_len(&self) -> u64 {
        self.cursor.stream().length()
    }

    /// Read the directory at `offset`: entry count, entries and next pointer.
    pub(crate) fn read_ifd(&mut self, offset: u64) -> Result<Ifd> {
        let header = self.header;
        if offset < header.size() || offset >= self.object_len() {
            return Err(ParseError::malformed(format!(
                "IFD offset {offset} outside the object ({} bytes)",
                self.object_len()
            )));
        }

        self.cursor.seek_to(offset)?;
        let count_bytes = self.cursor.read_bytes(header.count_size())?;
        let count = if header.bigtiff {
            header.byte_order.u64(array(&count_bytes, 0)?)
        } else {
            header.byte_order.u16(array(&count_bytes, 0)?) as u64
        };
        if count == 0 || count > MAX_IFD_ENTRIES {
            return Err(ParseError::malformed(format!(
                "IFD at {offset} declares {count} entries"
            )));
        }

        let body_len = count as usize * header.entry_size() + header.offset_size();
        let body = self.cursor.read_bytes(body_len)?;

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = i * header.entry_size();
            let tag = Tag::from_u16_exhaustive(header.byte_order.u16(array(&body, at)?));
            let raw_type = header.byte_order.u16(array(&body, at + 2)?);
            let Some(field_type) = Type::from_u16(raw_type) else {
                trace!(?tag, raw_type, "skipping entry with unknown field type");
                continue;
            };
            let (count, field_at) = if header.bigtiff {
                (header.byte_order.u64(array(&body, at + 4)?), at + 12)
            } else {
                (header.byte_order.u32(array(&body, at + 4)?) as u64, at + 8)
            };
            let mut field = [0u8; 8];
            field[..header.inline_size()]
                .copy_from_slice(&body[field_at..field_at + header.inline_size()]);
            entries.push(IfdEntry {
                tag,
                field_type,
                count,
                field,
            });
        }

        let next = header.read_offset(&body, count as usize * header.entry_size())?;
        Ok(Ifd {
            offset,
            entries,
            next,
        })
    }

    /// The raw bytes of an entry's value, in file byte order.
    pub(crate) fn value_bytes(&mut self, entry: &IfdEntry) -> Result<Bytes> {
        let len = entry
            .count
            .checked_mul(type_size(entry.field_type))
            .filter(|len| *len <= MAX_VALUE_BYTES)
            .ok_or_else(|| {
                ParseError::malformed(format!(
                    "tag {:?} holds {} values, too large",
                    entry.tag, entry.count
                ))
            })?;

        if len <= self.header.inline_size() as u64 {
            return Ok(Bytes::copy_from_slice(&entry.field[..len as usize]));
        }

        let offset = self.header.read_offset(&entry.field, 0)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.object_len() => {}
            _ => {
                return Err(ParseError::malformed(format!(
                    "tag {:?} value at {offset}+{len} runs past the object end",
                    entry.tag
                )))
            }
        }
        self.cursor.seek_to(offset)?;
        Ok(self.cursor.read_bytes(len as usize)?)
    }

    /// Decode an entry holding unsigned integers of any width.
    pub(crate) fn uints(&mut self, entry: &IfdEntry) -> Result<Vec<u64>> {
        let width = match entry.field_type {
            Type::BYTE | Type::UNDEFINED => 1,
            Type::SHORT => 2,
            Type::LONG | Type::IFD => 4,
            Type::LONG8 | Type::IFD8 => 8,
            other => {
                return Err(ParseError::malformed(format!(
                    "tag {:?} has non-integer type {other:?}",
                    entry.tag
                )))
            }
        };
        let bytes = self.value_bytes(entry)?;
        let order = self.header.byte_order;
        bytes
            .chunks_exact(width)
            .map(|chunk| {
                Ok(match width {
                    1 => chunk[0] as u64,
                    2 => order.u16(array(chunk, 0)?) as u64,
                    4 => order.u32(array(chunk, 0)?) as u64,
                    _ => order.u64(array(chunk, 0)?),
                })
            })
            .collect()
    }

    /// Decode the first unsigned integer of an entry.
    pub(crate) fn uint(&mut self, entry: &IfdEntry) -> Result<u64> {
        self.uints(entry)?.first().copied().ok_or_else(|| {
            ParseError::malformed(format!("tag {:?} has no values", entry.tag))
        })
    }
}
