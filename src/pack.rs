// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! A compact, schema-less, forward-compatible binary codec.
//!
//! A pack is an ordered stream of tagged fields inside nestable containers
//! (array, object). Each field has a type, a strictly increasing positive id
//! within its container, and a value. NULL fields are not stored: the gap
//! between stored ids implies them, so sparse records stay small and readers
//! older than the writer skip unknown higher ids without failure.
//!
//! Each field begins with a one-byte tag. The high nibble holds the type;
//! the low nibble packs a value bit (or a "value follows" bit) together with
//! the low bits of the id delta from the previous field. Multi-byte values
//! and high-order id-delta bits follow as base-128 varints. Signed integers
//! are zig-zag encoded. A zero byte ends the current container.
//!
//! `bin` and `str` store a value bit meaning "non-empty"; when set, the tag
//! (and any id-delta varint) is followed by a varint length and the raw
//! bytes. This avoids spending a length byte on empty values.

use crate::{Error, Result};

/// Sentinel id meaning the current container's end marker has been reached.
const ID_END: u32 = u32::MAX;

/// A varint longer than this cannot encode a u64.
const VARINT_SIZE_MAX: usize = 10;

/// Field type, stored in the tag's high nibble. The discriminants are the
/// wire values and must never change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PackType {
    #[default]
    Unknown = 0,
    Array = 1,
    Bin = 2,
    Bool = 3,
    I32 = 4,
    I64 = 5,
    Obj = 6,
    Ptr = 7,
    Str = 8,
    Time = 9,
    U32 = 10,
    U64 = 11,
}

impl PackType {
    fn from_nibble(nibble: u8) -> Result<PackType> {
        Ok(match nibble {
            0 => PackType::Unknown,
            1 => PackType::Array,
            2 => PackType::Bin,
            3 => PackType::Bool,
            4 => PackType::I32,
            5 => PackType::I64,
            6 => PackType::Obj,
            7 => PackType::Ptr,
            8 => PackType::Str,
            9 => PackType::Time,
            10 => PackType::U32,
            11 => PackType::U64,
            _ => return Err(Error::Format(format!("invalid pack type {nibble}"))),
        })
    }

    /// Value may need more than one bit (integers): the tag can hold a 0/1
    /// value inline, anything larger follows as a varint.
    fn value_multi_bit(self) -> bool {
        matches!(
            self,
            PackType::I32
                | PackType::I64
                | PackType::Ptr
                | PackType::Time
                | PackType::U32
                | PackType::U64
        )
    }

    /// Value is exactly one bit (bool, and the non-empty bit of bin/str).
    fn value_single_bit(self) -> bool {
        matches!(self, PackType::Bin | PackType::Bool | PackType::Str)
    }

    /// Value bytes follow with an explicit length.
    fn sized(self) -> bool {
        matches!(self, PackType::Bin | PackType::Str)
    }

    pub fn name(self) -> &'static str {
        match self {
            PackType::Unknown => "unknown",
            PackType::Array => "array",
            PackType::Bin => "bin",
            PackType::Bool => "bool",
            PackType::I32 => "i32",
            PackType::I64 => "i64",
            PackType::Obj => "obj",
            PackType::Ptr => "ptr",
            PackType::Str => "str",
            PackType::Time => "time",
            PackType::U32 => "u32",
            PackType::U64 => "u64",
        }
    }
}

fn zigzag_i64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag_i64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Per-container id tracking.
#[derive(Debug, Default)]
struct Frame {
    container: PackType,
    id_last: u32,
    null_total: u32,
}

impl Frame {
    fn new(container: PackType) -> Frame {
        Frame {
            container,
            id_last: 0,
            null_total: 0,
        }
    }
}

/// Encodes fields into an in-memory pack.
///
/// The root is an implicit object; [PackWrite::finish] writes its end marker
/// and returns the encoded bytes.
#[derive(Debug)]
pub struct PackWrite {
    buf: Vec<u8>,
    stack: Vec<Frame>,
}

impl Default for PackWrite {
    fn default() -> Self {
        PackWrite::new()
    }
}

impl PackWrite {
    pub fn new() -> PackWrite {
        PackWrite {
            buf: Vec::new(),
            stack: vec![Frame::new(PackType::Obj)],
        }
    }

    fn top(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("pack write stack not empty")
    }

    fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push(value as u8 | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    /// Write a field tag, resolving an implicit id from the frame state.
    fn write_tag(&mut self, field_type: PackType, id: Option<u32>, value: u64) {
        let frame = self.top();
        let id = match id {
            None => frame.id_last + frame.null_total + 1,
            Some(id) => {
                assert!(id > frame.id_last, "field id {id} not ascending");
                id
            }
        };
        frame.null_total = 0;

        let mut delta = id - frame.id_last - 1;
        let mut tag = (field_type as u64) << 4;
        let mut follow_value = 0;

        if field_type.value_multi_bit() {
            if value < 2 {
                // Value fits in the tag.
                tag |= (value & 0x1) << 2;
                tag |= (delta & 0x1) as u64;
                delta >>= 1;
                if delta > 0 {
                    tag |= 0x2;
                }
            } else {
                // Value follows as a varint.
                tag |= 0x8;
                tag |= (delta & 0x3) as u64;
                delta >>= 2;
                if delta > 0 {
                    tag |= 0x4;
                }
                follow_value = value;
            }
        } else if field_type.value_single_bit() {
            tag |= (value & 0x1) << 3;
            tag |= (delta & 0x3) as u64;
            delta >>= 2;
            if delta > 0 {
                tag |= 0x4;
            }
        } else {
            // Containers carry no value.
            debug_assert_eq!(value, 0);
            tag |= (delta & 0x7) as u64;
            delta >>= 3;
            if delta > 0 {
                tag |= 0x8;
            }
        }

        self.buf.push(tag as u8);
        if delta > 0 {
            self.write_varint(delta as u64);
        }
        if follow_value > 0 {
            self.write_varint(follow_value);
        }
        self.top().id_last = id;
    }

    /// Record a NULL: nothing is emitted, the next implicit id skips it.
    pub fn write_null(&mut self) -> &mut Self {
        self.top().null_total += 1;
        self
    }

    pub fn write_bool(&mut self, id: Option<u32>, value: bool) -> &mut Self {
        self.write_tag(PackType::Bool, id, value as u64);
        self
    }

    pub fn write_u32(&mut self, id: Option<u32>, value: u32) -> &mut Self {
        self.write_tag(PackType::U32, id, value as u64);
        self
    }

    pub fn write_u64(&mut self, id: Option<u32>, value: u64) -> &mut Self {
        self.write_tag(PackType::U64, id, value);
        self
    }

    pub fn write_i32(&mut self, id: Option<u32>, value: i32) -> &mut Self {
        self.write_tag(PackType::I32, id, zigzag_i64(value as i64) & 0xffff_ffff);
        self
    }

    pub fn write_i64(&mut self, id: Option<u32>, value: i64) -> &mut Self {
        self.write_tag(PackType::I64, id, zigzag_i64(value));
        self
    }

    /// Seconds since the epoch, zig-zag encoded like a signed integer.
    pub fn write_time(&mut self, id: Option<u32>, value: i64) -> &mut Self {
        self.write_tag(PackType::Time, id, zigzag_i64(value));
        self
    }

    /// A raw machine pointer; only meaningful within a single process and
    /// never allowed across the protocol.
    pub fn write_ptr(&mut self, id: Option<u32>, value: usize) -> &mut Self {
        self.write_tag(PackType::Ptr, id, value as u64);
        self
    }

    pub fn write_str(&mut self, id: Option<u32>, value: &str) -> &mut Self {
        self.write_bin_type(PackType::Str, id, value.as_bytes())
    }

    pub fn write_bin(&mut self, id: Option<u32>, value: &[u8]) -> &mut Self {
        self.write_bin_type(PackType::Bin, id, value)
    }

    fn write_bin_type(&mut self, field_type: PackType, id: Option<u32>, value: &[u8]) -> &mut Self {
        self.write_tag(field_type, id, (!value.is_empty()) as u64);
        if !value.is_empty() {
            self.write_varint(value.len() as u64);
            self.buf.extend_from_slice(value);
        }
        self
    }

    pub fn array_begin(&mut self, id: Option<u32>) -> &mut Self {
        self.write_tag(PackType::Array, id, 0);
        self.stack.push(Frame::new(PackType::Array));
        self
    }

    pub fn array_end(&mut self) -> &mut Self {
        self.container_end(PackType::Array)
    }

    pub fn obj_begin(&mut self, id: Option<u32>) -> &mut Self {
        self.write_tag(PackType::Obj, id, 0);
        self.stack.push(Frame::new(PackType::Obj));
        self
    }

    pub fn obj_end(&mut self) -> &mut Self {
        self.container_end(PackType::Obj)
    }

    fn container_end(&mut self, container: PackType) -> &mut Self {
        assert!(self.stack.len() > 1, "cannot end the root container");
        assert_eq!(
            self.top().container,
            container,
            "container end does not match begin"
        );
        self.buf.push(0);
        self.stack.pop();
        self
    }

    /// Terminate the root container and return the encoded pack.
    pub fn finish(mut self) -> Vec<u8> {
        assert_eq!(self.stack.len(), 1, "unterminated container at finish");
        self.buf.push(0);
        self.buf
    }
}

/// Decodes fields from an in-memory pack.
///
/// Reads are random access within the current container by ascending id:
/// requesting an id larger than the next stored field consumes and discards
/// the intervening fields; requesting an id smaller than the next stored
/// field yields `None` (a NULL gap) without failing.
#[derive(Debug)]
pub struct PackRead<'a> {
    buf: &'a [u8],
    pos: usize,

    /// Id of the buffered, not-yet-consumed tag; 0 when no tag is buffered
    /// and [ID_END] at a container end marker.
    next_id: u32,
    next_type: PackType,
    next_value: u64,

    stack: Vec<Frame>,
}

impl<'a> PackRead<'a> {
    pub fn new(buf: &'a [u8]) -> PackRead<'a> {
        PackRead {
            buf,
            pos: 0,
            next_id: 0,
            next_type: PackType::Unknown,
            next_value: 0,
            stack: vec![Frame::new(PackType::Obj)],
        }
    }

    fn top(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("pack read stack not empty")
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Format("unexpected EOF in pack".into()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        for index in 0..VARINT_SIZE_MAX {
            let byte = self.read_byte()?;
            result |= ((byte & 0x7f) as u64) << (7 * index);
            if byte < 0x80 {
                return Ok(result);
            }
        }
        Err(Error::Format("unterminated base-128 integer".into()))
    }

    /// Decode the next tag into the buffered next_* fields. Returns false at
    /// a container end marker.
    fn tag_next(&mut self) -> Result<bool> {
        let tag = self.read_byte()?;
        if tag == 0 {
            self.next_id = ID_END;
            return Ok(false);
        }

        self.next_type = PackType::from_nibble(tag >> 4)?;

        if self.next_type.value_multi_bit() {
            if tag & 0x8 != 0 {
                self.next_id = (tag & 0x3) as u32;
                if tag & 0x4 != 0 {
                    self.next_id |= (self.read_varint()? as u32) << 2;
                }
                self.next_value = self.read_varint()?;
            } else {
                self.next_id = (tag & 0x1) as u32;
                if tag & 0x2 != 0 {
                    self.next_id |= (self.read_varint()? as u32) << 1;
                }
                self.next_value = ((tag >> 2) & 0x3) as u64;
            }
        } else if self.next_type.value_single_bit() {
            self.next_id = (tag & 0x3) as u32;
            if tag & 0x4 != 0 {
                self.next_id |= (self.read_varint()? as u32) << 2;
            }
            self.next_value = ((tag >> 3) & 0x1) as u64;
        } else {
            self.next_id = (tag & 0x7) as u32;
            if tag & 0x8 != 0 {
                self.next_id |= (self.read_varint()? as u32) << 3;
            }
            self.next_value = 0;
        }

        self.next_id += self.top().id_last + 1;
        Ok(true)
    }

    /// Advance to the requested id, skipping (and discarding) any stored
    /// fields with smaller ids. Returns the tag value when the id is stored,
    /// or None when the id falls in a gap or past the container end.
    fn read_tag(&mut self, id: Option<u32>, expect: PackType, peek: bool) -> Result<Option<u64>> {
        let id = match id {
            None => self.top().id_last + 1,
            Some(id) => {
                if id <= self.top().id_last {
                    return Err(Error::Format(format!("field {id} was already read")));
                }
                id
            }
        };

        loop {
            if self.next_id == 0 {
                self.tag_next()?;
            }

            if id < self.next_id {
                // The requested id is not stored.
                if !peek {
                    self.top().id_last = id;
                }
                return Ok(None);
            } else if id == self.next_id {
                if !peek {
                    if self.next_type != expect {
                        return Err(Error::Format(format!(
                            "field {} is type '{}' but expected '{}'",
                            self.next_id,
                            self.next_type.name(),
                            expect.name()
                        )));
                    }
                    self.top().id_last = self.next_id;
                    self.next_id = 0;
                }
                return Ok(Some(self.next_value));
            }

            // Skip the value bytes of the field being passed over.
            if self.next_type.sized() && self.next_value != 0 {
                let size = self.read_varint()? as usize;
                if self.pos + size > self.buf.len() {
                    return Err(Error::Format("unexpected EOF in pack".into()));
                }
                self.pos += size;
            }
            let skipped = self.next_id;
            self.top().id_last = skipped;
            self.next_id = 0;
        }
    }

    /// True when a field with the given id (or the next id) is stored and
    /// non-NULL. Does not consume the field.
    pub fn has(&mut self, id: u32) -> Result<bool> {
        Ok(self.read_tag(Some(id), PackType::Unknown, true)?.is_some())
    }

    /// The type of the next stored field, for callers walking unknown packs.
    pub fn next_type(&mut self) -> Result<Option<PackType>> {
        if self.next_id == 0 && !self.tag_next()? {
            return Ok(None);
        }
        if self.next_id == ID_END {
            return Ok(None);
        }
        Ok(Some(self.next_type))
    }

    pub fn read_bool(&mut self, id: Option<u32>) -> Result<Option<bool>> {
        Ok(self
            .read_tag(id, PackType::Bool, false)?
            .map(|value| value != 0))
    }

    pub fn read_u32(&mut self, id: Option<u32>) -> Result<Option<u32>> {
        Ok(self
            .read_tag(id, PackType::U32, false)?
            .map(|value| value as u32))
    }

    pub fn read_u64(&mut self, id: Option<u32>) -> Result<Option<u64>> {
        self.read_tag(id, PackType::U64, false)
    }

    pub fn read_i32(&mut self, id: Option<u32>) -> Result<Option<i32>> {
        Ok(self
            .read_tag(id, PackType::I32, false)?
            .map(|value| unzigzag_i64(value) as i32))
    }

    pub fn read_i64(&mut self, id: Option<u32>) -> Result<Option<i64>> {
        Ok(self.read_tag(id, PackType::I64, false)?.map(unzigzag_i64))
    }

    pub fn read_time(&mut self, id: Option<u32>) -> Result<Option<i64>> {
        Ok(self.read_tag(id, PackType::Time, false)?.map(unzigzag_i64))
    }

    pub fn read_ptr(&mut self, id: Option<u32>) -> Result<Option<usize>> {
        Ok(self
            .read_tag(id, PackType::Ptr, false)?
            .map(|value| value as usize))
    }

    pub fn read_str(&mut self, id: Option<u32>) -> Result<Option<String>> {
        match self.read_bin_type(PackType::Str, id)? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Error::Format("pack string is not UTF-8".into())),
        }
    }

    pub fn read_bin(&mut self, id: Option<u32>) -> Result<Option<Vec<u8>>> {
        self.read_bin_type(PackType::Bin, id)
    }

    fn read_bin_type(&mut self, field_type: PackType, id: Option<u32>) -> Result<Option<Vec<u8>>> {
        match self.read_tag(id, field_type, false)? {
            None => Ok(None),
            Some(0) => Ok(Some(Vec::new())),
            Some(_) => {
                let size = self.read_varint()? as usize;
                if self.pos + size > self.buf.len() {
                    return Err(Error::Format("unexpected EOF in pack".into()));
                }
                let bytes = self.buf[self.pos..self.pos + size].to_vec();
                self.pos += size;
                Ok(Some(bytes))
            }
        }
    }

    pub fn array_begin(&mut self, id: Option<u32>) -> Result<()> {
        self.container_begin(PackType::Array, id)
    }

    pub fn obj_begin(&mut self, id: Option<u32>) -> Result<()> {
        self.container_begin(PackType::Obj, id)
    }

    fn container_begin(&mut self, container: PackType, id: Option<u32>) -> Result<()> {
        if self.read_tag(id, container, false)?.is_none() {
            return Err(Error::Format(format!("expected {} field", container.name())));
        }
        self.stack.push(Frame::new(container));
        Ok(())
    }

    pub fn array_end(&mut self) -> Result<()> {
        self.container_end(PackType::Array)
    }

    pub fn obj_end(&mut self) -> Result<()> {
        self.container_end(PackType::Obj)
    }

    fn container_end(&mut self, container: PackType) -> Result<()> {
        if self.stack.len() == 1 || self.top().container != container {
            return Err(Error::Format(format!("not in {}", container.name())));
        }

        // Consume any remaining fields up to the container's end marker.
        self.read_tag(Some(ID_END - 1), PackType::Unknown, true)?;

        self.stack.pop();
        self.next_id = 0;
        Ok(())
    }

    /// Consume everything up to and including the root end marker.
    pub fn finish(mut self) -> Result<()> {
        while !self.stack.is_empty() {
            self.read_tag(Some(ID_END - 1), PackType::Unknown, true)?;
            self.stack.pop();
            self.next_id = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn u64_with_gap() {
        let mut write = PackWrite::new();
        write.write_u64(Some(1), 1).write_u64(Some(11), 1);
        let buf = write.finish();
        // The second tag carries "value 1 in tag", a gap of 10 stored as the
        // internal delta 9, split between the tag's low bit and a varint.
        assert_eq!(buf, [0xb4, 0xb7, 0x04, 0x00]);

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_u64(Some(1)).unwrap(), Some(1));
        // Ids inside the gap decode as NULL without failure.
        assert_eq!(read.read_u64(Some(11)).unwrap(), Some(1));
        read.finish().unwrap();
    }

    #[test]
    fn gap_ids_read_as_null() {
        let mut write = PackWrite::new();
        write.write_u64(Some(1), 1).write_u64(Some(11), 1);
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_u64(Some(5)).unwrap(), None);
        assert_eq!(read.read_u64(Some(11)).unwrap(), Some(1));
        // Past the terminator everything reads as absent.
        assert_eq!(read.read_u64(Some(100)).unwrap(), None);
    }

    #[test]
    fn string_with_large_id_gap() {
        // A delta of 36 splits as two zero low bits in the tag and a varint
        // of 9; the length and bytes follow the tag.
        let mut write = PackWrite::new();
        write.write_str(Some(37), "sample");
        let buf = write.finish();
        assert_eq!(
            buf,
            [0x8c, 0x09, 0x06, b's', b'a', b'm', b'p', b'l', b'e', 0x00]
        );

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_str(Some(37)).unwrap().as_deref(), Some("sample"));
    }

    #[test]
    fn signed_value_follows_tag() {
        let mut write = PackWrite::new();
        write.write_u64(None, 2).write_i64(Some(12), -16);
        let buf = write.finish();
        // -16 zig-zags to 0x1f; the id delta of 10 sets both follow bits.
        assert_eq!(&buf[buf.len() - 4..], [0x5e, 0x02, 0x1f, 0x00]);

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_u64(Some(1)).unwrap(), Some(2));
        assert_eq!(read.read_i64(Some(12)).unwrap(), Some(-16));
    }

    #[test]
    fn bool_value_in_tag() {
        let mut write = PackWrite::new();
        write.write_bool(None, false).write_bool(None, true);
        let buf = write.finish();
        assert_eq!(buf, [0x30, 0x38, 0x00]);
    }

    #[test]
    fn array_with_gap_before() {
        let mut write = PackWrite::new();
        write.array_begin(Some(9));
        write.write_u32(None, 7);
        write.array_end();
        let buf = write.finish();
        assert_eq!(buf[0], 0x18);
        assert_eq!(buf[1], 0x01);

        let mut read = PackRead::new(&buf);
        read.array_begin(Some(9)).unwrap();
        assert_eq!(read.read_u32(None).unwrap(), Some(7));
        read.array_end().unwrap();
    }

    #[test]
    fn implicit_ids_and_nulls() {
        let mut write = PackWrite::new();
        write
            .write_str(None, "a")
            .write_null()
            .write_null()
            .write_str(None, "b");
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_str(Some(1)).unwrap().as_deref(), Some("a"));
        assert_eq!(read.read_str(Some(2)).unwrap(), None);
        assert_eq!(read.read_str(Some(3)).unwrap(), None);
        assert_eq!(read.read_str(Some(4)).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn skip_consumes_sized_values() {
        let mut write = PackWrite::new();
        write
            .write_str(Some(1), "skipped")
            .write_bin(Some(2), &[1, 2, 3])
            .write_u64(Some(3), 99);
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_u64(Some(3)).unwrap(), Some(99));
    }

    #[test]
    fn wrong_type_is_a_format_error() {
        let mut write = PackWrite::new();
        write.write_u64(Some(1), 5);
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        let err = read.read_str(Some(1)).unwrap_err();
        assert_eq!(err.code(), 55);
        assert!(err.to_string().contains("expected 'str'"));
    }

    #[test]
    fn rereading_an_id_fails() {
        let mut write = PackWrite::new();
        write.write_u64(Some(1), 5).write_u64(Some(2), 6);
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_u64(Some(2)).unwrap(), Some(6));
        assert!(read.read_u64(Some(1)).is_err());
    }

    #[test]
    fn nested_containers_track_ids_separately() {
        let mut write = PackWrite::new();
        write.write_u64(Some(2), 10);
        write.obj_begin(Some(5));
        write.write_str(Some(1), "inner").write_u64(Some(2), 20);
        write.obj_end();
        write.write_u64(Some(6), 30);
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_u64(Some(2)).unwrap(), Some(10));
        read.obj_begin(Some(5)).unwrap();
        assert_eq!(read.read_str(Some(1)).unwrap().as_deref(), Some("inner"));
        assert_eq!(read.read_u64(Some(2)).unwrap(), Some(20));
        read.obj_end().unwrap();
        assert_eq!(read.read_u64(Some(6)).unwrap(), Some(30));
        read.finish().unwrap();
    }

    #[test]
    fn container_end_skips_unread_fields() {
        let mut write = PackWrite::new();
        write.array_begin(Some(1));
        write
            .write_str(None, "one")
            .write_str(None, "two")
            .write_str(None, "three");
        write.array_end();
        write.write_u64(Some(2), 7);
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        read.array_begin(Some(1)).unwrap();
        assert_eq!(read.read_str(None).unwrap().as_deref(), Some("one"));
        read.array_end().unwrap();
        assert_eq!(read.read_u64(Some(2)).unwrap(), Some(7));
    }

    #[test]
    fn empty_string_and_bin_have_no_length() {
        let mut write = PackWrite::new();
        write.write_str(Some(1), "").write_bin(Some(2), b"");
        let buf = write.finish();
        assert_eq!(buf.len(), 3);

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_str(Some(1)).unwrap().as_deref(), Some(""));
        assert_eq!(read.read_bin(Some(2)).unwrap().as_deref(), Some(&[][..]));
    }

    #[test]
    fn truncated_pack_is_a_format_error() {
        let mut write = PackWrite::new();
        write.write_str(Some(1), "sample");
        let buf = write.finish();

        let mut read = PackRead::new(&buf[..3]);
        assert!(read.read_str(Some(1)).is_err());
    }

    #[test]
    fn large_values_round_trip() {
        let mut write = PackWrite::new();
        write
            .write_u64(Some(1), u64::MAX)
            .write_i64(Some(2), i64::MIN)
            .write_i32(Some(3), -1)
            .write_u32(Some(4), u32::MAX)
            .write_time(Some(5), 1710404475);
        let buf = write.finish();

        let mut read = PackRead::new(&buf);
        assert_eq!(read.read_u64(Some(1)).unwrap(), Some(u64::MAX));
        assert_eq!(read.read_i64(Some(2)).unwrap(), Some(i64::MIN));
        assert_eq!(read.read_i32(Some(3)).unwrap(), Some(-1));
        assert_eq!(read.read_u32(Some(4)).unwrap(), Some(u32::MAX));
        assert_eq!(read.read_time(Some(5)).unwrap(), Some(1710404475));
    }
}
