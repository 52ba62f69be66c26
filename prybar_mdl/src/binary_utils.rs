use std::io::{self, Read};
use std::mem::align_of;

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, LayoutVerified};

pub fn null_terminated_prefix(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.is_empty() {
        return None;
    }
    bytes.splitn(2, |&b| b == 0).next()
}

/// Reads everything into a buffer whose start is aligned to `A`, so that
/// zerocopy reinterpretation of the header structs cannot fail on alignment.
pub fn read_to_aligned<A: maligned::Alignment>(mut read: impl Read) -> io::Result<Vec<u8>> {
    let mut bytes = maligned::align_first::<u8, A>(4096);
    read.read_to_end(&mut bytes)?;

    realign::<A>(bytes)
}

/// Copies `bytes` into a buffer aligned to `A` if it is not already.
pub fn realign<A: maligned::Alignment>(mut bytes: Vec<u8>) -> io::Result<Vec<u8>> {
    if bytes.as_ptr() as usize % align_of::<A>() != 0 {
        // vector (re)allocated unaligned
        let mut new_bytes = maligned::align_first::<u8, A>(bytes.len());
        new_bytes.append(&mut bytes);
        bytes = new_bytes;
    }

    assert!(bytes.as_ptr() as usize % align_of::<A>() == 0);

    Ok(bytes)
}

pub fn parse<T: FromBytes>(bytes: &[u8], offset: usize) -> Option<&T> {
    bytes
        .get(offset..)
        .and_then(LayoutVerified::<_, T>::new_from_prefix)
        .map(|(res, _)| res.into_ref())
}

pub fn parse_slice<T: FromBytes>(bytes: &[u8], offset: usize, count: usize) -> Option<&[T]> {
    if count == 0 {
        return Some(&[]);
    }

    bytes
        .get(offset..)
        .and_then(|bytes| LayoutVerified::new_slice_from_prefix(bytes, count))
        .map(|(res, _)| res.into_slice())
}

// Animation data is chained together with byte-granular offsets, so the
// scalar reads below cannot assume any alignment.

pub fn u8_at(bytes: &[u8], offset: usize) -> Option<u8> {
    bytes.get(offset).copied()
}

pub fn u16_at(bytes: &[u8], offset: usize) -> Option<u16> {
    bytes
        .get(offset..offset.checked_add(2)?)
        .map(LittleEndian::read_u16)
}

pub fn i16_at(bytes: &[u8], offset: usize) -> Option<i16> {
    bytes
        .get(offset..offset.checked_add(2)?)
        .map(LittleEndian::read_i16)
}

pub fn i32_at(bytes: &[u8], offset: usize) -> Option<i32> {
    bytes
        .get(offset..offset.checked_add(4)?)
        .map(LittleEndian::read_i32)
}

pub fn f32_at(bytes: &[u8], offset: usize) -> Option<f32> {
    bytes
        .get(offset..offset.checked_add(4)?)
        .map(LittleEndian::read_f32)
}

/// Applies a record-relative i32 offset to the record's absolute start,
/// rejecting results outside `len`.
pub fn relative_offset(record_start: usize, offset: i32, len: usize) -> Option<usize> {
    let absolute = (record_start as isize).checked_add(offset as isize)?;
    let absolute = usize::try_from(absolute).ok()?;
    (absolute < len).then_some(absolute)
}
