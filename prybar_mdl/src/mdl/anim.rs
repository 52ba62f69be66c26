//! Animation data resolution and decompression.
//!
//! Frame data for one animation lives either inline after its descriptor or
//! in an external block file, optionally split into fixed-length time
//! sections. Two encodings exist: the legacy chain of per-bone records with
//! run-length-encoded value channels, and the newer fixed-stride frame
//! blocks. Both decode here into per-frame bone transforms.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use glam::{Quat, Vec3};
use tracing::{debug, warn};

use crate::binary_utils::{f32_at, i16_at, i32_at, u16_at, u8_at};
use crate::Error;

use super::encodings::{
    decode_quaternion48, decode_quaternion48s, decode_quaternion64, decode_vector48,
    quat_to_euler,
};
use super::{AnimBlock, AnimationDesc, Bone, Model, Movement};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AnimationDescFlags: i32 {
        const LOOPING = 0x0001;
        const SNAP = 0x0002;
        const DELTA = 0x0004;
        const AUTOPLAY = 0x0008;
        const POST = 0x0010;
        const ALL_ZEROS = 0x0020;
        const FRAME_ANIM = 0x0040;
        const CYCLEPOSE = 0x0080;
        const REALTIME = 0x0100;
        const LOCAL = 0x0200;
        const HIDDEN = 0x0400;
        const OVERRIDE = 0x0800;
        const ACTIVITY = 0x1000;
        const EVENT = 0x2000;
        const WORLD = 0x4000;
    }
}

bitflags! {
    /// Flag byte of a legacy per-bone animation record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoneAnimFlags: u8 {
        const RAW_POS = 0x01;
        const RAW_ROT = 0x02;
        const ANIM_POS = 0x04;
        const ANIM_ROT = 0x08;
        const DELTA = 0x10;
        const RAW_ROT2 = 0x20;
    }
}

bitflags! {
    /// Flag byte of one bone in a frame-block section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameBoneFlags: u8 {
        const RAW_POS = 0x01;
        const RAW_ROT = 0x02;
        const ANIM_POS = 0x04;
        const ANIM_ROT = 0x08;
        const FULL_ANIM_POS = 0x10;
        const CONST_POS2 = 0x20;
        const CONST_ROT2 = 0x40;
        const ANIM_ROT2 = 0x80;
    }
}

/// Terminates the legacy per-bone record chain.
const BONE_CHAIN_END: u8 = 255;

/// One resolved time-chunk of an animation's frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationSection {
    pub block_index: i32,
    pub byte_offset: i32,
}

/// Resolves the section list for a descriptor. A descriptor without a
/// section table has exactly one implicit section covering all frames.
#[must_use]
pub fn animation_sections(mdl_bytes: &[u8], desc: &AnimationDesc) -> Vec<AnimationSection> {
    let implicit = vec![AnimationSection {
        block_index: desc.anim_block,
        byte_offset: desc.anim_offset,
    }];

    if desc.section_offset == 0 || desc.section_frame_count <= 0 {
        return implicit;
    }

    // The table always carries two extra entries: the truncated final chunk
    // and an end marker.
    let section_count = desc.frame_count / desc.section_frame_count + 2;
    let Ok(section_count) = usize::try_from(section_count) else {
        return implicit;
    };

    let Some(table_start) = checked_offset(desc.offset_start, desc.section_offset) else {
        return implicit;
    };
    let Some(table_len) = section_count.checked_mul(8) else {
        return implicit;
    };
    if table_start
        .checked_add(table_len)
        .map_or(true, |end| end > mdl_bytes.len())
    {
        return implicit;
    }

    (0..section_count)
        .filter_map(|i| {
            let at = table_start + i * 8;
            Some(AnimationSection {
                block_index: i32_at(mdl_bytes, at)?,
                byte_offset: i32_at(mdl_bytes, at + 4)?,
            })
        })
        .collect()
}

/// Maps a global frame index to `(section_index, local_frame_index)`,
/// clamping rather than panicking for out-of-range frames.
#[must_use]
pub fn section_for_frame(
    desc: &AnimationDesc,
    section_count: usize,
    frame_index: usize,
) -> (usize, usize) {
    if section_count <= 1 || desc.section_frame_count <= 0 {
        return (0, frame_index);
    }

    let per_section = desc.section_frame_count as usize;
    let section_index = (frame_index / per_section).min(section_count - 1);
    let local_frame_index = frame_index.saturating_sub(section_index * per_section);

    (section_index, local_frame_index)
}

/// Effective frame count of one section, and whether the legacy channel
/// reader should treat it as reaching the end of its stream (which changes
/// the trailing-padding handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionSpan {
    pub frame_count: i32,
    pub reads_to_stream_end: bool,
}

#[must_use]
pub fn section_span(
    desc: &AnimationDesc,
    section_count: usize,
    section_index: usize,
) -> SectionSpan {
    if section_count <= 1 || desc.section_frame_count <= 0 {
        return SectionSpan {
            frame_count: desc.frame_count,
            reads_to_stream_end: true,
        };
    }

    let frame_count = if section_index < section_count - 2 {
        desc.section_frame_count
    } else {
        desc.frame_count - (section_count as i32 - 2) * desc.section_frame_count
    };

    let reads_to_stream_end = section_index >= section_count - 2
        || desc.frame_count == (section_index as i32 + 1) * desc.section_frame_count;

    SectionSpan {
        frame_count,
        reads_to_stream_end,
    }
}

fn checked_offset(base: usize, offset: i32) -> Option<usize> {
    let absolute = (base as isize).checked_add(offset as isize)?;
    usize::try_from(absolute).ok()
}

/// Per-axis run-length-encoded value streams for one bone, one section.
/// An axis offset of zero means that axis is constant zero, not absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueChannels {
    pub x_offset: i16,
    pub y_offset: i16,
    pub z_offset: i16,
    pub x: Vec<i16>,
    pub y: Vec<i16>,
    pub z: Vec<i16>,
}

/// One bone's decoded animation record for one section of the legacy
/// encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct BoneAnimation {
    pub flags: BoneAnimFlags,
    pub raw_pos: Option<Vec3>,
    pub raw_rot: Option<Quat>,
    pub pos_channels: Option<ValueChannels>,
    pub rot_channels: Option<ValueChannels>,
}

/// Reads the legacy per-bone record chain of one section into per-bone
/// animation data, indexed by bone. A bone without a record keeps its base
/// pose.
#[must_use]
pub fn read_section_animations(
    bytes: &[u8],
    data_offset: usize,
    bone_count: usize,
    span: SectionSpan,
) -> Vec<Option<BoneAnimation>> {
    let bone_count = bone_count.max(1);
    let mut by_bone: Vec<Option<BoneAnimation>> = vec![None; bone_count];

    if data_offset >= bytes.len() {
        return by_bone;
    }

    let mut record_start = data_offset;
    for _ in 0..bone_count {
        let Some(bone_index) = u8_at(bytes, record_start) else {
            break;
        };
        if bone_index == BONE_CHAIN_END {
            break;
        }
        if usize::from(bone_index) >= bone_count {
            break;
        }

        let Some(flag_byte) = u8_at(bytes, record_start + 1) else {
            break;
        };
        let flags = BoneAnimFlags::from_bits_truncate(flag_byte);
        let Some(next_offset) = i16_at(bytes, record_start + 2) else {
            break;
        };

        let mut cursor = record_start + 4;

        let mut raw_rot = None;
        let mut raw_pos = None;

        if flags.contains(BoneAnimFlags::RAW_ROT2) {
            if let Some(raw) = bytes.get(cursor..cursor + 8) {
                let mut quad = [0_u8; 8];
                quad.copy_from_slice(raw);
                raw_rot = Some(decode_quaternion64(quad));
            }
            cursor += 8;
        }
        if flags.contains(BoneAnimFlags::RAW_ROT) {
            if let (Some(x), Some(y), Some(zw)) = (
                u16_at(bytes, cursor),
                u16_at(bytes, cursor + 2),
                u16_at(bytes, cursor + 4),
            ) {
                raw_rot = Some(decode_quaternion48(x, y, zw));
            }
            cursor += 6;
        }
        if flags.contains(BoneAnimFlags::RAW_POS) {
            if let (Some(x), Some(y), Some(z)) = (
                u16_at(bytes, cursor),
                u16_at(bytes, cursor + 2),
                u16_at(bytes, cursor + 4),
            ) {
                raw_pos = Some(decode_vector48(x, y, z));
            }
            cursor += 6;
        }

        let mut rot_channels = None;
        let mut pos_channels = None;

        let rot_offsets_start = cursor;
        if flags.contains(BoneAnimFlags::ANIM_ROT) {
            cursor += 6;
        }
        let pos_offsets_start = cursor;

        if flags.contains(BoneAnimFlags::ANIM_ROT) {
            rot_channels = read_value_channels(bytes, rot_offsets_start, span);
        }
        if flags.contains(BoneAnimFlags::ANIM_POS) {
            pos_channels = read_value_channels(bytes, pos_offsets_start, span);
        }

        by_bone[usize::from(bone_index)] = Some(BoneAnimation {
            flags,
            raw_pos,
            raw_rot,
            pos_channels,
            rot_channels,
        });

        if next_offset == 0 {
            break;
        }
        let Some(next) = checked_offset(record_start, i32::from(next_offset)) else {
            break;
        };
        record_start = next;
    }

    by_bone
}

fn read_value_channels(
    bytes: &[u8],
    offsets_start: usize,
    span: SectionSpan,
) -> Option<ValueChannels> {
    let x_offset = i16_at(bytes, offsets_start)?;
    let y_offset = i16_at(bytes, offsets_start + 2)?;
    let z_offset = i16_at(bytes, offsets_start + 4)?;

    let read_axis = |offset: i16| {
        if offset <= 0 {
            return Vec::new();
        }
        match checked_offset(offsets_start, i32::from(offset)) {
            Some(at) => read_rle_values(bytes, at, span),
            None => Vec::new(),
        }
    };

    Some(ValueChannels {
        x_offset,
        y_offset,
        z_offset,
        x: read_axis(x_offset),
        y: read_axis(y_offset),
        z: read_axis(z_offset),
    })
}

/// Reads one run-length-encoded value stream covering `span.frame_count`
/// frames. Tokens are `(valid, total)` byte pairs followed by `valid`
/// literal values; frames past `valid` repeat the last literal.
#[must_use]
pub fn read_rle_values(bytes: &[u8], offset: usize, span: SectionSpan) -> Vec<i16> {
    let mut values = Vec::with_capacity(64);
    let mut cursor = offset;
    let mut remaining = span.frame_count;
    let mut accumulated_total = 0;

    while remaining > 0 {
        let Some(token) = i16_at(bytes, cursor) else {
            break;
        };
        cursor += 2;

        let total = token_total(token) as i32;
        accumulated_total += total;
        if total == 0 {
            break;
        }

        remaining -= total;
        values.push(token);

        for _ in 0..token_valid(token) {
            let Some(value) = i16_at(bytes, cursor) else {
                break;
            };
            cursor += 2;
            values.push(value);
        }
    }

    // Sections that are not part of the final pair carry two trailing
    // padding values when their totals land exactly on the frame count;
    // consume them like the reference tool does.
    if !span.reads_to_stream_end
        && accumulated_total == span.frame_count
        && i16_at(bytes, cursor + 2).is_some()
    {
        let _ = i16_at(bytes, cursor);
        let _ = i16_at(bytes, cursor + 2);
    }

    values
}

fn token_valid(token: i16) -> usize {
    usize::from(token as u16 & 0xff)
}

fn token_total(token: i16) -> usize {
    usize::from((token as u16 >> 8) & 0xff)
}

/// Extracts the scaled value of frame `frame_index` from an RLE stream.
/// Walking off the end of the stream yields zero.
#[must_use]
pub fn extract_anim_value(frame_index: usize, values: &[i16], scale: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    let mut k = frame_index;
    let mut i = 0;

    while token_total(values[i]) <= k {
        k -= token_total(values[i]);
        i += token_valid(values[i]) + 1;
        if i >= values.len() || token_total(values[i]) == 0 {
            return 0.0;
        }
    }

    let valid = token_valid(values[i]);
    let literal = if valid > k {
        values.get(i + k + 1)
    } else {
        values.get(i + valid)
    };

    literal.copied().map_or(0.0, |value| {
        (f64::from(value) * f64::from(scale)) as f32
    })
}

/// Position of one bone at one local frame of a legacy section. Raw values
/// win over channels; channel values scale by the bone's per-axis decode
/// scale and add to the base pose unless the record is delta-encoded.
#[must_use]
pub fn bone_position(frame_index: usize, bone: &Bone, anim: Option<&BoneAnimation>) -> Vec3 {
    let Some(anim) = anim else {
        return bone.position;
    };

    if anim.flags.contains(BoneAnimFlags::RAW_POS) {
        if let Some(raw) = anim.raw_pos {
            return raw;
        }
    }

    if !anim.flags.contains(BoneAnimFlags::ANIM_POS) {
        return if anim.flags.contains(BoneAnimFlags::DELTA) {
            Vec3::ZERO
        } else {
            bone.position
        };
    }

    let mut pos = Vec3::ZERO;
    if let Some(channels) = &anim.pos_channels {
        if channels.x_offset > 0 {
            pos.x = extract_anim_value(frame_index, &channels.x, bone.position_scale.x);
        }
        if channels.y_offset > 0 {
            pos.y = extract_anim_value(frame_index, &channels.y, bone.position_scale.y);
        }
        if channels.z_offset > 0 {
            pos.z = extract_anim_value(frame_index, &channels.z, bone.position_scale.z);
        }
    }

    if !anim.flags.contains(BoneAnimFlags::DELTA) {
        pos += bone.position;
    }

    pos
}

/// Rotation (Euler radians) of one bone at one local frame of a legacy
/// section.
#[must_use]
pub fn bone_rotation(frame_index: usize, bone: &Bone, anim: Option<&BoneAnimation>) -> Vec3 {
    let Some(anim) = anim else {
        return bone.rotation;
    };

    if anim
        .flags
        .intersects(BoneAnimFlags::RAW_ROT | BoneAnimFlags::RAW_ROT2)
    {
        if let Some(raw) = anim.raw_rot {
            return quat_to_euler(raw);
        }
    }

    if !anim.flags.contains(BoneAnimFlags::ANIM_ROT) {
        return if anim.flags.contains(BoneAnimFlags::DELTA) {
            Vec3::ZERO
        } else {
            bone.rotation
        };
    }

    let mut angles = Vec3::ZERO;
    if let Some(channels) = &anim.rot_channels {
        if channels.x_offset > 0 {
            angles.x = extract_anim_value(frame_index, &channels.x, bone.rotation_scale.x);
        }
        if channels.y_offset > 0 {
            angles.y = extract_anim_value(frame_index, &channels.y, bone.rotation_scale.y);
        }
        if channels.z_offset > 0 {
            angles.z = extract_anim_value(frame_index, &channels.z, bone.rotation_scale.z);
        }
    }

    if !anim.flags.contains(BoneAnimFlags::DELTA) {
        angles += bone.rotation;
    }

    angles
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct FrameBoneConstants {
    raw_pos: Option<Vec3>,
    raw_rot: Option<Quat>,
    const_pos: Option<Vec3>,
    const_rot: Option<Quat>,
}

/// One section of frame-block animation data: a per-bone flag table, the
/// per-bone constants, and the location of the fixed-stride frame records.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnimSection<'a> {
    data: &'a [u8],
    bone_flags: Vec<FrameBoneFlags>,
    constants: Vec<FrameBoneConstants>,
    frame_data_start: usize,
    frame_length: usize,
}

const FRAME_ANIM_HEADER_LEN: usize = 24;

#[must_use]
pub fn read_frame_anim_section(
    bytes: &[u8],
    data_offset: usize,
    bone_count: usize,
) -> Option<FrameAnimSection> {
    if bone_count == 0 {
        return None;
    }
    if data_offset.checked_add(FRAME_ANIM_HEADER_LEN)? > bytes.len() {
        return None;
    }

    let constants_offset = i32_at(bytes, data_offset)?;
    let frame_offset = i32_at(bytes, data_offset + 4)?;
    let frame_length = i32_at(bytes, data_offset + 8)?;

    let flags_start = data_offset + FRAME_ANIM_HEADER_LEN;
    let flag_bytes = bytes.get(flags_start..flags_start.checked_add(bone_count)?)?;
    let bone_flags: Vec<FrameBoneFlags> = flag_bytes
        .iter()
        .map(|&b| FrameBoneFlags::from_bits_truncate(b))
        .collect();

    let mut constants = vec![FrameBoneConstants::default(); bone_count];
    if constants_offset != 0 {
        if let Some(mut cursor) = checked_offset(data_offset, constants_offset) {
            if cursor < bytes.len() {
                for (bone_index, flags) in bone_flags.iter().enumerate() {
                    let entry = &mut constants[bone_index];

                    // Constants are packed in this exact order per bone.
                    if flags.contains(FrameBoneFlags::CONST_ROT2) {
                        if let Some(raw) = bytes.get(cursor..cursor + 6) {
                            let mut packed = [0_u8; 6];
                            packed.copy_from_slice(raw);
                            entry.const_rot = Some(decode_quaternion48s(packed));
                        }
                        cursor += 6;
                    }
                    if flags.contains(FrameBoneFlags::CONST_POS2) {
                        if let (Some(x), Some(y), Some(z)) = (
                            f32_at(bytes, cursor),
                            f32_at(bytes, cursor + 4),
                            f32_at(bytes, cursor + 8),
                        ) {
                            entry.const_pos = Some(Vec3::new(x, y, z));
                        }
                        cursor += 12;
                    }
                    if flags.contains(FrameBoneFlags::RAW_ROT) {
                        if let (Some(x), Some(y), Some(zw)) = (
                            u16_at(bytes, cursor),
                            u16_at(bytes, cursor + 2),
                            u16_at(bytes, cursor + 4),
                        ) {
                            entry.raw_rot = Some(decode_quaternion48(x, y, zw));
                        }
                        cursor += 6;
                    }
                    if flags.contains(FrameBoneFlags::RAW_POS) {
                        if let (Some(x), Some(y), Some(z)) = (
                            u16_at(bytes, cursor),
                            u16_at(bytes, cursor + 2),
                            u16_at(bytes, cursor + 4),
                        ) {
                            entry.raw_pos = Some(decode_vector48(x, y, z));
                        }
                        cursor += 6;
                    }
                }
            }
        }
    }

    let frame_data_start = if frame_offset == 0 {
        0
    } else {
        checked_offset(data_offset, frame_offset).unwrap_or(0)
    };

    Some(FrameAnimSection {
        data: bytes,
        bone_flags,
        constants,
        frame_data_start,
        frame_length: usize::try_from(frame_length).unwrap_or(0),
    })
}

impl FrameAnimSection<'_> {
    /// Decodes one frame for every bone into `positions`/`rotations`, which
    /// must already hold the base pose (or zero for delta animations).
    ///
    /// Per-frame fields are packed per bone in a fixed order; raw and
    /// constant values are applied first and per-frame values override
    /// them, with the compact rotation applied last. Later writes win, so
    /// the order is load-bearing.
    pub fn decode_frame(
        &self,
        local_frame_index: usize,
        positions: &mut [Vec3],
        rotations: &mut [Vec3],
    ) {
        for (bone_index, flags) in self.bone_flags.iter().enumerate().take(positions.len()) {
            let constants = &self.constants[bone_index];

            if flags.contains(FrameBoneFlags::RAW_ROT) {
                if let Some(raw) = constants.raw_rot {
                    rotations[bone_index] = quat_to_euler(raw);
                }
            }
            if flags.contains(FrameBoneFlags::RAW_POS) {
                if let Some(raw) = constants.raw_pos {
                    positions[bone_index] = raw;
                }
            }
            if flags.contains(FrameBoneFlags::CONST_POS2) {
                if let Some(constant) = constants.const_pos {
                    positions[bone_index] = constant;
                }
            }
            if flags.contains(FrameBoneFlags::CONST_ROT2) {
                if let Some(constant) = constants.const_rot {
                    rotations[bone_index] = quat_to_euler(constant);
                }
            }
        }

        if self.frame_length == 0 || self.frame_data_start == 0 {
            return;
        }

        let Some(frame_start) = self
            .frame_data_start
            .checked_add(local_frame_index.saturating_mul(self.frame_length))
        else {
            return;
        };
        if frame_start + self.frame_length > self.data.len() {
            return;
        }

        // Per-frame fields are packed in read order compact-rot, rot, pos,
        // full-pos, but the compact rotation is applied after everything
        // else. Read first, apply second.
        let mut cursor = frame_start;
        for (bone_index, flags) in self.bone_flags.iter().enumerate() {
            let mut compact_rot = None;
            let mut anim_rot = None;
            let mut anim_pos = None;
            let mut full_anim_pos = None;

            if flags.contains(FrameBoneFlags::ANIM_ROT2) {
                if let Some(raw) = self.data.get(cursor..cursor + 6) {
                    let mut packed = [0_u8; 6];
                    packed.copy_from_slice(raw);
                    compact_rot = Some(decode_quaternion48s(packed));
                }
                cursor += 6;
            }
            if flags.contains(FrameBoneFlags::ANIM_ROT) {
                if let (Some(x), Some(y), Some(zw)) = (
                    u16_at(self.data, cursor),
                    u16_at(self.data, cursor + 2),
                    u16_at(self.data, cursor + 4),
                ) {
                    anim_rot = Some(decode_quaternion48(x, y, zw));
                }
                cursor += 6;
            }
            if flags.contains(FrameBoneFlags::ANIM_POS) {
                if let (Some(x), Some(y), Some(z)) = (
                    u16_at(self.data, cursor),
                    u16_at(self.data, cursor + 2),
                    u16_at(self.data, cursor + 4),
                ) {
                    anim_pos = Some(decode_vector48(x, y, z));
                }
                cursor += 6;
            }
            if flags.contains(FrameBoneFlags::FULL_ANIM_POS) {
                if let (Some(x), Some(y), Some(z)) = (
                    f32_at(self.data, cursor),
                    f32_at(self.data, cursor + 4),
                    f32_at(self.data, cursor + 8),
                ) {
                    full_anim_pos = Some(Vec3::new(x, y, z));
                }
                cursor += 12;
            }

            if bone_index >= positions.len() {
                continue;
            }

            if let Some(rot) = anim_rot {
                rotations[bone_index] = quat_to_euler(rot);
            }
            if let Some(pos) = anim_pos {
                positions[bone_index] = pos;
            }
            if let Some(pos) = full_anim_pos {
                positions[bone_index] = pos;
            }
            if let Some(rot) = compact_rot {
                rotations[bone_index] = quat_to_euler(rot);
            }
        }
    }

    #[must_use]
    pub fn bone_flags(&self) -> &[FrameBoneFlags] {
        &self.bone_flags
    }
}

/// The decoded animation data of one section.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedSection<'a> {
    Legacy(Vec<Option<BoneAnimation>>),
    FrameAnim(FrameAnimSection<'a>),
    /// The section's byte range could not be resolved; every bone keeps its
    /// base pose.
    Unavailable,
}

/// Piecewise root displacement and yaw for frames past the last keyframe's
/// movement segment boundary.
#[must_use]
pub fn piecewise_movement(frame_index: usize, movements: &[Movement]) -> (Vec3, f32) {
    let frame_index = frame_index as i32;
    let mut previous_end = 0;
    let mut position = Vec3::ZERO;
    let mut yaw_radians = 0.0_f32;

    for movement in movements {
        if frame_index <= movement.end_frame_index {
            let span = movement.end_frame_index - previous_end;
            if span <= 0 {
                break;
            }

            let f = (frame_index - previous_end) as f32 / span as f32;
            let d = movement.v0 * f + 0.5 * (movement.v1 - movement.v0) * f * f;

            position += d * movement.vector;

            let target_yaw = movement.angle_degrees.to_radians();
            yaw_radians = yaw_radians * (1.0 - f) + target_yaw * f;

            return (position, yaw_radians);
        }

        previous_end = movement.end_frame_index;
        position = movement.position;
        yaw_radians = movement.angle_degrees.to_radians();
    }

    (position, yaw_radians)
}

/// Finalizes a decoded root-bone transform: accumulated movement on frames
/// past zero, then the version-dependent axis remap. Non-root bones are
/// untouched.
pub fn apply_root_adjustments(
    version: i32,
    frame_index: usize,
    bone: &Bone,
    movements: &[Movement],
    position: &mut Vec3,
    rotation: &mut Vec3,
) {
    if bone.parent_bone_index != -1 {
        return;
    }

    if frame_index > 0 && !movements.is_empty() {
        let (delta_position, delta_yaw) = piecewise_movement(frame_index, movements);
        *position += delta_position;
        rotation.z += delta_yaw;
    }

    if version > 47 {
        *position = Vec3::new(position.y, -position.x, position.z);
    }
}

/// An external animation block file held in memory.
#[derive(Debug, Clone)]
pub struct Ani {
    bytes: Vec<u8>,
}

impl Ani {
    /// # Errors
    ///
    /// Returns `Err` if reading fails.
    pub fn read(mut read: impl Read) -> io::Result<Self> {
        let mut bytes = Vec::new();
        read.read_to_end(&mut bytes)?;
        Ok(Self { bytes })
    }

    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or read.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|err| Error::from_io(&err, &path.display()))?;
        Self::read(file).map_err(|err| Error::from_io(&err, &path.display()))
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for Ani {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// Candidate paths for the external animation block file, in resolution
/// order: the stored name as an absolute path, relative to the model's
/// directory, relative to the detected game content root, by bare file name
/// beside the model, and finally the model's own base name with an `.ani`
/// extension.
#[must_use]
pub fn ani_path_candidates(mdl_path: &Path, block_file_name: Option<&str>) -> Vec<PathBuf> {
    let directory = mdl_path.parent().unwrap_or_else(|| Path::new("."));
    let mut candidates = Vec::with_capacity(4);

    if let Some(stored) = block_file_name {
        let mut rel = stored.replace('\\', "/");
        while rel.contains("//") {
            rel = rel.replace("//", "/");
        }
        let mut rel = rel.trim().to_owned();

        if rel.to_ascii_lowercase().starts_with("/models/") {
            rel = rel.trim_start_matches('/').to_owned();
        }

        if !rel.is_empty() {
            if Path::new(&rel).extension().is_none() {
                rel.push_str(".ani");
            }

            let rel_path = Path::new(&rel);
            if rel_path.is_absolute() {
                candidates.push(rel_path.to_path_buf());
            }

            candidates.push(directory.join(rel_path));

            // Stored names are usually content-root relative; detect the
            // root as everything before the models directory.
            let full = mdl_path.to_string_lossy().replace('\\', "/");
            if let Some(at) = full.to_ascii_lowercase().find("/models/") {
                candidates.push(Path::new(&full[..at]).join(rel_path));
            }

            if let Some(file_name) = rel_path.file_name() {
                candidates.push(directory.join(file_name));
            }
        }
    }

    let base_name = mdl_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    candidates.push(directory.join(format!("{base_name}.ani")));

    candidates
}

/// Resolves the external animation block file beside `mdl_path`, returning
/// the first existing candidate.
#[must_use]
pub fn resolve_ani_path(mdl_path: &Path, block_file_name: Option<&str>) -> Option<PathBuf> {
    for candidate in ani_path_candidates(mdl_path, block_file_name) {
        debug!("trying animation block file at `{}`", candidate.display());
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    None
}

/// Ephemeral per-frame output: one position and one rotation (Euler
/// radians) per bone index.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPose {
    pub frame_index: usize,
    pub positions: Vec<Vec3>,
    pub rotations: Vec<Vec3>,
}

/// Decodes per-frame bone transforms for one model. Borrows the model
/// snapshot, the model bytes and (optionally) the external animation block
/// bytes; the caller owns all three and scopes them to one export.
#[derive(Debug, Clone, Copy)]
pub struct AnimationDecoder<'a> {
    model: &'a Model,
    mdl_bytes: &'a [u8],
    ani_bytes: Option<&'a [u8]>,
}

impl<'a> AnimationDecoder<'a> {
    #[must_use]
    pub fn new(model: &'a Model, mdl_bytes: &'a [u8]) -> Self {
        Self {
            model,
            mdl_bytes,
            ani_bytes: None,
        }
    }

    #[must_use]
    pub fn with_ani(mut self, ani_bytes: &'a [u8]) -> Self {
        self.ani_bytes = Some(ani_bytes);
        self
    }

    #[must_use]
    pub fn sections(&self, desc: &AnimationDesc) -> Vec<AnimationSection> {
        animation_sections(self.mdl_bytes, desc)
    }

    /// Resolves which byte source and offset hold one section's data.
    fn section_data(
        &self,
        desc: &AnimationDesc,
        sections: &[AnimationSection],
        section_index: usize,
    ) -> Option<(&'a [u8], usize)> {
        let section = sections.get(section_index)?;

        if section.block_index == 0 {
            let mut byte_offset = section.byte_offset;
            if sections.len() > 1 {
                // Some encoders wrote the first section's offset
                // inconsistently; compensate the same way the reference
                // tool does.
                byte_offset = section.byte_offset + (desc.anim_offset - sections[0].byte_offset);
            }

            let offset = checked_offset(desc.offset_start, byte_offset)?;
            (offset < self.mdl_bytes.len()).then_some((self.mdl_bytes, offset))
        } else {
            let block_index = usize::try_from(section.block_index).ok()?;
            let block: &AnimBlock = self.model.anim_blocks.get(block_index)?;
            let ani = self.ani_bytes?;

            let offset = checked_offset(
                usize::try_from(block.data_start).ok()?,
                section.byte_offset,
            )?;
            (offset < ani.len()).then_some((ani, offset))
        }
    }

    /// Decodes one section's animation data. Failure to resolve the data
    /// yields [`DecodedSection::Unavailable`] so the affected frames fall
    /// back to base poses instead of aborting the export.
    #[must_use]
    pub fn decode_section(
        &self,
        desc: &AnimationDesc,
        sections: &[AnimationSection],
        section_index: usize,
    ) -> DecodedSection<'a> {
        let span = section_span(desc, sections.len(), section_index);
        if span.frame_count <= 0 {
            return DecodedSection::Unavailable;
        }

        let Some((bytes, offset)) = self.section_data(desc, sections, section_index) else {
            warn!(
                animation = desc.name.as_str(),
                section = section_index,
                "animation section data unavailable, substituting base pose"
            );
            return DecodedSection::Unavailable;
        };

        let bone_count = self.model.bones.len().max(1);

        if desc.flags.contains(AnimationDescFlags::FRAME_ANIM) {
            match read_frame_anim_section(bytes, offset, bone_count) {
                Some(section) => DecodedSection::FrameAnim(section),
                None => DecodedSection::Unavailable,
            }
        } else {
            DecodedSection::Legacy(read_section_animations(bytes, offset, bone_count, span))
        }
    }

    /// Decodes the pose of every bone at one global frame, without root
    /// motion applied. Prefer [`Self::frames`] for sequential export, which
    /// amortizes the per-section decode.
    #[must_use]
    pub fn pose_for_frame(
        &self,
        desc: &AnimationDesc,
        sections: &[AnimationSection],
        frame_index: usize,
    ) -> DecodedPose {
        let (section_index, local_frame_index) =
            section_for_frame(desc, sections.len(), frame_index);
        let section = self.decode_section(desc, sections, section_index);
        self.section_pose(desc, &section, local_frame_index, frame_index)
    }

    fn section_pose(
        &self,
        desc: &AnimationDesc,
        section: &DecodedSection,
        local_frame_index: usize,
        frame_index: usize,
    ) -> DecodedPose {
        let bones = &self.model.bones;
        let delta = desc.flags.contains(AnimationDescFlags::DELTA);

        let mut positions;
        let mut rotations;

        match section {
            DecodedSection::Legacy(by_bone) => {
                positions = Vec::with_capacity(bones.len());
                rotations = Vec::with_capacity(bones.len());
                for bone in bones {
                    let anim = by_bone.get(bone.index).and_then(Option::as_ref);
                    positions.push(bone_position(local_frame_index, bone, anim));
                    rotations.push(bone_rotation(local_frame_index, bone, anim));
                }
            }
            DecodedSection::FrameAnim(frame_anim) => {
                positions = base_positions(bones, delta);
                rotations = base_rotations(bones, delta);
                frame_anim.decode_frame(local_frame_index, &mut positions, &mut rotations);
            }
            DecodedSection::Unavailable => {
                positions = base_positions(bones, delta);
                rotations = base_rotations(bones, delta);
            }
        }

        DecodedPose {
            frame_index,
            positions,
            rotations,
        }
    }

    /// Iterates every frame of one animation in order, decoding each
    /// section's channel data once and applying root-bone adjustments.
    /// Zero-frame descriptors yield nothing.
    #[must_use]
    pub fn frames<'d>(&'d self, desc: &'d AnimationDesc) -> Frames<'a, 'd> {
        let sections = self.sections(desc);
        Frames {
            decoder: self,
            desc,
            sections,
            current: None,
            frame_index: 0,
        }
    }
}

fn base_positions(bones: &[Bone], delta: bool) -> Vec<Vec3> {
    if delta {
        vec![Vec3::ZERO; bones.len()]
    } else {
        bones.iter().map(|bone| bone.position).collect()
    }
}

fn base_rotations(bones: &[Bone], delta: bool) -> Vec<Vec3> {
    if delta {
        vec![Vec3::ZERO; bones.len()]
    } else {
        bones.iter().map(|bone| bone.rotation).collect()
    }
}

/// Sequential frame iterator over one animation.
pub struct Frames<'a, 'd> {
    decoder: &'d AnimationDecoder<'a>,
    desc: &'d AnimationDesc,
    sections: Vec<AnimationSection>,
    current: Option<(usize, DecodedSection<'a>)>,
    frame_index: usize,
}

impl Iterator for Frames<'_, '_> {
    type Item = DecodedPose;

    fn next(&mut self) -> Option<Self::Item> {
        let frame_count = usize::try_from(self.desc.frame_count).unwrap_or(0);
        if self.frame_index >= frame_count {
            return None;
        }

        let frame_index = self.frame_index;
        self.frame_index += 1;

        let (section_index, local_frame_index) =
            section_for_frame(self.desc, self.sections.len(), frame_index);

        let needs_decode = self
            .current
            .as_ref()
            .map_or(true, |(current_index, _)| *current_index != section_index);
        if needs_decode {
            let section = self
                .decoder
                .decode_section(self.desc, &self.sections, section_index);
            self.current = Some((section_index, section));
        }

        let (_, section) = self.current.as_ref()?;
        let mut pose =
            self.decoder
                .section_pose(self.desc, section, local_frame_index, frame_index);

        for (bone, (position, rotation)) in self
            .decoder
            .model
            .bones
            .iter()
            .zip(pose.positions.iter_mut().zip(pose.rotations.iter_mut()))
        {
            apply_root_adjustments(
                self.decoder.model.version,
                frame_index,
                bone,
                &self.desc.movements,
                position,
                rotation,
            );
        }

        Some(pose)
    }
}
