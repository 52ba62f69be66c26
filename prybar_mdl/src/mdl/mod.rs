pub mod anim;
mod encodings;

#[cfg(test)]
mod tests;

use std::fmt;
use std::io::{self, Read};
use std::mem::size_of;
use std::ops::Deref;
use std::path::Path;
use std::str;

use bitflags::bitflags;
use glam::{Quat, Vec3};
use itertools::Itertools;
use maligned::A4;
use tracing::warn;
use zerocopy::FromBytes;

use crate::binary_utils::{
    i16_at, i32_at, null_terminated_prefix, parse, parse_slice, read_to_aligned, realign,
    relative_offset, u16_at, u8_at,
};
use crate::{Error, FileType, Result};

pub use anim::AnimationDescFlags;
pub use encodings::{
    decode_quaternion48, decode_quaternion48s, decode_quaternion64, decode_vector48,
    euler_to_quat, quat_to_euler,
};

const SIGNATURE: &[u8; 4] = b"IDST";

fn corrupted(error: &'static str) -> Error {
    Error::Corrupted {
        ty: FileType::Mdl,
        error,
    }
}

fn string_at<'a>(bytes: &'a [u8], offset: usize, error: &'static str) -> Result<&'a str> {
    let tail = bytes.get(offset..).ok_or_else(|| corrupted(error))?;
    let name = null_terminated_prefix(tail).ok_or_else(|| corrupted(error))?;
    str::from_utf8(name).map_err(|_| corrupted(error))
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct Header1 {
    id: [u8; 4],
    version: i32,
    checksum: i32,
    name: [u8; 64],
    data_length: i32,

    eye_position: [f32; 3],
    illum_position: [f32; 3],
    hull_min: [f32; 3],
    hull_max: [f32; 3],
    view_bb_min: [f32; 3],
    view_bb_max: [f32; 3],

    flags: i32,

    bone_count: i32,
    bone_offset: i32,

    bone_controller_count: i32,
    bone_controller_offset: i32,

    hit_box_set_count: i32,
    hit_box_set_offset: i32,

    local_anim_count: i32,
    local_anim_offset: i32,

    local_seq_count: i32,
    local_seq_offset: i32,

    activity_list_version: i32,
    events_indexed: i32,

    texture_count: i32,
    texture_offset: i32,

    texture_dir_count: i32,
    texture_dir_offset: i32,

    skin_reference_count: i32,
    skin_family_count: i32,
    skin_family_offset: i32,

    body_part_count: i32,
    body_part_offset: i32,

    attachment_count: i32,
    attachment_offset: i32,

    local_node_count: i32,
    local_node_offset: i32,
    local_node_name_offset: i32,

    flex_desc_count: i32,
    flex_desc_offset: i32,

    flex_controller_count: i32,
    flex_controller_offset: i32,

    flex_rules_count: i32,
    flex_rules_offset: i32,

    ik_chain_count: i32,
    ik_chain_offset: i32,

    mouths_count: i32,
    mouths_offset: i32,

    local_pose_param_count: i32,
    local_pose_param_offset: i32,

    surface_prop_offset: i32,

    key_value_offset: i32,
    key_value_count: i32,

    ik_lock_count: i32,
    ik_lock_offset: i32,

    mass: f32,
    contents: i32,

    include_model_count: i32,
    include_model_offset: i32,

    virtual_model: i32,

    anim_block_name_offset: i32,
    anim_block_count: i32,
    anim_block_offset: i32,

    anim_block_model_p: i32,

    bone_table_name_offset: i32,

    vertex_base_p: i32,
    offset_base_p: i32,

    directional_dot_product: u8,
    root_lod: u8,
    num_allowed_root_lods: u8,

    unused: u8,
    zero_frame_cache_index: i32,

    flex_controller_ui_count: i32,
    flex_controller_ui_offset: i32,

    header_2_offset: i32,

    unused_2: i32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct Header2 {
    src_bone_transform_count: i32,
    src_bone_transform_offset: i32,

    illum_position_attachment_index: i32,

    max_eye_deflection: f32,

    linear_bone_offset: i32,

    name_offset: i32,
    bone_flex_driver_count: i32,
    bone_flex_driver_offset: i32,
}

/// The leading 144 bytes of a bone record, shared by every supported layout.
/// Trailing fields (flags, physics bone, surface prop) sit at
/// layout-dependent offsets and are read through [`BoneLayout`].
#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
pub struct BoneRecord {
    name_offset: i32,
    pub parent_bone_index: i32,
    bone_controller_indexes: [i32; 6],

    pub position: [f32; 3],
    pub quat: [f32; 4],
    pub rotation: [f32; 3],
    pub position_scale: [f32; 3],
    pub rotation_scale: [f32; 3],

    pub pose_to_bone: [f32; 12],
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct AnimationDescRecord {
    base_header_offset: i32,
    name_offset: i32,
    fps: f32,
    flags: i32,
    frame_count: i32,
    movement_count: i32,
    movement_offset: i32,

    ik_rule_zero_frame_offset: i32,
    compressed_ik_error_offset: i32,
    unused: [i32; 4],

    anim_block: i32,
    anim_offset: i32,
    ik_rule_count: i32,
    ik_rule_offset: i32,
    anim_block_ik_rule_offset: i32,
    local_hierarchy_count: i32,
    local_hierarchy_offset: i32,
    section_offset: i32,
    section_frame_count: i32,

    zero_frame_span: i16,
    zero_frame_count: i16,
    zero_frame_offset: i32,
    zero_frame_stall_time: f32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct MovementRecord {
    end_frame_index: i32,
    motion_flags: i32,
    v0: f32,
    v1: f32,
    angle: f32,
    vector: [f32; 3],
    position: [f32; 3],
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct AnimationBlockRecord {
    data_start: i32,
    data_end: i32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct SequenceDescRecord {
    base_header_offset: i32,
    name_offset: i32,
    activity_name_offset: i32,
    flags: i32,
    activity: i32,
    activity_weight: i32,
    event_count: i32,
    event_offset: i32,

    bb_min: [f32; 3],
    bb_max: [f32; 3],

    blend_count: i32,
    anim_index_offset: i32,
    movement_index: i32,
    group_size: [i32; 2],
    param_index: [i32; 2],
    param_start: [f32; 2],
    param_end: [f32; 2],
    param_parent: i32,

    fade_in_time: f32,
    fade_out_time: f32,

    local_entry_node_index: i32,
    local_exit_node_index: i32,
    node_flags: i32,

    entry_phase: f32,
    exit_phase: f32,
    last_frame: f32,

    next_seq: i32,
    pose: i32,

    ik_rule_count: i32,
    auto_layer_count: i32,
    auto_layer_offset: i32,
    weight_offset: i32,
    pose_key_offset: i32,

    ik_lock_count: i32,
    ik_lock_offset: i32,
    key_value_offset: i32,
    key_value_size: i32,
    cycle_pose_index: i32,

    activity_modifier_offset: i32,
    activity_modifier_count: i32,

    unused: [i32; 5],
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct FlexDescRecord {
    name_offset: i32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct FlexControllerRecord {
    type_offset: i32,
    name_offset: i32,
    local_to_global: i32,
    min: f32,
    max: f32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct FlexRuleRecord {
    flex_desc_index: i32,
    op_count: i32,
    op_offset: i32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
pub struct FlexOpRecord {
    pub op: i32,
    pub value: u32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct BodyPartRecord {
    name_offset: i32,
    model_count: i32,
    base: i32,
    model_offset: i32,
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
pub struct SubModelRecord {
    name: [u8; 64],
    pub kind: i32,
    pub bounding_radius: f32,

    mesh_count: i32,
    mesh_offset: i32,

    pub vertex_count: i32,
    pub vertex_offset: i32,
    tangent_offset: i32,

    attachment_count: i32,
    attachment_offset: i32,

    eye_ball_count: i32,
    eye_ball_offset: i32,

    vertex_data_p: i32,
    tangent_data_p: i32,

    unused: [i32; 8],
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
pub struct MeshRecord {
    pub material_index: i32,
    pub model_offset: i32,

    pub vertex_count: i32,
    pub vertex_index_start: i32,

    pub flex_count: i32,
    pub flex_offset: i32,

    pub material_type: i32,
    pub material_param: i32,

    pub id: i32,
    pub center: [f32; 3],

    vertex_data_p: i32,

    pub lod_vertex_counts: [i32; 8],

    unused: [i32; 8],
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct FlexRecord {
    flex_desc_index: i32,
    target_0: f32,
    target_1: f32,
    target_2: f32,
    target_3: f32,

    vert_count: i32,
    vert_offset: i32,

    flex_desc_partner_index: i32,
    vert_anim_type: u8,
    unused_c: [u8; 3],
    unused: [i32; 6],
}

#[derive(Debug, PartialEq, FromBytes)]
#[repr(C)]
struct TextureRecord {
    name_offset: i32,
    flags: i32,
    used: i32,
    unused_1: i32,
    material_p: i32,
    client_material_p: i32,
    unused: [i32; 10],
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: i32 {
        const AUTO_GENERATED_HITBOX = 1 << 0;
        const USES_ENV_CUBEMAP = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const TRANSLUCENT_TWO_PASS = 1 << 3;
        const STATIC_PROP = 1 << 4;
        const USES_FB_TEXTURE = 1 << 5;
        const HAS_SHADOW_LOD = 1 << 6;
        const USES_BUMP_MAPPING = 1 << 7;
        const USE_SHADOW_LOD_MATERIALS = 1 << 8;
        const OBSOLETE = 1 << 9;
        const UNUSED = 1 << 10;
        const NO_FORCED_FADE = 1 << 11;
        const FORCE_PHONEME_CROSS_FADE = 1 << 12;
        const CONSTANT_DIRECTIONAL_LIGHT_DOT = 1 << 13;
        const FLEXES_CONVERTED = 1 << 14;
        const BUILT_IN_PREVIEW_MODE = 1 << 15;
        const AMBIENT_BOOST = 1 << 16;
        const DO_NOT_CAST_SHADOWS = 1 << 17;
        const CAST_TEXTURE_SHADOWS = 1 << 18;
    }
}

/// A compiled model file held in memory, aligned for zerocopy access.
#[derive(Clone)]
pub struct Mdl {
    bytes: Vec<u8>,
}

impl Mdl {
    /// # Errors
    ///
    /// Returns `Err` if reading fails.
    pub fn read(read: impl Read) -> io::Result<Self> {
        let bytes = read_to_aligned::<A4>(read)?;
        Ok(Self { bytes })
    }

    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|err| Error::from_io(&err, &path.display()))?;
        Self::read(file).map_err(|err| Error::from_io(&err, &path.display()))
    }

    /// # Errors
    ///
    /// Returns `Err` if the aligned copy cannot be allocated.
    pub fn from_bytes(bytes: Vec<u8>) -> io::Result<Self> {
        let bytes = realign::<A4>(bytes)?;
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// # Errors
    ///
    /// Returns `Err` if the file is too short or is not a model file.
    pub fn check_signature(&self) -> Result<()> {
        let signature = self
            .bytes
            .get(0..4)
            .ok_or_else(|| corrupted("eof reading signature"))?;

        if signature == SIGNATURE {
            Ok(())
        } else {
            Err(Error::InvalidSignature {
                ty: FileType::Mdl,
                signature: String::from_utf8_lossy(signature).into_owned(),
            })
        }
    }

    /// # Errors
    ///
    /// Returns `Err` if the file is too short.
    pub fn version(&self) -> Result<i32> {
        i32_at(&self.bytes, 4).ok_or_else(|| corrupted("eof reading version"))
    }

    /// Checks the embedded version, or the override when one is given, and
    /// returns the version decoding should assume. The override only selects
    /// the decode path; it never changes what is read from the file.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the effective version is unsupported.
    pub fn check_version(&self, version_override: Option<i32>) -> Result<i32> {
        let version = self.version()?;
        let effective = version_override.unwrap_or(version);

        if matches!(effective, 44..=49 | 52..=56 | 58 | 59) {
            Ok(effective)
        } else {
            Err(Error::UnsupportedVersion {
                ty: FileType::Mdl,
                version: effective,
            })
        }
    }

    /// # Errors
    ///
    /// Returns `Err` if the header is out of bounds.
    pub fn header(&self, version: i32) -> Result<HeaderRef> {
        // Version 53 inserts a name-copy offset after the checksum, shifting
        // the rest of the header by 4 bytes.
        let shift = if version == 53 { size_of::<i32>() } else { 0 };

        let header_1 =
            parse::<Header1>(&self.bytes, shift).ok_or_else(|| corrupted("eof reading header"))?;

        let header_2 = if version >= 48 && header_1.header_2_offset > 0 {
            parse::<Header2>(&self.bytes, header_1.header_2_offset as usize)
        } else {
            None
        };

        Ok(HeaderRef {
            header_1,
            header_2,
            version,
            bytes: &self.bytes,
        })
    }
}

impl fmt::Debug for Mdl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mdl").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderRef<'a> {
    header_1: &'a Header1,
    header_2: Option<&'a Header2>,
    version: i32,
    bytes: &'a [u8],
}

impl<'a> HeaderRef<'a> {
    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    #[must_use]
    pub fn checksum(&self) -> i32 {
        // Read directly so the v53 header shift cannot misattribute it.
        i32_at(self.bytes, 8).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn name(&self) -> Result<&'a str> {
        if self.version == 53 {
            let name_copy_offset = i32_at(self.bytes, 12).unwrap_or_default();
            if name_copy_offset > 0 {
                let name = string_at(
                    self.bytes,
                    name_copy_offset as usize,
                    "header name copy out of bounds",
                )?;
                if !name.trim().is_empty() {
                    return Ok(name);
                }
            }
        } else if let Some(header_2) = self.header_2 {
            if header_2.name_offset > 0 {
                let offset = self.header_1.header_2_offset as usize
                    + size_of::<Header2>()
                    + header_2.name_offset as usize;
                return string_at(self.bytes, offset, "header 2 name out of bounds");
            }
        }

        str::from_utf8(
            null_terminated_prefix(&self.header_1.name)
                .ok_or_else(|| corrupted("eof reading header name"))?,
        )
        .map_err(|_| corrupted("header name is not valid utf8"))
    }

    #[must_use]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.header_1.flags)
    }

    /// Common handling for the header's (offset, count) table pointers: a
    /// zero or negative offset or count means the table is absent.
    #[allow(clippy::unused_self)]
    fn table(&self, offset: i32, count: i32) -> (usize, usize) {
        if offset <= 0 || count <= 0 {
            (0, 0)
        } else {
            (offset as usize, count as usize)
        }
    }

    fn bones(&self) -> Result<BonesRef<'a>> {
        let (offset, count) = self.table(self.header_1.bone_offset, self.header_1.bone_count);

        if count == 0 || offset == 0 {
            return Ok(BonesRef {
                layout: &BONE_LAYOUTS[0],
                count: 0,
                offset,
                bytes: self.bytes,
            });
        }

        let layout = infer_bone_layout(self.bytes, offset, count)
            .ok_or_else(|| corrupted("no bone record layout matched"))?;

        Ok(BonesRef {
            layout,
            count,
            offset,
            bytes: self.bytes,
        })
    }

    /// # Errors
    ///
    /// Returns `Err` if the bone table is out of bounds or no record layout
    /// can be inferred for it.
    pub fn iter_bones(&self) -> Result<impl Iterator<Item = BoneRef<'a>>> {
        let bones = self.bones()?;
        Ok((0..bones.count).filter_map(move |i| {
            let offset = bones.offset + i * bones.layout.stride;
            let record = parse::<BoneRecord>(bones.bytes, offset)?;
            Some(BoneRef {
                record,
                layout: bones.layout,
                offset,
                bytes: bones.bytes,
            })
        }))
    }

    /// # Errors
    ///
    /// Returns `Err` if the texture table is out of bounds.
    pub fn iter_textures(&self) -> Result<impl Iterator<Item = TextureRef<'a>>> {
        let (offset, count) = self.table(self.header_1.texture_offset, self.header_1.texture_count);

        let textures = parse_slice::<TextureRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("textures out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(textures
            .iter()
            .enumerate()
            .map(move |(i, texture)| TextureRef {
                texture,
                offset: offset + i * size_of::<TextureRecord>(),
                bytes,
            }))
    }

    /// # Errors
    ///
    /// Returns `Err` if the texture path table is out of bounds or a path is
    /// not valid utf8.
    pub fn texture_paths(&self) -> Result<Vec<&'a str>> {
        let (offset, count) = self.table(self.header_1.texture_dir_offset, self.header_1.texture_dir_count);

        let path_offsets: &[i32] = parse_slice(self.bytes, offset, count)
            .ok_or_else(|| corrupted("texture paths out of bounds or misaligned"))?;

        path_offsets
            .iter()
            .map(|&path_offset| {
                if path_offset <= 0 {
                    Ok("")
                } else {
                    string_at(
                        self.bytes,
                        path_offset as usize,
                        "texture path out of bounds",
                    )
                }
            })
            .try_collect()
    }

    /// Skin families as rows of texture indexes, one row per family.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the skin table is out of bounds.
    pub fn skin_families(&self) -> Result<Vec<Vec<i16>>> {
        let (offset, family_count) = self.table(self.header_1.skin_family_offset, self.header_1.skin_family_count);
        let reference_count: usize = self
            .header_1
            .skin_reference_count
            .try_into()
            .map_err(|_| corrupted("skin reference count is negative"))?;

        let entry_count = family_count
            .checked_mul(reference_count)
            .ok_or_else(|| corrupted("skin table size overflows"))?;
        let entries: &[i16] = parse_slice(self.bytes, offset, entry_count)
            .ok_or_else(|| corrupted("skin families out of bounds or misaligned"))?;

        Ok(entries
            .chunks_exact(reference_count.max(1))
            .map(<[i16]>::to_vec)
            .collect())
    }

    /// # Errors
    ///
    /// Returns `Err` if the body part table is out of bounds.
    pub fn iter_body_parts(
        &self,
    ) -> Result<impl Iterator<Item = BodyPartRef<'a>> + ExactSizeIterator> {
        let (offset, count) = self.table(self.header_1.body_part_offset, self.header_1.body_part_count);

        let body_parts = parse_slice::<BodyPartRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("body parts out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(body_parts
            .iter()
            .enumerate()
            .map(move |(i, body_part)| BodyPartRef {
                body_part,
                offset: offset + i * size_of::<BodyPartRecord>(),
                bytes,
            }))
    }

    /// # Errors
    ///
    /// Returns `Err` if the flex descriptor table is out of bounds.
    pub fn flex_desc_names(&self) -> Result<Vec<&'a str>> {
        let (offset, count) = self.table(self.header_1.flex_desc_offset, self.header_1.flex_desc_count);

        let descs = parse_slice::<FlexDescRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("flex descriptors out of bounds or misaligned"))?;

        descs
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                let record_start = offset + i * size_of::<FlexDescRecord>();
                if desc.name_offset <= 0 {
                    return Ok("");
                }
                relative_offset(record_start, desc.name_offset, self.bytes.len())
                    .ok_or_else(|| corrupted("flex descriptor name out of bounds"))
                    .and_then(|at| {
                        string_at(self.bytes, at, "flex descriptor name out of bounds")
                    })
            })
            .try_collect()
    }

    /// # Errors
    ///
    /// Returns `Err` if the flex controller table is out of bounds.
    pub fn iter_flex_controllers(
        &self,
    ) -> Result<impl Iterator<Item = FlexControllerRef<'a>>> {
        let (offset, count) = self.table(self.header_1.flex_controller_offset, self.header_1.flex_controller_count);

        let controllers = parse_slice::<FlexControllerRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("flex controllers out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(controllers
            .iter()
            .enumerate()
            .map(move |(i, controller)| FlexControllerRef {
                controller,
                offset: offset + i * size_of::<FlexControllerRecord>(),
                bytes,
            }))
    }

    /// # Errors
    ///
    /// Returns `Err` if the flex rule table is out of bounds.
    pub fn iter_flex_rules(&self) -> Result<impl Iterator<Item = FlexRuleRef<'a>>> {
        let (offset, count) = self.table(self.header_1.flex_rules_offset, self.header_1.flex_rules_count);

        let rules = parse_slice::<FlexRuleRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("flex rules out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(rules.iter().enumerate().map(move |(i, rule)| FlexRuleRef {
            rule,
            offset: offset + i * size_of::<FlexRuleRecord>(),
            bytes,
        }))
    }

    /// # Errors
    ///
    /// Returns `Err` if the animation descriptor table is out of bounds.
    pub fn iter_animation_descs(
        &self,
    ) -> Result<impl Iterator<Item = AnimationDescRef<'a>>> {
        let (offset, count) = self.table(self.header_1.local_anim_offset, self.header_1.local_anim_count);

        let descs = parse_slice::<AnimationDescRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("animation descriptors out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(descs.iter().enumerate().map(move |(i, desc)| {
            AnimationDescRef {
                desc,
                offset: offset + i * size_of::<AnimationDescRecord>(),
                bytes,
            }
        }))
    }

    /// # Errors
    ///
    /// Returns `Err` if the sequence descriptor table is out of bounds.
    pub fn iter_sequence_descs(
        &self,
    ) -> Result<impl Iterator<Item = SequenceDescRef<'a>>> {
        let (offset, count) = self.table(self.header_1.local_seq_offset, self.header_1.local_seq_count);

        let descs = parse_slice::<SequenceDescRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("sequence descriptors out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(descs.iter().enumerate().map(move |(i, desc)| {
            SequenceDescRef {
                desc,
                offset: offset + i * size_of::<SequenceDescRecord>(),
                bytes,
            }
        }))
    }

    /// # Errors
    ///
    /// Returns `Err` if the animation block table is out of bounds.
    pub fn animation_blocks(&self) -> Result<Vec<AnimBlock>> {
        let (offset, count) = self.table(self.header_1.anim_block_offset, self.header_1.anim_block_count);

        let blocks = parse_slice::<AnimationBlockRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("animation blocks out of bounds or misaligned"))?;

        Ok(blocks
            .iter()
            .map(|block| AnimBlock {
                data_start: block.data_start,
                data_end: block.data_end,
            })
            .collect())
    }

    /// The stored name of the external animation block file, if any.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn animation_block_name(&self) -> Result<Option<&'a str>> {
        if self.header_1.anim_block_name_offset <= 0 {
            return Ok(None);
        }

        string_at(
            self.bytes,
            self.header_1.anim_block_name_offset as usize,
            "animation block name out of bounds",
        )
        .map(Some)
    }
}

/// Layout-dependent facts about one candidate bone record size. Everything
/// up to the pose-to-bone matrix is layout-independent; the trailing fields
/// moved around as the format evolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoneLayout {
    stride: usize,
    flags_offset: Option<usize>,
    physics_bone_offset: Option<usize>,
    surface_prop_offset: Option<usize>,
}

static BONE_LAYOUTS: [BoneLayout; 8] = [
    BoneLayout {
        stride: 244,
        flags_offset: Some(160),
        physics_bone_offset: Some(172),
        surface_prop_offset: Some(176),
    },
    BoneLayout {
        stride: 216,
        flags_offset: Some(160),
        physics_bone_offset: Some(172),
        surface_prop_offset: Some(176),
    },
    BoneLayout {
        stride: 200,
        flags_offset: Some(160),
        physics_bone_offset: Some(172),
        surface_prop_offset: None,
    },
    BoneLayout {
        stride: 184,
        flags_offset: Some(160),
        physics_bone_offset: Some(172),
        surface_prop_offset: None,
    },
    BoneLayout {
        stride: 176,
        flags_offset: Some(160),
        physics_bone_offset: Some(172),
        surface_prop_offset: None,
    },
    BoneLayout {
        stride: 160,
        flags_offset: Some(160),
        physics_bone_offset: None,
        surface_prop_offset: None,
    },
    BoneLayout {
        stride: 152,
        flags_offset: Some(144),
        physics_bone_offset: None,
        surface_prop_offset: None,
    },
    BoneLayout {
        stride: 144,
        flags_offset: None,
        physics_bone_offset: None,
        surface_prop_offset: None,
    },
];

const BONE_SAMPLE_LIMIT: usize = 32;
const BONE_NAME_LIMIT: usize = 200;

fn is_plausible_bone_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= BONE_NAME_LIMIT
        && name.iter().all(|&b| !b.is_ascii_control())
}

/// Tries each candidate layout in descending stride order and returns the
/// first whose sampled records all look like bones: parent index in range,
/// name offset resolving to plausible text within the source.
fn infer_bone_layout(bytes: &[u8], offset: usize, count: usize) -> Option<&'static BoneLayout> {
    BONE_LAYOUTS.iter().find(|layout| {
        let in_bounds = count
            .checked_mul(layout.stride)
            .and_then(|table_len| offset.checked_add(table_len))
            .is_some_and(|end| end <= bytes.len());
        if !in_bounds {
            return false;
        }

        (0..count.min(BONE_SAMPLE_LIMIT)).all(|i| {
            let record_start = offset + i * layout.stride;
            let Some(record) = parse::<BoneRecord>(bytes, record_start) else {
                return false;
            };

            if record.parent_bone_index < -1 || record.parent_bone_index >= count as i32 {
                return false;
            }

            if record.name_offset <= 0 {
                return false;
            }

            let Some(name_start) =
                relative_offset(record_start, record.name_offset, bytes.len())
            else {
                return false;
            };

            bytes
                .get(name_start..)
                .and_then(null_terminated_prefix)
                .is_some_and(is_plausible_bone_name)
        })
    })
}

#[derive(Debug, Clone, Copy)]
struct BonesRef<'a> {
    layout: &'static BoneLayout,
    count: usize,
    offset: usize,
    bytes: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct BoneRef<'a> {
    record: &'a BoneRecord,
    layout: &'static BoneLayout,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> BoneRef<'a> {
    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn name(&self) -> Result<&'a str> {
        let offset = relative_offset(self.offset, self.record.name_offset, self.bytes.len())
            .ok_or_else(|| corrupted("bone name out of bounds"))?;
        string_at(self.bytes, offset, "bone name out of bounds")
    }

    #[must_use]
    pub fn flags(&self) -> i32 {
        self.layout
            .flags_offset
            .and_then(|at| i32_at(self.bytes, self.offset + at))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn physics_bone_index(&self) -> i32 {
        self.layout
            .physics_bone_offset
            .and_then(|at| i32_at(self.bytes, self.offset + at))
            .unwrap_or(-1)
    }

    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn surface_prop(&self) -> Result<Option<&'a str>> {
        let Some(at) = self.layout.surface_prop_offset else {
            return Ok(None);
        };
        let Some(name_offset) = i32_at(self.bytes, self.offset + at) else {
            return Ok(None);
        };
        if name_offset <= 0 {
            return Ok(None);
        }

        let offset = relative_offset(self.offset, name_offset, self.bytes.len())
            .ok_or_else(|| corrupted("bone surface prop out of bounds"))?;
        string_at(self.bytes, offset, "bone surface prop out of bounds").map(Some)
    }
}

impl Deref for BoneRef<'_> {
    type Target = BoneRecord;

    fn deref(&self) -> &Self::Target {
        self.record
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextureRef<'a> {
    texture: &'a TextureRecord,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> TextureRef<'a> {
    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn name(&self) -> Result<&'a str> {
        if self.texture.name_offset <= 0 {
            return Ok("");
        }
        let offset = relative_offset(self.offset, self.texture.name_offset, self.bytes.len())
            .ok_or_else(|| corrupted("texture name out of bounds"))?;
        string_at(self.bytes, offset, "texture name out of bounds")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlexControllerRef<'a> {
    controller: &'a FlexControllerRecord,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> FlexControllerRef<'a> {
    fn name_field(&self, name_offset: i32, error: &'static str) -> Result<&'a str> {
        if name_offset <= 0 {
            return Ok("");
        }
        let offset = relative_offset(self.offset, name_offset, self.bytes.len())
            .ok_or_else(|| corrupted(error))?;
        string_at(self.bytes, offset, error)
    }

    /// # Errors
    ///
    /// Returns `Err` if the type name is out of bounds or not valid utf8.
    pub fn type_name(&self) -> Result<&'a str> {
        self.name_field(
            self.controller.type_offset,
            "flex controller type out of bounds",
        )
    }

    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn name(&self) -> Result<&'a str> {
        self.name_field(
            self.controller.name_offset,
            "flex controller name out of bounds",
        )
    }

    #[must_use]
    pub fn local_to_global(&self) -> i32 {
        self.controller.local_to_global
    }

    #[must_use]
    pub fn range(&self) -> (f32, f32) {
        (self.controller.min, self.controller.max)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlexRuleRef<'a> {
    rule: &'a FlexRuleRecord,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> FlexRuleRef<'a> {
    #[must_use]
    pub fn flex_desc_index(&self) -> i32 {
        self.rule.flex_desc_index
    }

    /// # Errors
    ///
    /// Returns `Err` if the op table is out of bounds.
    pub fn ops(&self) -> Result<&'a [FlexOpRecord]> {
        if self.rule.op_count <= 0 || self.rule.op_offset <= 0 {
            return Ok(&[]);
        }

        let offset = relative_offset(self.offset, self.rule.op_offset, self.bytes.len())
            .ok_or_else(|| corrupted("flex rule ops out of bounds"))?;
        let count: usize = self
            .rule
            .op_count
            .try_into()
            .map_err(|_| corrupted("flex rule op count is negative"))?;

        // Clamp like the reference tool instead of rejecting: rules written
        // past the end of the source keep their in-bounds prefix.
        let available = (self.bytes.len() - offset) / size_of::<FlexOpRecord>();
        parse_slice(self.bytes, offset, count.min(available))
            .ok_or_else(|| corrupted("flex rule ops out of bounds or misaligned"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BodyPartRef<'a> {
    body_part: &'a BodyPartRecord,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> BodyPartRef<'a> {
    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn name(&self) -> Result<&'a str> {
        if self.body_part.name_offset <= 0 {
            return Ok("");
        }
        let offset = relative_offset(self.offset, self.body_part.name_offset, self.bytes.len())
            .ok_or_else(|| corrupted("body part name out of bounds"))?;
        string_at(self.bytes, offset, "body part name out of bounds")
    }

    /// # Errors
    ///
    /// Returns `Err` if the model table is out of bounds.
    pub fn iter_models(
        &self,
    ) -> Result<impl Iterator<Item = SubModelRef<'a>> + ExactSizeIterator> {
        let offset =
            relative_offset(self.offset, self.body_part.model_offset, self.bytes.len())
                .ok_or_else(|| corrupted("body part models out of bounds"))?;
        let count: usize = self
            .body_part
            .model_count
            .try_into()
            .map_err(|_| corrupted("body part model count is negative"))?;

        let models = parse_slice::<SubModelRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("body part models out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(models.iter().enumerate().map(move |(i, model)| SubModelRef {
            model,
            offset: offset + i * size_of::<SubModelRecord>(),
            bytes,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubModelRef<'a> {
    model: &'a SubModelRecord,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> SubModelRef<'a> {
    /// # Errors
    ///
    /// Returns `Err` if the name is not valid utf8.
    pub fn name(&self) -> Result<&'a str> {
        str::from_utf8(
            null_terminated_prefix(&self.model.name)
                .ok_or_else(|| corrupted("eof reading model name"))?,
        )
        .map_err(|_| corrupted("model name is not valid utf8"))
    }

    /// # Errors
    ///
    /// Returns `Err` if the mesh table is out of bounds.
    pub fn iter_meshes(
        &self,
    ) -> Result<impl Iterator<Item = MeshRef<'a>> + ExactSizeIterator> {
        let offset = relative_offset(self.offset, self.model.mesh_offset, self.bytes.len())
            .ok_or_else(|| corrupted("model meshes out of bounds"))?;
        let count: usize = self
            .model
            .mesh_count
            .try_into()
            .map_err(|_| corrupted("model mesh count is negative"))?;

        let meshes = parse_slice::<MeshRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("model meshes out of bounds or misaligned"))?;

        let bytes = self.bytes;
        Ok(meshes.iter().enumerate().map(move |(i, mesh)| MeshRef {
            mesh,
            offset: offset + i * size_of::<MeshRecord>(),
            bytes,
        }))
    }
}

impl Deref for SubModelRef<'_> {
    type Target = SubModelRecord;

    fn deref(&self) -> &Self::Target {
        self.model
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MeshRef<'a> {
    mesh: &'a MeshRecord,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> MeshRef<'a> {
    /// # Errors
    ///
    /// Returns `Err` if the flex table is out of bounds.
    pub fn flexes(&self) -> Result<Vec<Flex>> {
        if self.mesh.flex_count <= 0 || self.mesh.flex_offset <= 0 {
            return Ok(Vec::new());
        }

        let offset = relative_offset(self.offset, self.mesh.flex_offset, self.bytes.len())
            .ok_or_else(|| corrupted("mesh flexes out of bounds"))?;
        let count: usize = self
            .mesh
            .flex_count
            .try_into()
            .map_err(|_| corrupted("mesh flex count is negative"))?;

        let available = (self.bytes.len() - offset) / size_of::<FlexRecord>();
        let flexes = parse_slice::<FlexRecord>(self.bytes, offset, count.min(available))
            .ok_or_else(|| corrupted("mesh flexes out of bounds or misaligned"))?;

        Ok(flexes
            .iter()
            .enumerate()
            .map(|(i, flex)| {
                let record_start = offset + i * size_of::<FlexRecord>();
                Flex {
                    flex_desc_index: flex.flex_desc_index,
                    targets: [flex.target_0, flex.target_1, flex.target_2, flex.target_3],
                    flex_desc_partner_index: flex.flex_desc_partner_index,
                    vert_anim_type: flex.vert_anim_type,
                    vert_anims: read_vert_anims(self.bytes, record_start, flex),
                }
            })
            .collect())
    }
}

impl Deref for MeshRef<'_> {
    type Target = MeshRecord;

    fn deref(&self) -> &Self::Target {
        self.mesh
    }
}

fn read_vert_anims(bytes: &[u8], flex_start: usize, flex: &FlexRecord) -> Vec<VertAnim> {
    if flex.vert_count <= 0 || flex.vert_offset <= 0 {
        return Vec::new();
    }

    let Some(offset) = relative_offset(flex_start, flex.vert_offset, bytes.len()) else {
        return Vec::new();
    };

    // Wrinkle-mapped flexes carry one extra delta per vertex.
    let stride = if flex.vert_anim_type == 1 { 18 } else { 16 };
    let count = (flex.vert_count as usize).min((bytes.len() - offset) / stride);

    (0..count)
        .filter_map(|i| {
            let at = offset + i * stride;
            Some(VertAnim {
                index: u16_at(bytes, at)?,
                speed: u8_at(bytes, at + 2)?,
                side: u8_at(bytes, at + 3)?,
                delta: [
                    u16_at(bytes, at + 4)?,
                    u16_at(bytes, at + 6)?,
                    u16_at(bytes, at + 8)?,
                ],
                normal_delta: [
                    u16_at(bytes, at + 10)?,
                    u16_at(bytes, at + 12)?,
                    u16_at(bytes, at + 14)?,
                ],
                wrinkle_delta: if flex.vert_anim_type == 1 {
                    i16_at(bytes, at + 16)
                } else {
                    None
                },
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct AnimationDescRef<'a> {
    desc: &'a AnimationDescRecord,
    offset: usize,
    bytes: &'a [u8],
}

const MOVEMENT_COUNT_LIMIT: usize = 16_384;

impl<'a> AnimationDescRef<'a> {
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn flags(&self) -> AnimationDescFlags {
        AnimationDescFlags::from_bits_truncate(self.desc.flags)
    }

    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn name(&self) -> Result<String> {
        if self.desc.name_offset <= 0 {
            return Ok(String::new());
        }

        let offset = relative_offset(self.offset, self.desc.name_offset, self.bytes.len())
            .ok_or_else(|| corrupted("animation name out of bounds"))?;
        let name = string_at(self.bytes, offset, "animation name out of bounds")?;

        Ok(relocate_animation_name_prefix(name.trim()))
    }

    /// # Errors
    ///
    /// Returns `Err` if the movement table is out of bounds.
    pub fn movements(&self) -> Result<Vec<Movement>> {
        if self.desc.movement_count <= 0 || self.desc.movement_offset <= 0 {
            return Ok(Vec::new());
        }

        let count: usize = self
            .desc
            .movement_count
            .try_into()
            .map_err(|_| corrupted("movement count is negative"))?;
        if count > MOVEMENT_COUNT_LIMIT {
            return Err(corrupted("movement count is implausibly large"));
        }

        let offset = relative_offset(self.offset, self.desc.movement_offset, self.bytes.len())
            .ok_or_else(|| corrupted("movements out of bounds"))?;

        let movements = parse_slice::<MovementRecord>(self.bytes, offset, count)
            .ok_or_else(|| corrupted("movements out of bounds or misaligned"))?;

        Ok(movements
            .iter()
            .map(|movement| Movement {
                end_frame_index: movement.end_frame_index,
                motion_flags: movement.motion_flags,
                v0: movement.v0,
                v1: movement.v1,
                angle_degrees: movement.angle,
                vector: Vec3::from(movement.vector),
                position: Vec3::from(movement.position),
            })
            .collect())
    }
}

/// Animation names like `a_../run` keep their path but move the `a_` prefix
/// onto the file name, matching the reference tool's output naming.
fn relocate_animation_name_prefix(name: &str) -> String {
    let Some(rest) = name.strip_prefix("a_../").or_else(|| name.strip_prefix("a_..\\")) else {
        return name.to_owned();
    };

    let rest = rest.replace('\\', "/");
    match rest.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/a_{file}"),
        None => format!("a_{rest}"),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceDescRef<'a> {
    desc: &'a SequenceDescRecord,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> SequenceDescRef<'a> {
    #[must_use]
    pub fn flags(&self) -> i32 {
        self.desc.flags
    }

    #[must_use]
    pub fn blend_count(&self) -> i32 {
        self.desc.blend_count
    }

    #[must_use]
    pub fn group_size(&self) -> [i32; 2] {
        self.desc.group_size
    }

    /// # Errors
    ///
    /// Returns `Err` if the name is out of bounds or not valid utf8.
    pub fn name(&self) -> Result<&'a str> {
        if self.desc.name_offset <= 0 {
            return Ok("");
        }
        let offset = relative_offset(self.offset, self.desc.name_offset, self.bytes.len())
            .ok_or_else(|| corrupted("sequence name out of bounds"))?;
        string_at(self.bytes, offset, "sequence name out of bounds")
    }

    /// The blend grid of animation descriptor indexes, row-major by group
    /// size. Empty when the grid is absent or out of bounds.
    #[must_use]
    pub fn animation_desc_indexes(&self) -> Vec<i16> {
        let count = self.desc.group_size[0]
            .checked_mul(self.desc.group_size[1])
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or_default();
        if count == 0 || self.desc.anim_index_offset <= 0 {
            return Vec::new();
        }

        let Some(offset) =
            relative_offset(self.offset, self.desc.anim_index_offset, self.bytes.len())
        else {
            return Vec::new();
        };

        parse_slice::<i16>(self.bytes, offset, count)
            .map(<[i16]>::to_vec)
            .unwrap_or_default()
    }
}

// Owned snapshot types below. These are what downstream exporters consume;
// everything borrows from the reference layer above exactly once, during
// `Model::decode`.

#[derive(Debug, Clone)]
pub struct Bone {
    pub index: usize,
    pub name: String,
    pub surface_prop: Option<String>,
    pub parent_bone_index: i32,
    pub position: Vec3,
    pub quat: Quat,
    pub rotation: Vec3,
    pub position_scale: Vec3,
    pub rotation_scale: Vec3,
    pub pose_to_bone: [f32; 12],
    pub flags: i32,
    pub physics_bone_index: i32,
}

#[derive(Debug, Clone)]
pub struct Texture {
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct BodyPart {
    pub name: String,
    pub models: Vec<SubModel>,
}

#[derive(Debug, Clone)]
pub struct SubModel {
    pub name: String,
    pub vertex_count: i32,
    pub vertex_offset: i32,
    pub meshes: Vec<Mesh>,
}

#[derive(Debug, Clone)]
pub struct Mesh {
    pub material_index: i32,
    pub vertex_count: i32,
    pub vertex_index_start: i32,
    pub flexes: Vec<Flex>,
}

#[derive(Debug, Clone)]
pub struct Flex {
    pub flex_desc_index: i32,
    pub targets: [f32; 4],
    pub flex_desc_partner_index: i32,
    pub vert_anim_type: u8,
    pub vert_anims: Vec<VertAnim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertAnim {
    pub index: u16,
    pub speed: u8,
    pub side: u8,
    pub delta: [u16; 3],
    pub normal_delta: [u16; 3],
    pub wrinkle_delta: Option<i16>,
}

#[derive(Debug, Clone)]
pub struct FlexController {
    pub type_name: String,
    pub name: String,
    pub local_to_global: i32,
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone)]
pub struct FlexRule {
    pub flex_desc_index: i32,
    pub ops: Vec<FlexOp>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlexOp {
    pub op: i32,
    pub index: i32,
    pub value: f32,
}

#[derive(Debug, Clone)]
pub struct AnimationDesc {
    pub index: usize,
    /// Absolute byte offset of the descriptor record. Animation data and
    /// section table offsets are relative to this.
    pub offset_start: usize,
    pub name: String,
    pub fps: f32,
    pub flags: AnimationDescFlags,
    pub frame_count: i32,
    pub movements: Vec<Movement>,
    pub anim_block: i32,
    pub anim_offset: i32,
    pub section_offset: i32,
    pub section_frame_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Movement {
    pub end_frame_index: i32,
    pub motion_flags: i32,
    pub v0: f32,
    pub v1: f32,
    pub angle_degrees: f32,
    pub vector: Vec3,
    pub position: Vec3,
}

#[derive(Debug, Clone)]
pub struct SequenceDesc {
    pub index: usize,
    pub name: String,
    pub flags: i32,
    pub blend_count: i32,
    pub group_size: [i32; 2],
    pub anim_desc_indexes: Vec<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimBlock {
    pub data_start: i32,
    pub data_end: i32,
}

/// Byte ranges of companion data embedded directly in v53 model files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddedSections {
    pub vtx_offset: i32,
    pub vtx_size: i32,
    pub vvd_offset: i32,
    pub vvd_size: i32,
    pub vvc_offset: i32,
    pub vvc_size: i32,
    pub phy_offset: i32,
    pub phy_size: i32,
}

/// Immutable snapshot of one decoded model file.
#[derive(Debug, Clone)]
pub struct Model {
    pub version: i32,
    pub checksum: i32,
    pub name: String,
    pub flags: HeaderFlags,
    pub bones: Vec<Bone>,
    pub texture_paths: Vec<String>,
    pub textures: Vec<Texture>,
    pub skin_families: Vec<Vec<i16>>,
    pub body_parts: Vec<BodyPart>,
    pub flex_desc_names: Vec<String>,
    pub flex_controllers: Vec<FlexController>,
    pub flex_rules: Vec<FlexRule>,
    pub animations: Vec<AnimationDesc>,
    pub sequences: Vec<SequenceDesc>,
    pub anim_blocks: Vec<AnimBlock>,
    pub anim_block_name: Option<String>,
    pub embedded_sections: Option<EmbeddedSections>,
}

fn or_empty<T: Default>(result: Result<T>, what: &str) -> T {
    result.unwrap_or_else(|err| {
        warn!("decoding {what} failed, continuing without: {err}");
        T::default()
    })
}

impl Model {
    /// Decodes a full model snapshot.
    ///
    /// Signature and version problems are fatal; every other structural
    /// problem degrades the affected sub-table to empty, because partially
    /// invalid third-party files are common and the valid parts are still
    /// worth extracting.
    ///
    /// # Errors
    ///
    /// Returns `Err` for a bad signature or an unsupported version.
    pub fn decode(mdl: &Mdl, version_override: Option<i32>) -> Result<Self> {
        mdl.check_signature()?;
        let version = mdl.check_version(version_override)?;

        let header = match mdl.header(version) {
            Ok(header) => header,
            Err(err) => {
                warn!("decoding header failed, producing an empty model: {err}");
                let checksum = i32_at(mdl.bytes(), 8).unwrap_or_default();
                return Ok(Self::empty(version, checksum));
            }
        };

        let bones = or_empty(decode_bones(&header), "bone table");
        let texture_paths = or_empty(
            header
                .texture_paths()
                .map(|paths| paths.into_iter().map(normalize_path).collect()),
            "texture paths",
        );
        let textures = or_empty(decode_textures(&header), "texture table");
        let skin_families = or_empty(header.skin_families(), "skin families");
        let body_parts = or_empty(decode_body_parts(&header), "body parts");
        let flex_desc_names = or_empty(
            header
                .flex_desc_names()
                .map(|names| names.into_iter().map(|name| name.trim().to_owned()).collect()),
            "flex descriptors",
        );
        let flex_controllers = or_empty(decode_flex_controllers(&header), "flex controllers");
        let flex_rules = or_empty(decode_flex_rules(&header), "flex rules");
        let animations = or_empty(decode_animation_descs(&header), "animation descriptors");
        let sequences = or_empty(decode_sequence_descs(&header), "sequence descriptors");
        let anim_blocks = or_empty(header.animation_blocks(), "animation blocks");
        let anim_block_name = or_empty(header.animation_block_name(), "animation block name")
            .map(str::to_owned);

        let embedded_sections = if version == 53 {
            find_embedded_sections(mdl.bytes())
        } else {
            None
        };

        Ok(Self {
            version,
            checksum: header.checksum(),
            name: header.name().unwrap_or_default().trim().to_owned(),
            flags: header.flags(),
            bones,
            texture_paths,
            textures,
            skin_families,
            body_parts,
            flex_desc_names,
            flex_controllers,
            flex_rules,
            animations,
            sequences,
            anim_blocks,
            anim_block_name,
            embedded_sections,
        })
    }

    fn empty(version: i32, checksum: i32) -> Self {
        Self {
            version,
            checksum,
            name: String::new(),
            flags: HeaderFlags::empty(),
            bones: Vec::new(),
            texture_paths: Vec::new(),
            textures: Vec::new(),
            skin_families: Vec::new(),
            body_parts: Vec::new(),
            flex_desc_names: Vec::new(),
            flex_controllers: Vec::new(),
            flex_rules: Vec::new(),
            animations: Vec::new(),
            sequences: Vec::new(),
            anim_blocks: Vec::new(),
            anim_block_name: None,
            embedded_sections: None,
        }
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim().to_owned()
}

fn decode_bones(header: &HeaderRef) -> Result<Vec<Bone>> {
    Ok(header
        .iter_bones()?
        .enumerate()
        .map(|(index, bone)| Bone {
            index,
            name: bone.name().unwrap_or_default().to_owned(),
            surface_prop: bone
                .surface_prop()
                .unwrap_or_default()
                .map(str::to_owned),
            parent_bone_index: bone.parent_bone_index,
            position: Vec3::from(bone.position),
            quat: Quat::from_xyzw(bone.quat[0], bone.quat[1], bone.quat[2], bone.quat[3]),
            rotation: Vec3::from(bone.rotation),
            position_scale: Vec3::from(bone.position_scale),
            rotation_scale: Vec3::from(bone.rotation_scale),
            pose_to_bone: bone.pose_to_bone,
            flags: bone.flags(),
            physics_bone_index: bone.physics_bone_index(),
        })
        .collect())
}

fn decode_textures(header: &HeaderRef) -> Result<Vec<Texture>> {
    Ok(header
        .iter_textures()?
        .enumerate()
        .map(|(index, texture)| Texture {
            index,
            name: normalize_path(texture.name().unwrap_or_default()),
        })
        .collect())
}

fn decode_body_parts(header: &HeaderRef) -> Result<Vec<BodyPart>> {
    Ok(header
        .iter_body_parts()?
        .map(|body_part| BodyPart {
            name: body_part.name().unwrap_or_default().trim().to_owned(),
            models: or_empty(decode_sub_models(&body_part), "body part models"),
        })
        .collect())
}

fn decode_sub_models(body_part: &BodyPartRef) -> Result<Vec<SubModel>> {
    Ok(body_part
        .iter_models()?
        .map(|model| SubModel {
            name: model.name().unwrap_or_default().trim().to_owned(),
            vertex_count: model.vertex_count,
            vertex_offset: model.vertex_offset,
            meshes: or_empty(decode_meshes(&model), "model meshes"),
        })
        .collect())
}

fn decode_meshes(model: &SubModelRef) -> Result<Vec<Mesh>> {
    Ok(model
        .iter_meshes()?
        .map(|mesh| Mesh {
            material_index: mesh.material_index,
            vertex_count: mesh.vertex_count,
            vertex_index_start: mesh.vertex_index_start,
            flexes: or_empty(mesh.flexes(), "mesh flexes"),
        })
        .collect())
}

fn decode_flex_controllers(header: &HeaderRef) -> Result<Vec<FlexController>> {
    Ok(header
        .iter_flex_controllers()?
        .map(|controller| {
            let (min, max) = controller.range();
            FlexController {
                type_name: controller.type_name().unwrap_or_default().trim().to_owned(),
                name: controller.name().unwrap_or_default().trim().to_owned(),
                local_to_global: controller.local_to_global(),
                min,
                max,
            }
        })
        .collect())
}

fn decode_flex_rules(header: &HeaderRef) -> Result<Vec<FlexRule>> {
    Ok(header
        .iter_flex_rules()?
        .map(|rule| FlexRule {
            flex_desc_index: rule.flex_desc_index(),
            ops: or_empty(rule.ops().map(convert_flex_ops), "flex rule ops"),
        })
        .collect())
}

fn convert_flex_ops(ops: &[FlexOpRecord]) -> Vec<FlexOp> {
    ops.iter()
        .map(|op| FlexOp {
            op: op.op,
            // The operand is an index or a float depending on the op; keep
            // both readings like the reference tool.
            index: op.value as i32,
            value: f32::from_bits(op.value),
        })
        .collect()
}

fn decode_animation_descs(header: &HeaderRef) -> Result<Vec<AnimationDesc>> {
    Ok(header
        .iter_animation_descs()?
        .enumerate()
        .map(|(index, desc)| AnimationDesc {
            index,
            offset_start: desc.offset,
            name: desc.name().unwrap_or_default(),
            fps: desc.desc.fps,
            flags: desc.flags(),
            frame_count: desc.desc.frame_count,
            movements: or_empty(desc.movements(), "animation movements"),
            anim_block: desc.desc.anim_block,
            anim_offset: desc.desc.anim_offset,
            section_offset: desc.desc.section_offset,
            section_frame_count: desc.desc.section_frame_count,
        })
        .collect())
}

fn decode_sequence_descs(header: &HeaderRef) -> Result<Vec<SequenceDesc>> {
    Ok(header
        .iter_sequence_descs()?
        .enumerate()
        .map(|(index, desc)| SequenceDesc {
            index,
            name: desc.name().unwrap_or_default().trim().to_owned(),
            flags: desc.flags(),
            blend_count: desc.blend_count(),
            group_size: desc.group_size(),
            anim_desc_indexes: desc.animation_desc_indexes(),
        })
        .collect())
}

// v53 embeds the companion vertex/strip/physics data inside the model file
// itself. The block of offset/size pairs sits at a slightly variable header
// position, so scan the known window and validate each candidate.

const EMBEDDED_SCAN_START: usize = 0x180;
const EMBEDDED_SCAN_END: usize = 0x1c0;

fn find_embedded_sections(bytes: &[u8]) -> Option<EmbeddedSections> {
    let len = bytes.len();

    for offset in (EMBEDDED_SCAN_START..=EMBEDDED_SCAN_END).step_by(4) {
        let vtx_offset = i32_at(bytes, offset)?;
        let vvd_offset = i32_at(bytes, offset + 4)?;
        let vvc_offset = i32_at(bytes, offset + 8)?;
        let mut phy_offset = i32_at(bytes, offset + 12)?;
        let vtx_size = i32_at(bytes, offset + 16)?;
        let vvd_size = i32_at(bytes, offset + 20)?;
        let vvc_size = i32_at(bytes, offset + 24)?;
        let mut phy_size = i32_at(bytes, offset + 28)?;

        if !is_plausible_embedded_range(vtx_offset, vtx_size, len, false)
            || !is_plausible_embedded_range(vvd_offset, vvd_size, len, false)
            || !is_plausible_embedded_range(vvc_offset, vvc_size, len, true)
            || !is_plausible_embedded_range(phy_offset, phy_size, len, true)
        {
            continue;
        }

        if bytes.get(vvd_offset as usize..vvd_offset as usize + 4) != Some(b"IDSV") {
            continue;
        }

        if !is_plausible_embedded_vtx(bytes, vtx_offset as usize, vtx_size) {
            continue;
        }

        if phy_offset > 0 && !is_plausible_embedded_phy(bytes, phy_offset as usize, phy_size) {
            // Some files pack physics data in a layout that is not a
            // standalone file; keep the vertex data usable regardless.
            phy_offset = 0;
            phy_size = 0;
        }

        return Some(EmbeddedSections {
            vtx_offset,
            vtx_size,
            vvd_offset,
            vvd_size,
            vvc_offset,
            vvc_size,
            phy_offset,
            phy_size,
        });
    }

    None
}

fn is_plausible_embedded_range(offset: i32, size: i32, len: usize, allow_zero: bool) -> bool {
    if offset == 0 && size == 0 && allow_zero {
        return true;
    }
    if offset <= 0 || size <= 0 {
        return false;
    }
    let (offset, size) = (offset as usize, size as usize);
    offset < len && offset.checked_add(size).is_some_and(|end| end <= len)
}

fn is_plausible_embedded_vtx(bytes: &[u8], offset: usize, size: i32) -> bool {
    if size < 0x24 {
        return false;
    }

    let Some(version) = i32_at(bytes, offset) else {
        return false;
    };
    if !(5..=20).contains(&version) {
        return false;
    }

    let vertex_cache_size = i32_at(bytes, offset + 4).unwrap_or_default();
    if vertex_cache_size <= 0 {
        return false;
    }

    let max_bones_per_vertex = i32_at(bytes, offset + 12).unwrap_or_default();
    if !(1..=1024).contains(&max_bones_per_vertex) {
        return false;
    }

    let lod_count = i32_at(bytes, offset + 20).unwrap_or(-1);
    if !(0..=32).contains(&lod_count) {
        return false;
    }

    let body_part_count = i32_at(bytes, offset + 28).unwrap_or(-1);
    let body_part_offset = i32_at(bytes, offset + 32).unwrap_or_default();
    if !(0..=4096).contains(&body_part_count) {
        return false;
    }
    if body_part_count > 0 && (body_part_offset <= 0 || body_part_offset >= size) {
        return false;
    }

    true
}

fn is_plausible_embedded_phy(bytes: &[u8], offset: usize, size: i32) -> bool {
    if size < 16 {
        return false;
    }

    let Some(header_size) = i32_at(bytes, offset) else {
        return false;
    };
    if header_size < 16 || header_size > size {
        return false;
    }

    let solid_count = i32_at(bytes, offset + 8).unwrap_or(-1);
    if !(0..=4096).contains(&solid_count) {
        return false;
    }

    if solid_count > 0 {
        let solids_start = offset + header_size as usize;
        let solids_end = offset + size as usize;
        if solids_start + 4 > solids_end {
            return false;
        }
        let Some(first_solid_size) = i32_at(bytes, solids_start) else {
            return false;
        };
        if first_solid_size < 0
            || solids_start + 4 + first_solid_size as usize > solids_end
        {
            return false;
        }
    }

    true
}
