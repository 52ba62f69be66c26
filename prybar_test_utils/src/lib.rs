//! Helpers for building synthetic little-endian binary fixtures in tests.
//!
//! Compiled model files are little-endian throughout, so every writer here
//! commits to little-endian explicitly instead of relying on the host.

/// Incrementally builds a little-endian byte buffer with random-access
/// patching, mirroring how the on-disk format chains records together with
/// offsets that are only known after the referenced data has been laid out.
#[derive(Debug, Default, Clone)]
pub struct BinaryBuilder {
    bytes: Vec<u8>,
}

impl BinaryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.bytes.push(value as u8);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Writes `value` as a null-terminated string.
    pub fn str_z(&mut self, value: &str) -> &mut Self {
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self
    }

    /// Pads with `fill` up to `offset`. Panics if the buffer is already past
    /// `offset`, since that means the fixture layout is wrong.
    pub fn pad_to(&mut self, offset: usize, fill: u8) -> &mut Self {
        assert!(
            self.bytes.len() <= offset,
            "fixture layout error: already at {}, cannot pad to {offset}",
            self.bytes.len()
        );
        self.bytes.resize(offset, fill);
        self
    }

    /// Reserves space for an i32 to be patched later, returning its offset.
    pub fn reserve_i32(&mut self) -> usize {
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(&0_i32.to_le_bytes());
        offset
    }

    /// Patches a previously written or reserved i32.
    pub fn patch_i32(&mut self, offset: usize, value: i32) -> &mut Self {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self
    }
}

/// The header fields synthetic model fixtures care about. Everything not
/// listed here is written as zero.
#[derive(Debug, Clone)]
pub struct HeaderFields {
    pub version: i32,
    pub checksum: i32,
    pub name: String,
    pub flags: i32,
    pub bone_count: i32,
    pub bone_offset: i32,
    pub local_anim_count: i32,
    pub local_anim_offset: i32,
    pub local_seq_count: i32,
    pub local_seq_offset: i32,
    pub texture_count: i32,
    pub texture_offset: i32,
    pub texture_dir_count: i32,
    pub texture_dir_offset: i32,
    pub skin_reference_count: i32,
    pub skin_family_count: i32,
    pub skin_family_offset: i32,
    pub body_part_count: i32,
    pub body_part_offset: i32,
    pub flex_desc_count: i32,
    pub flex_desc_offset: i32,
    pub flex_controller_count: i32,
    pub flex_controller_offset: i32,
    pub flex_rules_count: i32,
    pub flex_rules_offset: i32,
    pub anim_block_name_offset: i32,
    pub anim_block_count: i32,
    pub anim_block_offset: i32,
}

impl Default for HeaderFields {
    fn default() -> Self {
        Self {
            version: 48,
            checksum: 0,
            name: "fixture".to_owned(),
            flags: 0,
            bone_count: 0,
            bone_offset: 0,
            local_anim_count: 0,
            local_anim_offset: 0,
            local_seq_count: 0,
            local_seq_offset: 0,
            texture_count: 0,
            texture_offset: 0,
            texture_dir_count: 0,
            texture_dir_offset: 0,
            skin_reference_count: 0,
            skin_family_count: 0,
            skin_family_offset: 0,
            body_part_count: 0,
            body_part_offset: 0,
            flex_desc_count: 0,
            flex_desc_offset: 0,
            flex_controller_count: 0,
            flex_controller_offset: 0,
            flex_rules_count: 0,
            flex_rules_offset: 0,
            anim_block_name_offset: 0,
            anim_block_count: 0,
            anim_block_offset: 0,
        }
    }
}

/// Byte length of the standard (non-v53) header layout.
pub const HEADER_LEN: usize = 400;

/// Writes a complete standard-layout model header at the start of `builder`.
/// The builder must be empty.
pub fn write_header(builder: &mut BinaryBuilder, fields: &HeaderFields) {
    assert!(builder.is_empty(), "header must be written first");

    builder.raw(b"IDST");
    builder.i32(fields.version);
    builder.i32(fields.checksum);

    let mut name = [0_u8; 64];
    let copied = fields.name.len().min(63);
    name[..copied].copy_from_slice(&fields.name.as_bytes()[..copied]);
    builder.raw(&name);

    builder.i32(0); // data length, patched by callers that care

    // eye/illum positions and the three bounding boxes
    for _ in 0..18 {
        builder.f32(0.0);
    }

    builder.i32(fields.flags);
    builder.i32(fields.bone_count);
    builder.i32(fields.bone_offset);
    builder.i32(0).i32(0); // bone controllers
    builder.i32(0).i32(0); // hitbox sets
    builder.i32(fields.local_anim_count);
    builder.i32(fields.local_anim_offset);
    builder.i32(fields.local_seq_count);
    builder.i32(fields.local_seq_offset);
    builder.i32(0).i32(0); // activity list version, events indexed
    builder.i32(fields.texture_count);
    builder.i32(fields.texture_offset);
    builder.i32(fields.texture_dir_count);
    builder.i32(fields.texture_dir_offset);
    builder.i32(fields.skin_reference_count);
    builder.i32(fields.skin_family_count);
    builder.i32(fields.skin_family_offset);
    builder.i32(fields.body_part_count);
    builder.i32(fields.body_part_offset);
    builder.i32(0).i32(0); // attachments
    builder.i32(0).i32(0).i32(0); // local nodes
    builder.i32(fields.flex_desc_count);
    builder.i32(fields.flex_desc_offset);
    builder.i32(fields.flex_controller_count);
    builder.i32(fields.flex_controller_offset);
    builder.i32(fields.flex_rules_count);
    builder.i32(fields.flex_rules_offset);
    builder.i32(0).i32(0); // ik chains
    builder.i32(0).i32(0); // mouths
    builder.i32(0).i32(0); // pose params
    builder.i32(0); // surface prop offset
    builder.i32(0).i32(0); // key values
    builder.i32(0).i32(0); // ik locks
    builder.f32(0.0); // mass
    builder.i32(0); // contents
    builder.i32(0).i32(0); // include models
    builder.i32(0); // virtual model
    builder.i32(fields.anim_block_name_offset);
    builder.i32(fields.anim_block_count);
    builder.i32(fields.anim_block_offset);
    builder.i32(0); // anim block model
    builder.i32(0); // bone table name offset
    builder.i32(0).i32(0); // vertex/offset bases
    builder.u8(0).u8(0).u8(0).u8(0); // lod bytes
    builder.i32(0); // zero frame cache
    builder.i32(0).i32(0); // flex controller ui
    builder.i32(0); // header 2 offset
    builder.i32(0); // unused

    assert_eq!(builder.len(), HEADER_LEN, "header layout drifted");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_fixed_length() {
        let mut builder = BinaryBuilder::new();
        write_header(&mut builder, &HeaderFields::default());
        assert_eq!(builder.len(), HEADER_LEN);
        assert_eq!(&builder.into_bytes()[..4], b"IDST");
    }

    #[test]
    fn patching_overwrites_reserved_slot() {
        let mut builder = BinaryBuilder::new();
        let slot = builder.reserve_i32();
        builder.i32(7);
        builder.patch_i32(slot, -2);

        let bytes = builder.into_bytes();
        assert_eq!(&bytes[..4], &(-2_i32).to_le_bytes());
        assert_eq!(&bytes[4..], &7_i32.to_le_bytes());
    }
}
