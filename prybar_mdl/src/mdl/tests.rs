#![allow(clippy::approx_constant)]

use std::f32::consts::FRAC_PI_2;
use std::path::Path;

use approx::assert_relative_eq;
use glam::{Quat, Vec3};

use prybar_test_utils::{write_header, BinaryBuilder, HeaderFields};

use super::anim::{
    animation_sections, apply_root_adjustments, bone_position, bone_rotation,
    extract_anim_value, piecewise_movement, read_frame_anim_section, read_rle_values,
    read_section_animations, section_for_frame, section_span, AnimationDecoder, BoneAnimFlags,
    DecodedSection, SectionSpan,
};
use super::*;

fn mdl_from(builder: BinaryBuilder) -> Mdl {
    Mdl::from_bytes(builder.into_bytes()).unwrap()
}

fn test_bone(index: usize, parent_bone_index: i32) -> Bone {
    Bone {
        index,
        name: format!("bone{index}"),
        surface_prop: None,
        parent_bone_index,
        position: Vec3::ZERO,
        quat: Quat::IDENTITY,
        rotation: Vec3::ZERO,
        position_scale: Vec3::ONE,
        rotation_scale: Vec3::ONE,
        pose_to_bone: [0.0; 12],
        flags: 0,
        physics_bone_index: -1,
    }
}

fn test_model(version: i32, bones: Vec<Bone>) -> Model {
    Model {
        version,
        checksum: 0,
        name: String::new(),
        flags: HeaderFlags::empty(),
        bones,
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

fn test_desc(frame_count: i32, section_frame_count: i32) -> AnimationDesc {
    AnimationDesc {
        index: 0,
        offset_start: 0,
        name: "idle".to_owned(),
        fps: 30.0,
        flags: AnimationDescFlags::empty(),
        frame_count,
        movements: Vec::new(),
        anim_block: 0,
        anim_offset: 0,
        section_offset: 0,
        section_frame_count,
    }
}

// Euler conversion.

/// Conversion must be identical to the reference decompiler for its
/// published vectors.
#[test]
fn quat_to_euler_matches_reference_tool() {
    assert_relative_eq!(
        quat_to_euler(Quat::from_xyzw(0.0, 0.999_998_57, 0.0, 0.001_691_454_9)),
        Vec3::new(3.141_592_7, 0.003_382_911_4, 3.141_592_7),
    );

    assert_relative_eq!(
        quat_to_euler(Quat::from_xyzw(0.0, 0.0, 0.707_105_3, 0.707_108_26)),
        Vec3::new(0.0, 0.0, 1.570_792_1)
    );
}

#[test]
fn quat_euler_conversion_consistency() {
    let original = Quat::from_xyzw(0.657_201, -0.104_246, 0.222_718, 0.712_472);
    let converted = euler_to_quat(quat_to_euler(original));

    assert_relative_eq!(original, converted, epsilon = 1e-5);
}

#[test]
fn gimbal_lock_pitch_keeps_z_zero() {
    let angles = quat_to_euler(euler_to_quat(Vec3::new(0.4, FRAC_PI_2, 0.0)));
    assert_relative_eq!(angles.z, 0.0);
    assert_relative_eq!(angles.y, FRAC_PI_2, epsilon = 1e-3);
}

// Compressed quaternion and vector codecs.

fn encode_quaternion48(q: Quat) -> (u16, u16, u16) {
    let x = ((q.x * 32768.0).round() as i32 + 32768).clamp(0, 65535) as u16;
    let y = ((q.y * 32768.0).round() as i32 + 32768).clamp(0, 65535) as u16;
    let z = ((q.z * 16384.0).round() as i32 + 16384).clamp(0, 32767) as u16;
    let zw = z | u16::from(q.w < 0.0) << 15;
    (x, y, zw)
}

fn encode_quaternion64(q: Quat) -> [u8; 8] {
    let x = ((q.x * 1_048_576.5).round() as i32 + 1_048_576).clamp(0, 0x1f_ffff) as u32;
    let y = ((q.y * 1_048_576.5).round() as i32 + 1_048_576).clamp(0, 0x1f_ffff) as u32;
    let z = ((q.z * 1_048_576.5).round() as i32 + 1_048_576).clamp(0, 0x1f_ffff) as u32;
    let sign = u8::from(q.w < 0.0);

    [
        (x & 0xff) as u8,
        ((x >> 8) & 0xff) as u8,
        (((x >> 16) & 0x1f) | ((y & 0x07) << 5)) as u8,
        ((y >> 3) & 0xff) as u8,
        ((y >> 11) & 0xff) as u8,
        (((y >> 19) & 0x03) | ((z & 0x3f) << 2)) as u8,
        ((z >> 6) & 0xff) as u8,
        (((z >> 14) & 0x7f) | (u32::from(sign) << 7)) as u8,
    ]
}

fn encode_quaternion48s(q: Quat) -> [u8; 6] {
    let components = [q.x, q.y, q.z, q.w];
    // The largest component is dropped and reconstructed, keeping the
    // stored ones inside the 15-bit range.
    let largest = (0..4)
        .max_by(|&a, &b| {
            components[a]
                .abs()
                .partial_cmp(&components[b].abs())
                .unwrap()
        })
        .unwrap();

    let (missing_index, stored, missing) = match largest {
        0 => (1_u8, [q.y, q.z, q.w], q.x),
        1 => (2, [q.z, q.w, q.x], q.y),
        2 => (3, [q.w, q.x, q.y], q.z),
        _ => (0, [q.x, q.y, q.z], q.w),
    };

    let quantize =
        |v: f32| (((v * 23168.0) + 16384.0).round() as i32).clamp(0, 0x7fff) as u16;
    let [a, b, c] = stored.map(quantize);

    [
        (a & 0xff) as u8,
        ((a >> 8) as u8) | ((missing_index & 0x02) << 6),
        (b & 0xff) as u8,
        ((b >> 8) as u8) | ((missing_index & 0x01) << 7),
        (c & 0xff) as u8,
        ((c >> 8) as u8) | (u8::from(missing < 0.0) << 7),
    ]
}

fn sample_quaternions() -> Vec<Quat> {
    [
        Quat::IDENTITY,
        Quat::from_xyzw(0.5, 0.5, 0.5, 0.5),
        Quat::from_xyzw(0.657_201, -0.104_246, 0.222_718, 0.712_472),
        Quat::from_xyzw(0.092, 0.432, -0.654, 0.612),
        Quat::from_xyzw(-0.3, 0.1, 0.2, -0.927),
        euler_to_quat(Vec3::new(0.3, -0.2, 0.4)),
    ]
    .into_iter()
    .map(Quat::normalize)
    .collect()
}

#[test]
fn quaternion48_roundtrip_within_quantization_error() {
    for q in sample_quaternions() {
        let (x, y, zw) = encode_quaternion48(q);
        let decoded = decode_quaternion48(x, y, zw);

        assert_relative_eq!(decoded.x, q.x, epsilon = 1.0 / 16384.0);
        assert_relative_eq!(decoded.y, q.y, epsilon = 1.0 / 16384.0);
        assert_relative_eq!(decoded.z, q.z, epsilon = 1.0 / 16384.0);
        assert_relative_eq!(decoded.w, q.w, epsilon = 1e-3);
        assert_relative_eq!(decoded.length(), 1.0, epsilon = 1e-4);
    }
}

#[test]
fn quaternion64_roundtrip_within_quantization_error() {
    for q in sample_quaternions() {
        let decoded = decode_quaternion64(encode_quaternion64(q));

        assert_relative_eq!(decoded.x, q.x, epsilon = 1e-5);
        assert_relative_eq!(decoded.y, q.y, epsilon = 1e-5);
        assert_relative_eq!(decoded.z, q.z, epsilon = 1e-5);
        assert_relative_eq!(decoded.w, q.w, epsilon = 1e-4);
        assert_relative_eq!(decoded.length(), 1.0, epsilon = 1e-4);
    }
}

#[test]
fn quaternion48s_roundtrip_within_quantization_error() {
    for q in sample_quaternions() {
        let decoded = decode_quaternion48s(encode_quaternion48s(q));

        assert_relative_eq!(decoded.x, q.x, epsilon = 1e-3);
        assert_relative_eq!(decoded.y, q.y, epsilon = 1e-3);
        assert_relative_eq!(decoded.z, q.z, epsilon = 1e-3);
        assert_relative_eq!(decoded.w, q.w, epsilon = 1e-3);
        assert_relative_eq!(decoded.length(), 1.0, epsilon = 1e-4);
    }
}

#[test]
fn vector48_decodes_half_floats() {
    let x = half::f16::from_f32(1.5).to_bits();
    let y = half::f16::from_f32(-2.25).to_bits();
    let z = half::f16::from_f32(100.0).to_bits();

    assert_relative_eq!(decode_vector48(x, y, z), Vec3::new(1.5, -2.25, 100.0));
}

// RLE channels.

fn token(total: u8, valid: u8) -> i16 {
    ((u16::from(total) << 8) | u16::from(valid)) as i16
}

/// Expands a token stream to one literal per frame, the way a naive
/// decoder would.
fn expand_rle(values: &[i16]) -> Vec<i16> {
    let mut out = Vec::new();
    let mut i = 0;

    while i < values.len() {
        let total = usize::from((values[i] as u16 >> 8) & 0xff);
        let valid = usize::from(values[i] as u16 & 0xff);
        if total == 0 {
            break;
        }

        for k in 0..total {
            let literal = i + 1 + k.min(valid.saturating_sub(1));
            out.push(values[literal]);
        }

        i += valid + 1;
    }

    out
}

#[test]
fn extract_matches_naive_expansion() {
    let streams: Vec<Vec<i16>> = vec![
        vec![token(5, 3), 10, 20, 30],
        vec![token(2, 2), 5, 6, token(4, 1), -7],
        vec![
            token(3, 3),
            1,
            2,
            3,
            token(1, 1),
            4,
            token(4, 2),
            5,
            6,
            token(2, 1),
            7,
        ],
    ];

    for stream in &streams {
        let expanded = expand_rle(stream);
        for (frame, &expected) in expanded.iter().enumerate() {
            assert_eq!(
                extract_anim_value(frame, stream, 1.0),
                f32::from(expected),
                "frame {frame} of {stream:?}"
            );
        }
    }
}

#[test]
fn extract_repeats_last_literal_past_valid() {
    // Boundary case: the first frame index beyond the literals.
    let stream = [token(5, 2), 10, 20];
    assert_eq!(extract_anim_value(1, &stream, 1.0), 20.0);
    assert_eq!(extract_anim_value(2, &stream, 1.0), 20.0);
    assert_eq!(extract_anim_value(4, &stream, 1.0), 20.0);
}

#[test]
fn extract_applies_scale() {
    let stream = [token(1, 1), 100];
    assert_relative_eq!(extract_anim_value(0, &stream, 0.25), 25.0);
}

#[test]
fn extract_off_stream_end_is_zero() {
    let stream = [token(2, 1), 3];
    assert_eq!(extract_anim_value(10, &stream, 1.0), 0.0);
    assert_eq!(extract_anim_value(0, &[], 1.0), 0.0);
}

#[test]
fn rle_read_stops_at_frame_count() {
    let mut builder = BinaryBuilder::new();
    builder.i16(token(3, 1)).i16(42);
    // Trailing garbage that must not be consumed into the stream.
    builder.i16(0x7f7f).i16(0x7f7f);
    let bytes = builder.into_bytes();

    let span = SectionSpan {
        frame_count: 3,
        reads_to_stream_end: true,
    };
    assert_eq!(read_rle_values(&bytes, 0, span), vec![token(3, 1), 42]);
}

#[test]
fn rle_read_handles_truncated_stream() {
    let mut builder = BinaryBuilder::new();
    builder.i16(token(8, 4)).i16(1);
    let bytes = builder.into_bytes();

    let span = SectionSpan {
        frame_count: 8,
        reads_to_stream_end: true,
    };
    // Must not hang or panic on the missing literals.
    assert_eq!(read_rle_values(&bytes, 0, span), vec![token(8, 4), 1]);
}

// Section mapping.

#[test]
fn section_frame_mapping() {
    let desc = test_desc(100, 30);
    let section_count = 100 / 30 + 2;

    assert_eq!(section_for_frame(&desc, section_count, 0), (0, 0));
    assert_eq!(section_for_frame(&desc, section_count, 29), (0, 29));
    assert_eq!(section_for_frame(&desc, section_count, 30), (1, 0));
    assert_eq!(section_for_frame(&desc, section_count, 99), (3, 9));
}

#[test]
fn section_frame_mapping_clamps_out_of_range() {
    let desc = test_desc(100, 30);
    let (section, local) = section_for_frame(&desc, 5, 1000);
    assert_eq!(section, 4);
    assert_eq!(local, 1000 - 4 * 30);
}

#[test]
fn section_spans() {
    let desc = test_desc(100, 30);

    let first = section_span(&desc, 5, 0);
    assert_eq!(first.frame_count, 30);
    assert!(!first.reads_to_stream_end);

    let last_full = section_span(&desc, 5, 3);
    assert_eq!(last_full.frame_count, 100 - 3 * 30);
    assert!(last_full.reads_to_stream_end);

    let unsectioned = section_span(&test_desc(7, 0), 1, 0);
    assert_eq!(unsectioned.frame_count, 7);
    assert!(unsectioned.reads_to_stream_end);
}

#[test]
fn descriptor_without_section_table_has_implicit_section() {
    let mut desc = test_desc(10, 0);
    desc.anim_block = 2;
    desc.anim_offset = 1234;

    let sections = animation_sections(&[], &desc);
    assert_eq!(
        sections,
        vec![super::anim::AnimationSection {
            block_index: 2,
            byte_offset: 1234,
        }]
    );
}

#[test]
fn section_table_allocates_two_extra_entries() {
    let mut desc = test_desc(100, 30);
    desc.offset_start = 0;
    desc.section_offset = 16;

    let mut builder = BinaryBuilder::new();
    builder.pad_to(16, 0);
    for i in 0..5 {
        builder.i32(0).i32(i * 100);
    }
    let bytes = builder.into_bytes();

    let sections = animation_sections(&bytes, &desc);
    assert_eq!(sections.len(), 5);
    assert_eq!(sections[4].byte_offset, 400);
}

// Legacy per-bone decoding.

#[test]
fn legacy_section_decodes_raw_and_channel_data() {
    let mut builder = BinaryBuilder::new();

    // Bone 0: raw half-float position, next record at +10.
    builder.u8(0).u8(0x01).i16(10);
    builder
        .u16(half::f16::from_f32(1.0).to_bits())
        .u16(half::f16::from_f32(2.0).to_bits())
        .u16(half::f16::from_f32(3.0).to_bits());

    // Bone 1: channel rotation, x and z streams, y constant zero.
    builder.u8(1).u8(0x08).i16(0);
    builder.i16(6).i16(0).i16(10);
    builder.i16(token(3, 1)).i16(100);
    builder.i16(token(3, 1)).i16(200);

    let bytes = builder.into_bytes();
    let span = SectionSpan {
        frame_count: 3,
        reads_to_stream_end: true,
    };

    let by_bone = read_section_animations(&bytes, 0, 2, span);

    let anim0 = by_bone[0].as_ref().unwrap();
    assert_eq!(anim0.flags, BoneAnimFlags::RAW_POS);
    assert_relative_eq!(anim0.raw_pos.unwrap(), Vec3::new(1.0, 2.0, 3.0));

    let anim1 = by_bone[1].as_ref().unwrap();
    let channels = anim1.rot_channels.as_ref().unwrap();
    assert_eq!(channels.x, vec![token(3, 1), 100]);
    assert!(channels.y.is_empty());
    assert_eq!(channels.z, vec![token(3, 1), 200]);

    let mut bone0 = test_bone(0, -1);
    bone0.position = Vec3::new(9.0, 9.0, 9.0);
    assert_relative_eq!(
        bone_position(0, &bone0, by_bone[0].as_ref()),
        Vec3::new(1.0, 2.0, 3.0)
    );

    let mut bone1 = test_bone(1, 0);
    bone1.rotation = Vec3::new(0.5, 0.5, 0.5);
    bone1.rotation_scale = Vec3::new(0.01, 1.0, 0.02);
    let rotation = bone_rotation(1, &bone1, by_bone[1].as_ref());
    assert_relative_eq!(rotation, Vec3::new(1.5, 0.5, 4.5));
}

#[test]
fn legacy_chain_terminates_on_sentinel() {
    let mut builder = BinaryBuilder::new();
    builder.u8(255).u8(0).i16(0);
    let bytes = builder.into_bytes();

    let span = SectionSpan {
        frame_count: 1,
        reads_to_stream_end: true,
    };
    let by_bone = read_section_animations(&bytes, 0, 4, span);
    assert!(by_bone.iter().all(Option::is_none));
}

#[test]
fn delta_animation_replaces_base_pose() {
    let mut builder = BinaryBuilder::new();
    // Bone 0: delta + channel position, x stream only.
    builder.u8(0).u8(0x04 | 0x10).i16(0);
    builder.i16(6).i16(0).i16(0);
    builder.i16(token(1, 1)).i16(8);
    let bytes = builder.into_bytes();

    let span = SectionSpan {
        frame_count: 1,
        reads_to_stream_end: true,
    };
    let by_bone = read_section_animations(&bytes, 0, 1, span);

    let mut bone = test_bone(0, -1);
    bone.position = Vec3::new(100.0, 100.0, 100.0);
    bone.position_scale = Vec3::new(0.5, 1.0, 1.0);

    // Delta data stands alone instead of adding to the base pose.
    assert_relative_eq!(
        bone_position(0, &bone, by_bone[0].as_ref()),
        Vec3::new(4.0, 0.0, 0.0)
    );
}

#[test]
fn missing_animation_keeps_base_pose() {
    let mut bone = test_bone(0, -1);
    bone.position = Vec3::new(1.0, 2.0, 3.0);
    bone.rotation = Vec3::new(0.1, 0.2, 0.3);

    assert_relative_eq!(bone_position(5, &bone, None), Vec3::new(1.0, 2.0, 3.0));
    assert_relative_eq!(bone_rotation(5, &bone, None), Vec3::new(0.1, 0.2, 0.3));
}

// Frame-block decoding.

#[test]
fn frame_anim_constants_and_per_frame_values() {
    let mut builder = BinaryBuilder::new();

    let constants_offset = 24 + 2;
    // Constants: bone 0 CONST_POS2 (12 bytes), bone 1 RAW_POS (6 bytes).
    let frame_offset = constants_offset + 12 + 6;

    builder.i32(constants_offset).i32(frame_offset).i32(6);
    builder.i32(0).i32(0).i32(0);

    // Bone flags: bone 0 CONST_POS2 | ANIM_ROT, bone 1 RAW_POS.
    builder.u8(0x20 | 0x08).u8(0x01);

    builder.f32(1.0).f32(2.0).f32(3.0);
    builder
        .u16(half::f16::from_f32(4.0).to_bits())
        .u16(half::f16::from_f32(5.0).to_bits())
        .u16(half::f16::from_f32(6.0).to_bits());

    // Two frames, each one 48-bit quaternion for bone 0.
    let identity = encode_quaternion48(Quat::IDENTITY);
    builder.u16(identity.0).u16(identity.1).u16(identity.2);
    let quarter_turn = encode_quaternion48(euler_to_quat(Vec3::new(0.0, 0.0, FRAC_PI_2)));
    builder
        .u16(quarter_turn.0)
        .u16(quarter_turn.1)
        .u16(quarter_turn.2);

    let bytes = builder.into_bytes();
    let section = read_frame_anim_section(&bytes, 0, 2).unwrap();

    let base_positions = vec![Vec3::splat(9.0), Vec3::splat(9.0)];
    let base_rotations = vec![Vec3::ZERO, Vec3::new(0.7, 0.0, 0.0)];

    let mut positions = base_positions.clone();
    let mut rotations = base_rotations.clone();
    section.decode_frame(0, &mut positions, &mut rotations);

    assert_relative_eq!(positions[0], Vec3::new(1.0, 2.0, 3.0));
    assert_relative_eq!(positions[1], Vec3::new(4.0, 5.0, 6.0));
    assert_relative_eq!(rotations[0], Vec3::ZERO, epsilon = 1e-3);
    // Bone 1 has no rotation data and keeps its base rotation.
    assert_relative_eq!(rotations[1], Vec3::new(0.7, 0.0, 0.0));

    let mut positions = base_positions;
    let mut rotations = base_rotations;
    section.decode_frame(1, &mut positions, &mut rotations);
    assert_relative_eq!(rotations[0].z, FRAC_PI_2, epsilon = 1e-3);
}

#[test]
fn frame_anim_per_frame_values_override_constants() {
    let mut builder = BinaryBuilder::new();

    let constants_offset = 24 + 1;
    let frame_offset = constants_offset + 6;
    builder.i32(constants_offset).i32(frame_offset).i32(6);
    builder.i32(0).i32(0).i32(0);

    // One bone: RAW_POS constant plus per-frame ANIM_POS.
    builder.u8(0x01 | 0x04);

    builder
        .u16(half::f16::from_f32(1.0).to_bits())
        .u16(half::f16::from_f32(1.0).to_bits())
        .u16(half::f16::from_f32(1.0).to_bits());
    builder
        .u16(half::f16::from_f32(7.0).to_bits())
        .u16(half::f16::from_f32(8.0).to_bits())
        .u16(half::f16::from_f32(9.0).to_bits());

    let bytes = builder.into_bytes();
    let section = read_frame_anim_section(&bytes, 0, 1).unwrap();

    let mut positions = vec![Vec3::ZERO];
    let mut rotations = vec![Vec3::ZERO];
    section.decode_frame(0, &mut positions, &mut rotations);

    // The per-frame value wins over the constant.
    assert_relative_eq!(positions[0], Vec3::new(7.0, 8.0, 9.0));
}

#[test]
fn frame_anim_rejects_truncated_header() {
    let bytes = vec![0_u8; 16];
    assert!(read_frame_anim_section(&bytes, 0, 1).is_none());
}

// Root motion.

fn test_movement() -> Movement {
    Movement {
        end_frame_index: 10,
        motion_flags: 0,
        v0: 2.0,
        v1: 4.0,
        angle_degrees: 90.0,
        vector: Vec3::new(1.0, 0.0, 0.0),
        position: Vec3::new(30.0, 0.0, 0.0),
    }
}

#[test]
fn piecewise_movement_within_segment() {
    let movements = [test_movement()];

    let (position, yaw) = piecewise_movement(5, &movements);
    // d = v0*f + 0.5*(v1-v0)*f^2 with f = 0.5
    assert_relative_eq!(position, Vec3::new(1.25, 0.0, 0.0));
    assert_relative_eq!(yaw, FRAC_PI_2 * 0.5);
}

#[test]
fn piecewise_movement_past_last_segment() {
    let movements = [test_movement()];

    let (position, yaw) = piecewise_movement(15, &movements);
    assert_relative_eq!(position, Vec3::new(30.0, 0.0, 0.0));
    assert_relative_eq!(yaw, FRAC_PI_2);
}

#[test]
fn root_remap_differs_by_documented_permutation() {
    let bone = test_bone(0, -1);
    let raw = Vec3::new(1.0, 2.0, 3.0);

    let mut position_v44 = raw;
    let mut rotation_v44 = Vec3::ZERO;
    apply_root_adjustments(44, 0, &bone, &[], &mut position_v44, &mut rotation_v44);

    let mut position_v48 = raw;
    let mut rotation_v48 = Vec3::ZERO;
    apply_root_adjustments(48, 0, &bone, &[], &mut position_v48, &mut rotation_v48);

    assert_relative_eq!(position_v44, raw);
    assert_relative_eq!(
        position_v48,
        Vec3::new(position_v44.y, -position_v44.x, position_v44.z)
    );
}

#[test]
fn root_adjustments_skip_child_bones_and_frame_zero_movement() {
    let child = test_bone(1, 0);
    let mut position = Vec3::new(1.0, 2.0, 3.0);
    let mut rotation = Vec3::ZERO;
    apply_root_adjustments(48, 5, &child, &[test_movement()], &mut position, &mut rotation);
    assert_relative_eq!(position, Vec3::new(1.0, 2.0, 3.0));

    let root = test_bone(0, -1);
    let mut position = Vec3::new(1.0, 2.0, 3.0);
    let mut rotation = Vec3::ZERO;
    apply_root_adjustments(48, 0, &root, &[test_movement()], &mut position, &mut rotation);
    // Frame 0 applies the axis remap but never movement.
    assert_relative_eq!(position, Vec3::new(2.0, -1.0, 3.0));
    assert_relative_eq!(rotation.z, 0.0);
}

// Section data resolution.

#[test]
fn multi_section_inline_offset_is_adjusted() {
    let mut desc = test_desc(100, 30);
    desc.offset_start = 0;
    desc.section_offset = 8;
    desc.anim_offset = 500;

    let mut builder = BinaryBuilder::new();
    builder.pad_to(8, 0);
    // Five sections; the stored offsets are off by 10 relative to the
    // descriptor's own anim offset, as some encoders wrote them.
    for i in 0..5_i32 {
        builder.i32(0).i32(490 + i * 20);
    }
    // Wrong, unadjusted location for section 1: an end-of-chain marker.
    builder.pad_to(510, 0);
    builder.u8(255).u8(0).i16(0);
    // Adjusted location for section 1: bone 0 with a raw position.
    builder.pad_to(520, 0);
    builder.u8(0).u8(0x01).i16(0);
    builder
        .u16(half::f16::from_f32(5.0).to_bits())
        .u16(half::f16::from_f32(0.0).to_bits())
        .u16(half::f16::from_f32(0.0).to_bits());

    let bytes = builder.into_bytes();
    let model = test_model(48, vec![test_bone(0, -1)]);
    let decoder = AnimationDecoder::new(&model, &bytes);

    let sections = decoder.sections(&desc);
    assert_eq!(sections.len(), 5);

    match decoder.decode_section(&desc, &sections, 1) {
        DecodedSection::Legacy(by_bone) => {
            let anim = by_bone[0].as_ref().expect("adjusted offset missed the data");
            assert_relative_eq!(anim.raw_pos.unwrap().x, 5.0);
        }
        other => panic!("expected legacy section, got {other:?}"),
    }
}

#[test]
fn external_section_requires_ani_bytes() {
    let mut desc = test_desc(5, 0);
    desc.anim_block = 1;
    desc.anim_offset = 4;

    let mut model = test_model(48, vec![test_bone(0, -1)]);
    model.anim_blocks = vec![
        AnimBlock {
            data_start: 0,
            data_end: 0,
        },
        AnimBlock {
            data_start: 16,
            data_end: 64,
        },
    ];

    let mut ani = BinaryBuilder::new();
    ani.pad_to(20, 0);
    ani.u8(0).u8(0x01).i16(0);
    ani.u16(half::f16::from_f32(7.0).to_bits())
        .u16(half::f16::from_f32(0.0).to_bits())
        .u16(half::f16::from_f32(0.0).to_bits());
    let ani_bytes = ani.into_bytes();

    let mdl_bytes = Vec::new();
    let decoder = AnimationDecoder::new(&model, &mdl_bytes);
    let sections = decoder.sections(&desc);

    // Without the external file the section degrades to base poses.
    assert_eq!(
        decoder.decode_section(&desc, &sections, 0),
        DecodedSection::Unavailable
    );

    let decoder = decoder.with_ani(&ani_bytes);
    match decoder.decode_section(&desc, &sections, 0) {
        DecodedSection::Legacy(by_bone) => {
            assert_relative_eq!(by_bone[0].as_ref().unwrap().raw_pos.unwrap().x, 7.0);
        }
        other => panic!("expected legacy section, got {other:?}"),
    }
}

// Bone record stride inference.

fn build_bone_table(stride: usize, count: usize) -> Vec<u8> {
    let mut builder = BinaryBuilder::new();
    let table_len = stride * count;

    for i in 0..count {
        let record_start = i * stride;
        builder.pad_to(record_start, 0x01);

        let name_offset = (table_len + i * 8) as i32 - record_start as i32;
        builder.i32(name_offset);
        builder.i32(if i == 0 { -1 } else { i as i32 - 1 });
    }

    builder.pad_to(table_len, 0x01);
    for i in 0..count {
        let name_start = table_len + i * 8;
        builder.pad_to(name_start, 0);
        builder.str_z(&format!("bone{i}"));
    }

    // Record parsing is alignment-checked, so mirror the aligned reads the
    // decoder performs on real files.
    crate::binary_utils::realign::<maligned::A4>(builder.into_bytes()).unwrap()
}

/// Rebuilding the table with each supported stride and re-running the
/// inference must recover that exact stride.
#[test]
fn bone_stride_inference_roundtrip() {
    for layout in &BONE_LAYOUTS {
        let bytes = build_bone_table(layout.stride, 4);
        let inferred = infer_bone_layout(&bytes, 0, 4)
            .unwrap_or_else(|| panic!("no layout inferred for stride {}", layout.stride));
        assert_eq!(
            inferred.stride, layout.stride,
            "wrong stride inferred for {}",
            layout.stride
        );
    }
}

#[test]
fn bone_inference_rejects_garbage() {
    let bytes = crate::binary_utils::realign::<maligned::A4>(vec![0x01_u8; 4096]).unwrap();
    assert!(infer_bone_layout(&bytes, 0, 8).is_none());
}

#[test]
fn plausible_bone_names() {
    assert!(is_plausible_bone_name(b"ValveBiped.Bip01_Pelvis"));
    assert!(!is_plausible_bone_name(b""));
    assert!(!is_plausible_bone_name(b"bad\x01name"));
    assert!(!is_plausible_bone_name(&[b'a'; 201]));
}

// Structural decoding and degradation.

#[test]
fn rejects_bad_signature() {
    let mut builder = BinaryBuilder::new();
    builder.raw(b"IDSQ").i32(48).i32(0);
    let mdl = mdl_from(builder);

    assert!(matches!(
        Model::decode(&mdl, None),
        Err(Error::InvalidSignature { .. })
    ));
}

#[test]
fn rejects_unsupported_versions() {
    for version in [10, 43, 50, 51, 57, 60] {
        let mut builder = BinaryBuilder::new();
        write_header(
            &mut builder,
            &HeaderFields {
                version,
                ..HeaderFields::default()
            },
        );
        let mdl = mdl_from(builder);

        assert!(
            matches!(
                Model::decode(&mdl, None),
                Err(Error::UnsupportedVersion { version: v, .. }) if v == version
            ),
            "version {version} must be rejected"
        );
    }
}

#[test]
fn version_override_selects_decode_path() {
    let mut builder = BinaryBuilder::new();
    write_header(
        &mut builder,
        &HeaderFields {
            version: 50,
            ..HeaderFields::default()
        },
    );
    let mdl = mdl_from(builder);

    assert!(Model::decode(&mdl, None).is_err());

    let model = Model::decode(&mdl, Some(48)).unwrap();
    assert_eq!(model.version, 48);

    // An override outside the supported set is rejected even for a file
    // whose embedded version would be fine.
    let mut builder = BinaryBuilder::new();
    write_header(&mut builder, &HeaderFields::default());
    let mdl = mdl_from(builder);
    assert!(Model::decode(&mdl, Some(51)).is_err());
}

#[test]
fn corrupt_offsets_degrade_to_empty_tables() {
    let mut builder = BinaryBuilder::new();
    write_header(
        &mut builder,
        &HeaderFields {
            bone_count: 8,
            bone_offset: 1 << 24,
            local_anim_count: 4,
            local_anim_offset: 1 << 24,
            local_seq_count: 4,
            local_seq_offset: -12,
            texture_count: 4,
            texture_offset: 1 << 24,
            texture_dir_count: 2,
            texture_dir_offset: 1 << 24,
            skin_reference_count: 4,
            skin_family_count: 4,
            skin_family_offset: 1 << 24,
            body_part_count: 3,
            body_part_offset: 1 << 24,
            flex_desc_count: 3,
            flex_desc_offset: 1 << 24,
            flex_controller_count: 3,
            flex_controller_offset: 1 << 24,
            flex_rules_count: 3,
            flex_rules_offset: 1 << 24,
            anim_block_count: 3,
            anim_block_offset: 1 << 24,
            anim_block_name_offset: 1 << 24,
            ..HeaderFields::default()
        },
    );
    let mdl = mdl_from(builder);

    let model = Model::decode(&mdl, None).unwrap();
    assert!(model.bones.is_empty());
    assert!(model.animations.is_empty());
    assert!(model.sequences.is_empty());
    assert!(model.textures.is_empty());
    assert!(model.texture_paths.is_empty());
    assert!(model.skin_families.is_empty());
    assert!(model.body_parts.is_empty());
    assert!(model.flex_desc_names.is_empty());
    assert!(model.flex_controllers.is_empty());
    assert!(model.flex_rules.is_empty());
    assert!(model.anim_blocks.is_empty());
    assert!(model.anim_block_name.is_none());
}

#[test]
fn truncated_file_decodes_to_empty_model() {
    let mut builder = BinaryBuilder::new();
    builder.raw(b"IDST").i32(48).i32(1234);
    let mdl = mdl_from(builder);

    let model = Model::decode(&mdl, None).unwrap();
    assert_eq!(model.version, 48);
    assert!(model.bones.is_empty());
}

#[test]
fn animation_name_prefix_relocation() {
    assert_eq!(relocate_animation_name_prefix("a_../run"), "a_run");
    assert_eq!(
        relocate_animation_name_prefix("a_../walk/cycle"),
        "walk/a_cycle"
    );
    assert_eq!(relocate_animation_name_prefix("plain"), "plain");
}

#[test]
fn embedded_sections_are_located_by_scan() {
    let mut builder = BinaryBuilder::new();
    builder.pad_to(0x184, 0);
    builder.i32(0x200).i32(0x300).i32(0).i32(0);
    builder.i32(0x100).i32(0x100).i32(0).i32(0);

    // Embedded vtx header at 0x200.
    builder.pad_to(0x200, 0);
    builder.i32(7); // version
    builder.i32(24); // vertex cache size
    builder.u16(53).u16(9);
    builder.i32(3); // max bones per vertex
    builder.i32(0); // checksum
    builder.i32(1); // lod count
    builder.i32(0); // material replacement list
    builder.i32(1).i32(0x24); // body parts

    builder.pad_to(0x300, 0);
    builder.raw(b"IDSV");
    builder.pad_to(0x400, 0);

    let bytes = builder.into_bytes();
    let sections = find_embedded_sections(&bytes).unwrap();
    assert_eq!(sections.vtx_offset, 0x200);
    assert_eq!(sections.vvd_offset, 0x300);
    assert_eq!(sections.phy_offset, 0);
}

#[test]
fn embedded_sections_require_vvd_signature() {
    let mut builder = BinaryBuilder::new();
    builder.pad_to(0x184, 0);
    builder.i32(0x200).i32(0x300).i32(0).i32(0);
    builder.i32(0x100).i32(0x100).i32(0).i32(0);
    builder.pad_to(0x400, 0);

    assert!(find_embedded_sections(&builder.into_bytes()).is_none());
}

// External animation file resolution.

#[test]
fn ani_candidates_follow_resolution_order() {
    let mdl_path = Path::new("/game/hl2/models/props/chair.mdl");
    let candidates =
        anim::ani_path_candidates(mdl_path, Some("models\\props\\chair_animations"));

    assert_eq!(
        candidates,
        vec![
            std::path::PathBuf::from(
                "/game/hl2/models/props/models/props/chair_animations.ani"
            ),
            std::path::PathBuf::from("/game/hl2/models/props/chair_animations.ani"),
            std::path::PathBuf::from("/game/hl2/models/props/chair_animations.ani"),
            std::path::PathBuf::from("/game/hl2/models/props/chair.ani"),
        ]
    );
}

#[test]
fn ani_candidates_fall_back_to_model_base_name() {
    let mdl_path = Path::new("/somewhere/else/chair.mdl");
    let candidates = anim::ani_path_candidates(mdl_path, None);
    assert_eq!(
        candidates,
        vec![std::path::PathBuf::from("/somewhere/else/chair.ani")]
    );
}
