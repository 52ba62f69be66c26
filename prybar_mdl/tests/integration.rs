//! End-to-end decode of a synthetic model file: header, bone table,
//! animation descriptor with movement data, and a legacy animation chain.

use approx::assert_relative_eq;
use glam::Vec3;

use prybar_mdl::{AnimationDecoder, Mdl, Model};
use prybar_test_utils::{write_header, BinaryBuilder, HeaderFields};

const ANIM_DESC_START: usize = 400;
const NAME_START: usize = 500;
const MOVEMENT_START: usize = 520;
const ANIM_DATA_START: usize = 600;
const BONE_TABLE_START: usize = 700;
const BONE_STRIDE: usize = 144;
const BONE_NAMES_START: usize = BONE_TABLE_START + 2 * BONE_STRIDE;

fn token(total: u8, valid: u8) -> i16 {
    ((u16::from(total) << 8) | u16::from(valid)) as i16
}

fn half_bits(value: f32) -> u16 {
    half::f16::from_f32(value).to_bits()
}

fn write_animation_desc(builder: &mut BinaryBuilder) {
    builder.pad_to(ANIM_DESC_START, 0);

    builder.i32(0); // base header offset
    builder.i32((NAME_START - ANIM_DESC_START) as i32);
    builder.f32(30.0);
    builder.i32(0); // flags
    builder.i32(3); // frame count
    builder.i32(1); // movement count
    builder.i32((MOVEMENT_START - ANIM_DESC_START) as i32);
    builder.i32(0).i32(0); // ik rule zero frame, compressed ik error
    builder.i32(0).i32(0).i32(0).i32(0); // unused
    builder.i32(0); // anim block
    builder.i32((ANIM_DATA_START - ANIM_DESC_START) as i32);
    builder.i32(0).i32(0).i32(0); // ik rules
    builder.i32(0).i32(0); // local hierarchy
    builder.i32(0); // section offset
    builder.i32(0); // section frame count
    builder.i16(0).i16(0); // zero frame span/count
    builder.i32(0); // zero frame offset
    builder.f32(0.0); // zero frame stall time

    assert_eq!(builder.len(), ANIM_DESC_START + 100);

    builder.pad_to(NAME_START, 0);
    builder.str_z("gesture01");

    builder.pad_to(MOVEMENT_START, 0);
    builder.i32(10); // end frame index
    builder.i32(0); // motion flags
    builder.f32(2.0).f32(2.0); // v0, v1
    builder.f32(0.0); // angle
    builder.f32(1.0).f32(0.0).f32(0.0); // direction
    builder.f32(20.0).f32(0.0).f32(0.0); // cumulative position
}

fn write_animation_data(builder: &mut BinaryBuilder) {
    builder.pad_to(ANIM_DATA_START, 0);

    // Root bone: raw half-float position, next record 10 bytes ahead.
    builder.u8(0).u8(0x01).i16(10);
    builder.u16(half_bits(1.0)).u16(half_bits(2.0)).u16(half_bits(3.0));

    // Child bone: channel rotation on x and z, end of chain.
    builder.u8(1).u8(0x08).i16(0);
    builder.i16(6).i16(0).i16(10);
    builder.i16(token(3, 1)).i16(100);
    builder.i16(token(3, 1)).i16(200);
}

fn write_bone(
    builder: &mut BinaryBuilder,
    record_start: usize,
    name_offset: i32,
    parent: i32,
    position: Vec3,
    rotation_scale: Vec3,
) {
    builder.pad_to(record_start, 0);

    builder.i32(name_offset);
    builder.i32(parent);
    for _ in 0..6 {
        builder.i32(0); // bone controllers
    }
    builder.f32(position.x).f32(position.y).f32(position.z);
    builder.f32(0.0).f32(0.0).f32(0.0).f32(1.0); // quat
    builder.f32(0.0).f32(0.0).f32(0.0); // rotation
    builder.f32(1.0).f32(1.0).f32(1.0); // position scale
    builder
        .f32(rotation_scale.x)
        .f32(rotation_scale.y)
        .f32(rotation_scale.z);
    for _ in 0..12 {
        builder.f32(0.0); // pose to bone
    }

    assert_eq!(builder.len(), record_start + BONE_STRIDE);
}

fn build_fixture() -> Vec<u8> {
    let mut builder = BinaryBuilder::new();

    write_header(
        &mut builder,
        &HeaderFields {
            version: 48,
            checksum: 0x0eef,
            name: "props/crate01".to_owned(),
            bone_count: 2,
            bone_offset: BONE_TABLE_START as i32,
            local_anim_count: 1,
            local_anim_offset: ANIM_DESC_START as i32,
            ..HeaderFields::default()
        },
    );

    write_animation_desc(&mut builder);
    write_animation_data(&mut builder);

    write_bone(
        &mut builder,
        BONE_TABLE_START,
        (BONE_NAMES_START - BONE_TABLE_START) as i32,
        -1,
        Vec3::ZERO,
        Vec3::ONE,
    );
    write_bone(
        &mut builder,
        BONE_TABLE_START + BONE_STRIDE,
        (BONE_NAMES_START + 5 - (BONE_TABLE_START + BONE_STRIDE)) as i32,
        0,
        Vec3::new(0.0, 0.0, 10.0),
        Vec3::new(0.01, 1.0, 0.02),
    );

    builder.pad_to(BONE_NAMES_START, 0);
    builder.str_z("root");
    builder.str_z("child");

    builder.into_bytes()
}

#[test]
fn decodes_synthetic_model() {
    let mdl = Mdl::from_bytes(build_fixture()).unwrap();
    let model = Model::decode(&mdl, None).unwrap();

    assert_eq!(model.version, 48);
    assert_eq!(model.checksum, 0x0eef);
    assert_eq!(model.name, "props/crate01");

    assert_eq!(model.bones.len(), 2);
    assert_eq!(model.bones[0].name, "root");
    assert_eq!(model.bones[0].parent_bone_index, -1);
    assert_eq!(model.bones[1].name, "child");
    assert_eq!(model.bones[1].parent_bone_index, 0);
    assert_relative_eq!(model.bones[1].position, Vec3::new(0.0, 0.0, 10.0));
    assert_relative_eq!(
        model.bones[1].rotation_scale,
        Vec3::new(0.01, 1.0, 0.02)
    );

    assert_eq!(model.animations.len(), 1);
    let desc = &model.animations[0];
    assert_eq!(desc.name, "gesture01");
    assert_relative_eq!(desc.fps, 30.0);
    assert_eq!(desc.frame_count, 3);
    assert_eq!(desc.movements.len(), 1);
    assert_eq!(desc.movements[0].end_frame_index, 10);
}

#[test]
fn exports_frames_with_root_motion_and_remap() {
    let mdl = Mdl::from_bytes(build_fixture()).unwrap();
    let model = Model::decode(&mdl, None).unwrap();

    let decoder = AnimationDecoder::new(&model, mdl.bytes());
    let frames: Vec<_> = decoder.frames(&model.animations[0]).collect();
    assert_eq!(frames.len(), 3);

    // Frame 0: the raw root position remapped for a version 48 model, no
    // movement applied yet.
    assert_relative_eq!(frames[0].positions[0], Vec3::new(2.0, -1.0, 3.0));
    assert_relative_eq!(frames[0].rotations[0], Vec3::ZERO);

    // Frames 1 and 2 accumulate linear root displacement along +x before
    // the axis remap.
    assert_relative_eq!(frames[1].positions[0], Vec3::new(2.0, -1.2, 3.0), epsilon = 1e-5);
    assert_relative_eq!(frames[2].positions[0], Vec3::new(2.0, -1.4, 3.0), epsilon = 1e-5);

    // The child bone holds its base position and animates rotation from
    // the scaled channel values on every frame.
    for frame in &frames {
        assert_relative_eq!(frame.positions[1], Vec3::new(0.0, 0.0, 10.0));
        assert_relative_eq!(frame.rotations[1], Vec3::new(1.0, 0.0, 4.0), epsilon = 1e-5);
    }
}

#[test]
fn zero_frame_animations_yield_no_frames() {
    let mdl = Mdl::from_bytes(build_fixture()).unwrap();
    let model = Model::decode(&mdl, None).unwrap();

    let mut desc = model.animations[0].clone();
    desc.frame_count = 0;

    let decoder = AnimationDecoder::new(&model, mdl.bytes());
    assert_eq!(decoder.frames(&desc).count(), 0);
}
