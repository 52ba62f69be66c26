//! Decoders for the compressed value encodings used by animation data.
//!
//! The formats quantize unit quaternions by dropping one component and
//! reconstructing it as `sqrt(1 - x² - y² - z²)` with a stored sign, and
//! store positions either as 16-bit half floats or full floats.

use glam::{EulerRot, Quat, Vec3};
use half::f16;

/// 48-bit quaternion: 16-bit x, 16-bit y, 15-bit z plus the w sign bit in
/// the top bit of the third word.
#[must_use]
pub fn decode_quaternion48(x: u16, y: u16, zw: u16) -> Quat {
    let qx = (i32::from(x) - 32768) as f32 * (1.0 / 32768.0);
    let qy = (i32::from(y) - 32768) as f32 * (1.0 / 32768.0);
    let z = i32::from(zw & 0x7fff);
    let qz = (z - 16384) as f32 * (1.0 / 16384.0);

    let mut qw = (1.0 - qx * qx - qy * qy - qz * qz).max(0.0).sqrt();
    if zw & 0x8000 != 0 {
        qw = -qw;
    }

    Quat::from_xyzw(qx, qy, qz, qw)
}

/// 64-bit quaternion: three 21-bit components plus the w sign bit.
#[must_use]
pub fn decode_quaternion64(bytes: [u8; 8]) -> Quat {
    let [b0, b1, b2, b3, b4, b5, b6, b7] = bytes.map(i32::from);

    let x_bits = b0 | (b1 << 8) | ((b2 & 0x1f) << 16);
    let y_bits = ((b2 & 0xe0) >> 5) | (b3 << 3) | (b4 << 11) | ((b5 & 0x03) << 19);
    let z_bits = ((b5 & 0xfc) >> 2) | (b6 << 6) | ((b7 & 0x7f) << 14);

    let qx = (x_bits - 1_048_576) as f32 * (1.0 / 1_048_576.5);
    let qy = (y_bits - 1_048_576) as f32 * (1.0 / 1_048_576.5);
    let qz = (z_bits - 1_048_576) as f32 * (1.0 / 1_048_576.5);

    let mut qw = (1.0 - qx * qx - qy * qy - qz * qz).max(0.0).sqrt();
    if b7 & 0x80 != 0 {
        qw = -qw;
    }

    Quat::from_xyzw(qx, qy, qz, qw)
}

const QUAT48S_SHIFT: f32 = 16384.0;
const QUAT48S_SCALE: f32 = 23168.0;

/// Compact 48-bit quaternion: three 15-bit components around a shared
/// midpoint, a 2-bit index naming the dropped component and its sign bit.
#[must_use]
pub fn decode_quaternion48s(bytes: [u8; 6]) -> Quat {
    let ua = (i32::from(bytes[1] & 0x7f) << 8) | i32::from(bytes[0]);
    let ub = (i32::from(bytes[3] & 0x7f) << 8) | i32::from(bytes[2]);
    let uc = (i32::from(bytes[5] & 0x7f) << 8) | i32::from(bytes[4]);

    let missing_index = ((bytes[1] & 0x80) >> 6) | ((bytes[3] & 0x80) >> 7);
    let missing_sign = if bytes[5] & 0x80 != 0 { -1.0 } else { 1.0 };

    let a = (ua as f32 - QUAT48S_SHIFT) / QUAT48S_SCALE;
    let b = (ub as f32 - QUAT48S_SHIFT) / QUAT48S_SCALE;
    let c = (uc as f32 - QUAT48S_SHIFT) / QUAT48S_SCALE;

    let missing = (1.0 - a * a - b * b - c * c).max(0.0).sqrt() * missing_sign;

    match missing_index {
        1 => Quat::from_xyzw(missing, a, b, c),
        2 => Quat::from_xyzw(c, missing, a, b),
        3 => Quat::from_xyzw(b, c, missing, a),
        _ => Quat::from_xyzw(a, b, c, missing),
    }
}

/// 48-bit vector: three half floats.
#[must_use]
pub fn decode_vector48(x: u16, y: u16, z: u16) -> Vec3 {
    Vec3::new(
        f16::from_bits(x).to_f32(),
        f16::from_bits(y).to_f32(),
        f16::from_bits(z).to_f32(),
    )
}

/// Converts a quaternion to the Euler angles (radians) the exporters expect.
///
/// Fixed ordering: body axes 0-1-2, even parity, non-repeating, static
/// frame. Computed through the rotation matrix in f64 so near-gimbal inputs
/// stay stable.
#[must_use]
pub fn quat_to_euler(q: Quat) -> Vec3 {
    let x = f64::from(q.x);
    let y = f64::from(q.y);
    let z = f64::from(q.z);
    let w = f64::from(q.w);

    let nq = x * x + y * y + z * z + w * w;
    let s = if nq > 0.0 { 2.0 / nq } else { 0.0 };

    let xs = x * s;
    let ys = y * s;
    let zs = z * s;

    let wx = w * xs;
    let wy = w * ys;
    let wz = w * zs;
    let xx = x * xs;
    let xy = x * ys;
    let xz = x * zs;
    let yy = y * ys;
    let yz = y * zs;
    let zz = z * zs;

    let m00 = 1.0 - (yy + zz);
    let m10 = xy + wz;
    let m11 = 1.0 - (xx + zz);
    let m12 = yz - wx;
    let m20 = xz - wy;
    let m21 = yz + wx;
    let m22 = 1.0 - (xx + yy);

    let cy = (m00 * m00 + m10 * m10).sqrt();

    if cy > 16.0 * 1e-5 {
        Vec3::new(
            m21.atan2(m22) as f32,
            (-m20).atan2(cy) as f32,
            m10.atan2(m00) as f32,
        )
    } else {
        Vec3::new(
            (-m12).atan2(m11) as f32,
            (-m20).atan2(cy) as f32,
            0.0,
        )
    }
}

/// Inverse of [`quat_to_euler`] for the same fixed ordering.
#[must_use]
pub fn euler_to_quat(angles: Vec3) -> Quat {
    Quat::from_euler(EulerRot::ZYX, angles.z, angles.y, angles.x)
}
