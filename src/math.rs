use byteorder::{LittleEndian, WriteBytesExt};
use cgmath::Matrix4;
use cgmath::Point3;
use cgmath::Vector2;
use cgmath::Vector3;
use cgmath::Vector4;

pub type Real = f32;
pub type Point = Point3<Real>;
pub type Vec2 = Vector2<Real>;
pub type Vec3 = Vector3<Real>;
pub type Vec4 = Vector4<Real>;
pub type Mat4 = Matrix4<Real>;

/// Upper 3x4 block in row-major order, the layout ray tracing instances use.
pub fn row_major_3x4(matrix: &Mat4) -> [Real; 12] {
    // cgmath stores columns.
    let mut out = [0.0; 12];
    for row in 0..3 {
        for column in 0..4 {
            out[row * 4 + column] = matrix[column][row];
        }
    }
    out
}

/// Column-major, as shaders read a mat4 from a buffer.
pub fn write_mat4(out: &mut Vec<u8>, matrix: &Mat4) {
    let columns: &[[Real; 4]; 4] = matrix.as_ref();
    for column in columns {
        for value in column {
            let _ = out.write_f32::<LittleEndian>(*value);
        }
    }
}

pub fn write_floats(out: &mut Vec<u8>, values: &[Real]) {
    for value in values {
        let _ = out.write_f32::<LittleEndian>(*value);
    }
}

pub fn write_uints(out: &mut Vec<u8>, values: &[u32]) {
    for value in values {
        let _ = out.write_u32::<LittleEndian>(*value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::SquareMatrix;

    #[test]
    fn translation_lands_in_last_column() {
        let matrix = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let packed = row_major_3x4(&matrix);
        assert_eq!(packed, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn mat4_is_sixty_four_bytes() {
        let mut out = Vec::new();
        write_mat4(&mut out, &Mat4::identity());
        assert_eq!(out.len(), 64);
        assert_eq!(&out[0..4], &1.0f32.to_le_bytes());
    }
}
