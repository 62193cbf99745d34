/// 2D helpers for the toroidal arena.
/// Positions live in `[0, map_size)` on both axes; headings live in `(-PI, PI]`.
use std::f32::consts::{PI, TAU};

/// Wrap a heading into `(-PI, PI]`.
pub fn wrap_angle(angle: f32) -> f32 {
    let mut a = angle.rem_euclid(TAU);
    if a > PI {
        a -= TAU;
    }
    a
}

/// Wrap a coordinate into `[0, size)`.
///
/// `rem_euclid` may round up to exactly `size` for tiny negative inputs,
/// which is folded back to zero.
pub fn wrap_coord(v: f32, size: f32) -> f32 {
    let w = v.rem_euclid(size);
    if w >= size {
        0.0
    } else {
        w
    }
}

/// Squared euclidean distance
pub fn dist_sq(ax: f32, ay: f32, bx: f32, by: f32) -> f32 {
    let dx = bx - ax;
    let dy = by - ay;
    dx * dx + dy * dy
}

/// Heading from `(ax, ay)` towards `(bx, by)` relative to `heading`, wrapped.
pub fn relative_angle(ax: f32, ay: f32, heading: f32, bx: f32, by: f32) -> f32 {
    let towards = (by - ay).atan2(bx - ax);
    wrap_angle(towards - heading)
}

/// Shortest signed displacement from `a` to `b` on a ring of length `size`.
pub fn toroidal_delta(a: f32, b: f32, size: f32) -> f32 {
    let mut d = b - a;
    let half = size * 0.5;
    if d > half {
        d -= size;
    } else if d < -half {
        d += size;
    }
    d
}

/// Interpolate between two coordinates along the shortest wrapped path.
pub fn lerp_wrapped(a: f32, b: f32, t: f32, size: f32) -> f32 {
    wrap_coord(a + toroidal_delta(a, b, size) * t, size)
}

/// Interpolate between two headings along the shortest arc.
pub fn lerp_angle(a: f32, b: f32, t: f32) -> f32 {
    wrap_angle(a + wrap_angle(b - a) * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_angle_stays_in_half_open_range() {
        for i in -200..200 {
            let a = wrap_angle(i as f32 * 0.37);
            assert!(a > -PI && a <= PI, "angle {} out of range", a);
        }
    }

    #[test]
    fn wrap_angle_maps_minus_pi_to_pi() {
        assert_eq!(wrap_angle(-PI), PI);
        assert_eq!(wrap_angle(PI), PI);
    }

    #[test]
    fn wrap_coord_handles_multiple_widths() {
        assert!((wrap_coord(250.0, 100.0) - 50.0).abs() < 1e-4);
        assert!((wrap_coord(-250.0, 100.0) - 50.0).abs() < 1e-4);
        assert_eq!(wrap_coord(100.0, 100.0), 0.0);
        let tiny = wrap_coord(-1e-9, 100.0);
        assert!((0.0..100.0).contains(&tiny));
    }

    #[test]
    fn relative_angle_points_at_target() {
        // Target straight ahead
        assert!(relative_angle(0.0, 0.0, 0.0, 10.0, 0.0).abs() < 1e-6);
        // Target to the +y side while facing +x
        assert!((relative_angle(0.0, 0.0, 0.0, 0.0, 10.0) - PI / 2.0).abs() < 1e-6);
    }

    #[test]
    fn lerp_wrapped_takes_short_way_round() {
        let mid = lerp_wrapped(95.0, 5.0, 0.5, 100.0);
        assert!(mid < 1e-3 || mid > 99.999, "got {}", mid);
    }

    #[test]
    fn lerp_angle_crosses_pi_boundary() {
        let mid = lerp_angle(3.0, -3.0, 0.5);
        assert!(mid.abs() > 3.0);
    }
}
