/// Air density (kg/m^3) at `altitude_asl` (m), linear fit of the standard
/// atmosphere between 0 m and 3000 m.
pub fn approximate_air_density(altitude_asl: f32) -> f32 {
    (1.225 - altitude_asl * 0.0001053).max(0.0)
}

/// Piecewise linear interpolation over evenly spaced `values`, `t` in 0-1.
/// Outside of 0-1 the first or last segment is extrapolated.
pub fn lerp(t: f32, values: &[f32]) -> f32 {
    match values.len() {
        0 => return 0.0,
        1 => return values[0],
        _ => {}
    }

    let len = values.len();
    let spacing = 1.0f32 / ((len - 1) as f32);

    let i = ((t / spacing).max(0.0) as usize).min(len - 2);
    let t = (t - spacing * (i as f32)) * (len - 1) as f32;
    (1.0 - t) * values[i] + t * values[i + 1]
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn lerp_test() {
        let table = [0.0, 1.0, 2.0, 3.0];
        assert_relative_eq!(lerp(-1f32 / 3.0, &table), -1.0, epsilon = 0.0001);
        assert_relative_eq!(lerp(0.0, &table), 0.0, epsilon = 0.0001);
        assert_relative_eq!(lerp(0.16666666, &table), 0.5, epsilon = 0.0001);
        assert_relative_eq!(lerp(0.5, &table), 1.5, epsilon = 0.0001);
        assert_relative_eq!(lerp(1.0, &table), 3.0, epsilon = 0.0001);
        assert_relative_eq!(lerp(1.0 + 1.0 / 3.0, &table), 4.0, epsilon = 0.0001);
    }

    #[test]
    fn lerp_degenerate_tables() {
        assert_eq!(lerp(0.3, &[]), 0.0);
        assert_eq!(lerp(0.3, &[0.45]), 0.45);
    }

    #[test]
    fn air_density_decreases_with_altitude() {
        assert_relative_eq!(approximate_air_density(0.0), 1.225);
        assert!(approximate_air_density(1000.0) < approximate_air_density(0.0));
        assert!(approximate_air_density(1.0e6) >= 0.0);
    }
}
