//! Software volume curve
//!
//! Maps the 0..=100 volume index to a linear scaler when a device has no
//! usable hardware volume control. The default curve steps 0.5 dB per index
//! below 100 and forces exact silence at 0. Nodes may carry their own
//! pre-computed table which takes precedence.

const DB_PER_STEP: f32 = 0.5;

/// Scaler for one volume index on the default curve.
pub fn get_scaler(volume: u32) -> f32 {
    let volume = volume.min(100);
    if volume == 0 {
        return 0.0;
    }
    let db = -((100 - volume) as f32) * DB_PER_STEP;
    10f32.powf(db / 20.0)
}

/// Builds the full default table, for nodes that want to own a copy.
pub fn default_table() -> Vec<f32> {
    (0..=100).map(get_scaler).collect()
}

/// Converts a gain in centi-decibels (protocol unit for capture gain) to a
/// linear scaler.
pub fn scaler_from_centi_db(centi_db: i32) -> f32 {
    10f32.powf(centi_db as f32 / 100.0 / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        assert_eq!(get_scaler(100), 1.0);
        assert_eq!(get_scaler(0), 0.0);
        assert_eq!(get_scaler(200), 1.0, "clamped to 100");
    }

    #[test]
    fn test_curve_is_monotone() {
        let mut last = -1.0;
        for v in 0..=100 {
            let s = get_scaler(v);
            assert!(s >= last, "curve must not decrease at {}", v);
            last = s;
        }
    }

    #[test]
    fn test_half_db_steps() {
        // 6 dB down is ~0.5012 linear; that's 12 steps on the curve.
        let s = get_scaler(88);
        assert!((s - 0.501).abs() < 0.01, "got {}", s);
    }

    #[test]
    fn test_table_size() {
        let table = default_table();
        assert_eq!(table.len(), 101);
        assert_eq!(table[100], 1.0);
        assert_eq!(table[0], 0.0);
    }

    #[test]
    fn test_centi_db_scaler() {
        assert!((scaler_from_centi_db(0) - 1.0).abs() < 1e-6);
        assert!((scaler_from_centi_db(600) - 1.995).abs() < 0.01);
        assert!((scaler_from_centi_db(-600) - 0.501).abs() < 0.01);
    }
}
