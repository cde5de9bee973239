use thiserror::Error;

/// Mapping between the public 0-255 brightness scale and a device's
/// physical DALI range. Level 0 is an off sentinel and is never passed
/// through these functions.

#[derive(Debug, Error, PartialEq, Eq)]
#[error("value {value} outside range {min}..={max}")]
pub struct RangeError {
    pub value: u8,
    pub min: u8,
    pub max: u8,
}

fn affine(value: u8, from_min: u8, from_max: u8, to_min: u8, to_max: u8) -> Result<u8, RangeError> {
    if from_min >= from_max || value < from_min || value > from_max {
        return Err(RangeError {
            value,
            min: from_min,
            max: from_max,
        });
    }

    let scaled = (value - from_min) as f64 / (from_max - from_min) as f64
        * (to_max as f64 - to_min as f64)
        + to_min as f64;

    Ok(scaled.round() as u8)
}

pub fn normalize(value: u8, min: u8, max: u8, out_min: u8, out_max: u8) -> Result<u8, RangeError> {
    affine(value, min, max, out_min, out_max)
}

pub fn denormalize(
    value: u8,
    out_min: u8,
    out_max: u8,
    min: u8,
    max: u8,
) -> Result<u8, RangeError> {
    affine(value, out_min, out_max, min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_level_within_rounding() {
        for (min, max) in [(1u8, 254u8), (10, 200), (5, 220), (85, 170)] {
            for level in 1..=255u8 {
                let physical = normalize(level, 0, 255, min, max).unwrap();
                let recovered = denormalize(physical, min, max, 0, 255).unwrap();
                assert!(
                    (recovered as i16 - level as i16).abs() <= 1,
                    "level {} via [{}, {}] came back as {}",
                    level,
                    min,
                    max,
                    recovered
                );
            }
        }
    }

    #[test]
    fn known_values() {
        assert_eq!(denormalize(128, 0, 255, 5, 220).unwrap(), 113);
        assert_eq!(denormalize(255, 0, 255, 10, 200).unwrap(), 200);
        assert_eq!(denormalize(0, 0, 255, 10, 200).unwrap(), 10);
        assert_eq!(normalize(200, 10, 200, 0, 255).unwrap(), 255);
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert_eq!(
            normalize(5, 10, 200, 0, 255),
            Err(RangeError {
                value: 5,
                min: 10,
                max: 200
            })
        );
        assert!(denormalize(201, 10, 200, 0, 255).is_err());
    }

    #[test]
    fn degenerate_bounds_are_rejected() {
        assert!(normalize(50, 50, 50, 0, 255).is_err());
    }
}
