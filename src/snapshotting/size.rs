use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use snafu::ensure;
use tracing::debug;

use crate::{InvalidSizeSnafu, Result, SizeTooLargeSnafu};

pub const GIB: i64 = 1024 * 1024 * 1024;

/// Largest size whose 110% buffer still fits in an i64.
const MAX_SAFE_SIZE: i64 = i64::MAX / 11;

/// Storage request for `size` bytes of content: 110% of the size, rounded up to whole GiB,
/// at least `1Gi`. Integer arithmetic only.
pub fn calculate_pvc_size(size: i64) -> Result<String> {
    ensure!(size > 0, InvalidSizeSnafu { size });
    ensure!(size <= MAX_SAFE_SIZE, SizeTooLargeSnafu { size });

    let buffered = size * 11 / 10;
    let mut gib = buffered / GIB;
    if buffered % GIB > 0 {
        gib += 1;
    }
    let gib = gib.max(1);

    debug!(size, buffered, gib, "Calculated PVC size");
    Ok(format!("{gib}Gi"))
}

/// Parse a Kubernetes quantity into a whole number of bytes, rounding fractions up.
/// Only the forms storage requests use are supported (plain, decimal and binary suffixes,
/// optional fraction). Returns `None` for anything else or on overflow.
pub fn parse_quantity(quantity: &Quantity) -> Option<i64> {
    let value = quantity.0.trim();
    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    let multiplier: i64 = match suffix {
        "" => 1,
        "k" => 1000,
        "M" => 1000_i64.pow(2),
        "G" => 1000_i64.pow(3),
        "T" => 1000_i64.pow(4),
        "P" => 1000_i64.pow(5),
        "E" => 1000_i64.pow(6),
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    };

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut bytes = whole.checked_mul(multiplier)?;

    if !fraction.is_empty() {
        let digits: u32 = fraction.len().try_into().ok()?;
        let scale = 10_i64.checked_pow(digits)?;
        let fraction: i64 = fraction.parse().ok()?;
        let scaled = fraction.checked_mul(multiplier)?;
        bytes = bytes.checked_add(scaled / scale + i64::from(scaled % scale > 0))?;
    }

    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gib(size: i64) -> i64 {
        let s = calculate_pvc_size(size).unwrap();
        s.trim_end_matches("Gi").parse().unwrap()
    }

    #[test]
    fn rejects_invalid_sizes() {
        assert!(matches!(calculate_pvc_size(0), Err(crate::AppError::InvalidSize { size: 0 })));
        assert!(calculate_pvc_size(-100).is_err());
        assert!(matches!(
            calculate_pvc_size(MAX_SAFE_SIZE + 1),
            Err(crate::AppError::SizeTooLarge { .. })
        ));
        assert_eq!(calculate_pvc_size(MAX_SAFE_SIZE).unwrap(), "858993460Gi");
    }

    #[test]
    fn small_sizes_get_the_minimum() {
        for size in [1, 1024, 1024 * 1024, 100 * 1024 * 1024, 500 * 1024 * 1024, 976_128_931] {
            assert_eq!(calculate_pvc_size(size).unwrap(), "1Gi", "size {size}");
        }
        // 976_128_931 buffers to exactly 1Gi, one byte more spills past it
        assert_eq!(calculate_pvc_size(976_128_932).unwrap(), "2Gi");
    }

    #[test]
    fn buffer_rounds_up_to_whole_gib() {
        assert_eq!(calculate_pvc_size(GIB).unwrap(), "2Gi");
        assert_eq!(calculate_pvc_size(GIB + 1).unwrap(), "2Gi");
        assert_eq!(calculate_pvc_size(1536 * 1024 * 1024).unwrap(), "2Gi");
        assert_eq!(calculate_pvc_size(2 * GIB).unwrap(), "3Gi");
        assert_eq!(calculate_pvc_size(5 * GIB).unwrap(), "6Gi");
        assert_eq!(calculate_pvc_size(10 * GIB).unwrap(), "11Gi");
        assert_eq!(calculate_pvc_size(100 * GIB).unwrap(), "110Gi");
    }

    #[test]
    fn size_is_monotonic() {
        let samples = [
            1,
            976_128_930,
            976_128_931,
            GIB - 1,
            GIB,
            GIB + 1,
            3 * GIB / 2,
            7 * GIB,
            7 * GIB + 1,
            1 << 40,
            MAX_SAFE_SIZE - 1,
            MAX_SAFE_SIZE,
        ];
        for pair in samples.windows(2) {
            assert!(gib(pair[0]) <= gib(pair[1]), "{} vs {}", pair[0], pair[1]);
        }
    }

    // The local-model path used to skip the overflow guard and wrap around for huge sizes.
    // Both paths now share this validating version, so those sizes are an error instead.
    #[test]
    fn local_model_sizes_past_the_guard_are_rejected() {
        assert!(calculate_pvc_size(i64::MAX).is_err());
        assert!(calculate_pvc_size(i64::MAX / 10).is_err());
    }

    #[test]
    fn parses_storage_quantities() {
        let q = |x: &str| parse_quantity(&Quantity(x.to_string()));
        assert_eq!(q("6Gi"), Some(6 * GIB));
        assert_eq!(q("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(q("1G"), Some(1_000_000_000));
        assert_eq!(q("1.5Gi"), Some(3 * GIB / 2));
        assert_eq!(q("1234"), Some(1234));
        assert_eq!(q("0.1Ki"), Some(103));
        assert_eq!(q("10Xi"), None);
        assert_eq!(q("Gi"), None);
        assert_eq!(q("9999999Ei"), None);
    }
}
