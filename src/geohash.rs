//! Geohash quantization of coordinates into fixed-size cells.

use crate::domain::CellKey;
use crate::error::RarityError;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub const MAX_PRECISION: usize = 12;

/// Geohash precision in characters, 1..=12. Precision 4 is roughly a 40 km cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision(usize);

impl Precision {
    pub fn new(chars: usize) -> Result<Self, RarityError> {
        if chars == 0 || chars > MAX_PRECISION {
            return Err(RarityError::InvalidConfig(format!(
                "geohash precision must be between 1 and {MAX_PRECISION}, got {chars}"
            )));
        }
        Ok(Self(chars))
    }

    pub fn chars(&self) -> usize {
        self.0
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self(4)
    }
}

/// Encodes a validated coordinate pair. Bits alternate longitude/latitude,
/// starting with longitude, five bits per output character.
pub fn cell_key(latitude: f64, longitude: f64, precision: Precision) -> CellKey {
    let mut lat = (-90.0_f64, 90.0_f64);
    let mut lon = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision.chars());
    let mut even = true;
    let mut bit = 0u8;
    let mut index = 0usize;

    while hash.len() < precision.chars() {
        let (range, value) = if even {
            (&mut lon, longitude)
        } else {
            (&mut lat, latitude)
        };
        let mid = (range.0 + range.1) / 2.0;
        index <<= 1;
        if value >= mid {
            index |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even = !even;

        bit += 1;
        if bit == 5 {
            hash.push(BASE32[index] as char);
            bit = 0;
            index = 0;
        }
    }

    CellKey::from_geohash(hash)
}
