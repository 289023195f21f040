//! Bit-packed syndrome shots.

use anyhow::{Context, Result, bail};
use bitvec::prelude::*;
use mwpm_core::VertexIndex;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

/// Loads a Stim .b8 file (binary measurement data).
pub fn load_b8_file<P: AsRef<Path>>(path: P) -> Result<BitVec<u8, Lsb0>> {
    let mut file = File::open(path).context("Failed to open .b8 file")?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    // Stim packs bits least significant first
    Ok(BitVec::<u8, Lsb0>::from_vec(buffer))
}

/// Splits raw bits into shots of `bits_per_shot` detectors and returns the
/// set bits of each shot as a sorted defect list. A trailing partial shot
/// is an error.
pub fn slice_shots(raw_bits: &BitSlice<u8, Lsb0>, bits_per_shot: usize) -> Result<Vec<Vec<VertexIndex>>> {
    if bits_per_shot == 0 {
        bail!("shots must hold at least one detector");
    }
    let stride_bits = bits_per_shot.div_ceil(8) * 8;
    if raw_bits.len() % stride_bits != 0 {
        bail!(
            "{} bytes is not a whole number of {}-byte shots",
            raw_bits.len() / 8,
            stride_bits / 8
        );
    }

    Ok(raw_bits
        .chunks_exact(stride_bits)
        .map(|shot| shot[..bits_per_shot].iter_ones().collect())
        .collect())
}

/// Packs defect lists into the .b8 layout.
pub fn pack_shots(shots: &[Vec<VertexIndex>], bits_per_shot: usize) -> Result<Vec<u8>> {
    let stride_bits = bits_per_shot.div_ceil(8) * 8;
    let mut bits: BitVec<u8, Lsb0> = BitVec::repeat(false, stride_bits * shots.len());
    for (index, shot) in shots.iter().enumerate() {
        for &defect in shot {
            if defect >= bits_per_shot {
                bail!("shot {}: defect {} exceeds {} detectors", index, defect, bits_per_shot);
            }
            bits.set(index * stride_bits + defect, true);
        }
    }
    Ok(bits.into_vec())
}

pub fn save_b8_file<P: AsRef<Path>>(path: P, shots: &[Vec<VertexIndex>], bits_per_shot: usize) -> Result<()> {
    let path = path.as_ref();
    let bytes = pack_shots(shots, bits_per_shot)?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shots_are_byte_aligned() {
        let shots = vec![vec![0, 9], vec![], vec![3, 4, 5]];
        let bytes = pack_shots(&shots, 10).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes[0], 0b0000_0001);
        assert_eq!(bytes[1], 0b0000_0010);
        let bits = BitVec::<u8, Lsb0>::from_vec(bytes);
        assert_eq!(slice_shots(&bits, 10).unwrap(), shots);
    }

    #[test]
    fn rejects_partial_shot() {
        let bits = BitVec::<u8, Lsb0>::from_vec(vec![0u8; 3]);
        assert!(slice_shots(&bits, 10).is_err());
        assert!(pack_shots(&[vec![12]], 10).is_err());
    }

    #[test]
    fn file_round_trip() {
        let path = std::env::temp_dir().join(format!("mwpm_io_loader_{}.b8", std::process::id()));
        save_b8_file(&path, &[vec![1, 2]], 4).unwrap();
        let bits = load_b8_file(&path).unwrap();
        assert_eq!(slice_shots(&bits, 4).unwrap(), vec![vec![1, 2]]);
        let _ = std::fs::remove_file(&path);
    }
}
