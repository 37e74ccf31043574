use std::io::Read;
use std::path::Path;

use crc::{CRC_64_XZ, Crc};

use crate::TransferError;

/// CRC-64/XZ, the reflected ECMA-182 polynomial object stores report.
pub(crate) static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Reflected ECMA-182 polynomial.
const POLY_REFLECTED: u64 = 0xC96C_5795_D787_0F42;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes the CRC-64 of `data`.
pub fn crc64_bytes(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Computes the CRC-64 of an entire file.
pub fn crc64_file(path: &Path) -> Result<u64, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut digest = CRC64.digest();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finalize())
}

// ---------------------------------------------------------------------------
// Combination
// ---------------------------------------------------------------------------

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0u64;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for (slot, &row) in square.iter_mut().zip(mat.iter()) {
        *slot = gf2_matrix_times(mat, row);
    }
}

/// Returns the CRC-64 of `A || B` given `crc(A)`, `crc(B)` and `len(B)`.
pub fn crc64_combine(mut crc1: u64, crc2: u64, mut len2: u64) -> u64 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u64; 64];
    let mut odd = [0u64; 64];

    // Operator for one zero bit.
    odd[0] = POLY_REFLECTED;
    let mut row = 1u64;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    // Two zero bits, then four.
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    // Apply len2 zero bytes to crc1, squaring the operator per bit of len2.
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

/// Folds `(crc, len)` pairs, in order, into the CRC of their concatenation.
pub fn crc64_combine_all<I>(parts: I) -> u64
where
    I: IntoIterator<Item = (u64, u64)>,
{
    parts
        .into_iter()
        .fold(0, |acc, (crc, len)| crc64_combine(acc, crc, len))
}
