use crc::{Algorithm, Crc};

use crate::frames::trailer::COMM_VERIFICATION_LEN;

/// The CRC-64 used for CD-1.1 comm verification: ISO polynomial, bit-reflected, no initial value
///  or final xor. This is the classic table-driven variant with the reversed polynomial
///  `0xD800000000000000`.
pub const CRC_64_CD11: Algorithm<u64> = Algorithm {
    width: 64,
    poly: 0x000000000000001b,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0x46a5a9388a5beffe,
    residue: 0,
};

static CD11_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_CD11);

/// Computes the checksum of a complete serialized frame. The last 8 bytes (the comm verification
///  field itself) are treated as zero regardless of their content.
pub fn compute_crc(frame: &[u8]) -> u64 {
    let covered = frame.len().saturating_sub(COMM_VERIFICATION_LEN);

    let mut digest = CD11_CRC.digest();
    digest.update(&frame[..covered]);
    digest.update(&[0u8; COMM_VERIFICATION_LEN][..frame.len() - covered]);
    digest.finalize()
}

/// Compares the comm verification field at the end of a serialized frame with the recomputed CRC.
///
/// NB: This is for auditing and diagnostics - a mismatch does not prevent a frame from being
///  processed
pub fn is_valid_crc(frame: &[u8]) -> bool {
    if frame.len() < COMM_VERIFICATION_LEN {
        return false;
    }
    let mut stored = [0u8; COMM_VERIFICATION_LEN];
    stored.copy_from_slice(&frame[frame.len() - COMM_VERIFICATION_LEN..]);
    u64::from_be_bytes(stored) == compute_crc(frame)
}

/// overwrites the last 8 bytes of a serialized frame with its CRC
pub fn patch_crc(frame: &mut [u8]) -> u64 {
    let crc = compute_crc(frame);
    let len = frame.len();
    if len >= COMM_VERIFICATION_LEN {
        frame[len - COMM_VERIFICATION_LEN..].copy_from_slice(&crc.to_be_bytes());
    }
    crc
}
