//! Entry length-prefix framing (spec §4.2, §6.1): `len_bytes` is chosen so
//! `256^len_bytes >= page_size`, i.e. 2 bytes for a 4 KiB page, 1 byte for
//! pages of 256 bytes or less.

/// Number of bytes used to frame an entry's length, for a given page size.
#[must_use]
pub fn len_bytes_for_page_size(page_size: u32) -> usize {
    let mut k = 1u32;
    while 256u64.pow(k) < u64::from(page_size) {
        k += 1;
    }
    k as usize
}

/// Encode `len` as a big-endian fixed-width field of `len_bytes` bytes.
#[must_use]
pub fn encode_len(len: usize, len_bytes: usize) -> Vec<u8> {
    let full = (len as u64).to_be_bytes();
    full[8 - len_bytes..].to_vec()
}

/// Decode a big-endian fixed-width length field.
#[must_use]
pub fn decode_len(bytes: &[u8]) -> usize {
    let mut full = [0u8; 8];
    full[8 - bytes.len()..].copy_from_slice(bytes);
    u64::from_be_bytes(full) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_bytes_matches_spec_examples() {
        assert_eq!(len_bytes_for_page_size(4096), 2);
        assert_eq!(len_bytes_for_page_size(256), 1);
        assert_eq!(len_bytes_for_page_size(128), 1);
        assert_eq!(len_bytes_for_page_size(65535), 2);
    }

    #[test]
    fn len_round_trips() {
        for len_bytes in [1usize, 2, 3] {
            for v in [0usize, 1, 255, 300, 65535] {
                let max = 256usize.saturating_pow(len_bytes as u32).saturating_sub(1);
                if v > max {
                    continue;
                }
                let enc = encode_len(v, len_bytes);
                assert_eq!(enc.len(), len_bytes);
                assert_eq!(decode_len(&enc), v);
            }
        }
    }
}
