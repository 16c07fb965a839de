//! Canonical binary encoding of wire and storage values

use crate::{CoreError, CoreResult};

/// Upper bound on a single decoded value (wire messages and stored rows)
pub const MAX_ENCODED_SIZE: usize = 16 * 1024 * 1024;

pub fn encode<T: bincode::Encode>(value: &T) -> CoreResult<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

/// Decode a value, rejecting oversized input and trailing bytes
pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> CoreResult<T> {
    let config = bincode::config::standard().with_limit::<MAX_ENCODED_SIZE>();
    let (value, read) = bincode::decode_from_slice(bytes, config)?;
    if read != bytes.len() {
        return Err(CoreError::Deserialization(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlsKeyPair, Vote, VoteKind};

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let key = BlsKeyPair::from_seed(b"v0").unwrap();
        let vote = Vote::signed(VoteKind::Prevote, 1, 0, None, 0, &key).unwrap();
        let mut bytes = encode(&vote).unwrap();

        assert_eq!(decode::<Vote>(&bytes).unwrap(), vote);

        bytes.push(0);
        assert!(matches!(
            decode::<Vote>(&bytes),
            Err(CoreError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<Vote>(&[0xff, 0xff, 0xff]).is_err());
        assert!(decode::<Vote>(&[]).is_err());
    }
}
