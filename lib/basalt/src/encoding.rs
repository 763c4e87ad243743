/// Base64 helpers shared by the persistence layer.
pub mod base64 {
    /// Encodes the supplied bytes as standard base64.
    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    /// Decodes standard base64, rejecting malformed input.
    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_roundtrip() {
        let data = b"\x00\x01\xfftail";

        let encoded = base64::encode(&data[..]);
        let decoded = base64::decode(&encoded).unwrap();

        assert_eq!(&decoded[..], &data[..]);
    }

    #[test]
    fn test_decode_malformed() {
        assert!(base64::decode("not*base64").is_err());
    }
}
