#[cfg(test)]
mod tests {
    use crate::encoding::{
        EncodingError, decode_fixed64_at, get_fixed32, get_fixed64, get_length_prefixed_slice,
        put_fixed32, put_fixed64, put_length_prefixed_slice,
    };

    #[test]
    fn fixed32_round_trip() {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, 0);
        put_fixed32(&mut buf, 0xDEAD_BEEF);
        put_fixed32(&mut buf, u32::MAX);

        let mut input = buf.as_slice();
        assert_eq!(get_fixed32(&mut input).unwrap(), 0);
        assert_eq!(get_fixed32(&mut input).unwrap(), 0xDEAD_BEEF);
        assert_eq!(get_fixed32(&mut input).unwrap(), u32::MAX);
        assert!(input.is_empty());
    }

    #[test]
    fn fixed64_round_trip() {
        let mut buf = Vec::new();
        put_fixed64(&mut buf, 1);
        put_fixed64(&mut buf, u64::MAX - 1);

        let mut input = buf.as_slice();
        assert_eq!(get_fixed64(&mut input).unwrap(), 1);
        assert_eq!(get_fixed64(&mut input).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn fixed_encoding_is_little_endian() {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, 0x0102_0304);
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn length_prefixed_round_trip() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, b"hello").unwrap();
        put_length_prefixed_slice(&mut buf, b"").unwrap();

        let mut input = buf.as_slice();
        assert_eq!(get_length_prefixed_slice(&mut input).unwrap(), b"hello");
        assert_eq!(get_length_prefixed_slice(&mut input).unwrap(), b"");
        assert!(input.is_empty());
    }

    #[test]
    fn truncated_fixed64_is_eof() {
        let mut input: &[u8] = &[0x01, 0x02, 0x03];
        let err = get_fixed64(&mut input).unwrap_err();
        assert!(matches!(
            err,
            EncodingError::UnexpectedEof {
                needed: 8,
                available: 3
            }
        ));
    }

    #[test]
    fn truncated_blob_is_eof() {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, 100);
        buf.extend_from_slice(b"short");

        let mut input = buf.as_slice();
        assert!(matches!(
            get_length_prefixed_slice(&mut input),
            Err(EncodingError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn decode_at_offset() {
        let mut buf = vec![0xFF; 4];
        put_fixed64(&mut buf, 42);
        assert_eq!(decode_fixed64_at(&buf, 4).unwrap(), 42);
        assert!(decode_fixed64_at(&buf, 5).is_err());
    }
}
