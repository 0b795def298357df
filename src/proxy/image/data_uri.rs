//! `data:` URI 解析

use super::{ImageNotSupportedError, ImagePayload};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use percent_encoding::percent_decode;

/// 解析 `data:<mime>[;base64],<payload>`
///
/// base64 负载去除空白后原样透传（无 padding 的负载会补齐），其余负载先 percent-decode 再编码。
pub fn parse(uri: &str, max_bytes: usize) -> Result<ImagePayload, ImageNotSupportedError> {
    let rest = uri
        .get(..5)
        .filter(|scheme| scheme.eq_ignore_ascii_case("data:"))
        .map(|_| &uri[5..])
        .ok_or_else(|| ImageNotSupportedError::InvalidDataUri("missing data: prefix".into()))?;

    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| ImageNotSupportedError::InvalidDataUri("missing ',' separator".into()))?;

    let mut segments = meta.split(';');
    let mime_type = segments
        .next()
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let is_base64 = segments.any(|s| s.trim().eq_ignore_ascii_case("base64"));

    if !mime_type.starts_with("image/") {
        return Err(ImageNotSupportedError::UnsupportedMime(if mime_type.is_empty() {
            "(none)".to_string()
        } else {
            mime_type
        }));
    }

    let data = if is_base64 {
        normalize_base64(payload, max_bytes)?
    } else {
        let bytes: Vec<u8> = percent_decode(payload.as_bytes()).collect();
        if bytes.is_empty() {
            return Err(ImageNotSupportedError::InvalidDataUri("empty payload".into()));
        }
        if bytes.len() > max_bytes {
            return Err(ImageNotSupportedError::TooLarge { max_bytes });
        }
        STANDARD.encode(bytes)
    };

    Ok(ImagePayload { mime_type, data })
}

fn normalize_base64(payload: &str, max_bytes: usize) -> Result<String, ImageNotSupportedError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ImageNotSupportedError::InvalidDataUri("empty base64 payload".into()));
    }

    // 解码后的长度不会超过 3/4，先粗略拒绝明显超限的负载
    if compact.len() / 4 * 3 > max_bytes.saturating_add(3) {
        return Err(ImageNotSupportedError::TooLarge { max_bytes });
    }

    let (decoded, data) = match STANDARD.decode(&compact) {
        Ok(decoded) => (decoded, compact),
        Err(_) => {
            let decoded = STANDARD_NO_PAD
                .decode(&compact)
                .map_err(|e| ImageNotSupportedError::InvalidDataUri(format!("invalid base64: {e}")))?;
            let data = STANDARD.encode(&decoded);
            (decoded, data)
        }
    };

    if decoded.len() > max_bytes {
        return Err(ImageNotSupportedError::TooLarge { max_bytes });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn test_base64_round_trips_byte_identically() {
        let raw = [0x89u8, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff];
        let encoded = STANDARD.encode(raw);
        let payload = parse(&format!("data:image/png;base64,{encoded}"), MAX).unwrap();

        assert_eq!(payload.mime_type, "image/png");
        assert_eq!(payload.data, encoded);
        assert_eq!(STANDARD.decode(&payload.data).unwrap(), raw);
    }

    #[test]
    fn test_base64_whitespace_is_stripped() {
        let payload = parse("data:image/gif;base64,R0lG\nODlh\r\n AQAB", MAX).unwrap();
        assert_eq!(payload.data, "R0lGODlhAQAB");
        assert!(!payload.data.contains('\n'));
    }

    #[test]
    fn test_unpadded_base64_is_repadded() {
        let payload = parse("data:image/png;base64,AAE", MAX).unwrap();
        assert_eq!(payload.data, "AAE=");
    }

    #[test]
    fn test_mime_is_case_insensitive() {
        let payload = parse("DATA:Image/JPEG;BASE64,AAAA", MAX).unwrap();
        assert_eq!(payload.mime_type, "image/jpeg");
    }

    #[test]
    fn test_rejects_non_image_mime() {
        assert!(matches!(
            parse("data:text/plain;base64,aGVsbG8=", MAX),
            Err(ImageNotSupportedError::UnsupportedMime(m)) if m == "text/plain"
        ));
        assert!(matches!(
            parse("data:;base64,aGVsbG8=", MAX),
            Err(ImageNotSupportedError::UnsupportedMime(_))
        ));
    }

    #[test]
    fn test_rejects_empty_and_invalid_base64() {
        assert!(matches!(
            parse("data:image/png;base64,", MAX),
            Err(ImageNotSupportedError::InvalidDataUri(_))
        ));
        assert!(matches!(
            parse("data:image/png;base64,@@@@", MAX),
            Err(ImageNotSupportedError::InvalidDataUri(_))
        ));
        assert!(matches!(
            parse("data:image/png;base64", MAX),
            Err(ImageNotSupportedError::InvalidDataUri(_))
        ));
    }

    #[test]
    fn test_percent_encoded_payload_is_base64_encoded() {
        let payload = parse("data:image/svg+xml,%3Csvg%2F%3E", MAX).unwrap();
        assert_eq!(payload.mime_type, "image/svg+xml");
        assert_eq!(STANDARD.decode(&payload.data).unwrap(), b"<svg/>");
    }

    #[test]
    fn test_decoded_size_is_bounded() {
        let encoded = STANDARD.encode(vec![7u8; 64]);
        assert!(matches!(
            parse(&format!("data:image/png;base64,{encoded}"), 32),
            Err(ImageNotSupportedError::TooLarge { max_bytes: 32 })
        ));
        assert!(parse(&format!("data:image/png;base64,{encoded}"), 64).is_ok());
        assert!(matches!(
            parse("data:image/svg+xml,abcdef", 4),
            Err(ImageNotSupportedError::TooLarge { .. })
        ));
    }
}
