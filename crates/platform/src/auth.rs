use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Encodes a `user:secret` pair the way the platform's app gateway expects it.
pub fn encode_auth(username: &str, secret: &str) -> String {
    STANDARD.encode(format!("{username}:{secret}"))
}

/// Decodes an `AUTHORIZATION-APP-API` header into `(username, secret)`.
/// Returns empty strings if the header is not valid base64 `user:secret`.
pub fn decode_auth(header: &str) -> (String, String) {
    let Ok(decoded) = STANDARD.decode(header) else {
        return (String::new(), String::new());
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return (String::new(), String::new());
    };
    match text.split_once(':') {
        Some((user, secret)) => (user.to_string(), secret.to_string()),
        None => (String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_round_trip() {
        let header = encode_auth("admin", "s3cret");
        assert_eq!(decode_auth(&header), ("admin".into(), "s3cret".into()));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_auth("!!not-base64!!"), (String::new(), String::new()));
        let no_colon = STANDARD.encode("justuser");
        assert_eq!(decode_auth(&no_colon), (String::new(), String::new()));
    }
}
