use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER};
use tracing::{info, warn};

/// Parse a header string in format "Name: Value" and add it to the HeaderMap
pub fn parse_and_add_header(headers: &mut HeaderMap, header_str: &str) {
    let Some((name, value)) = header_str.split_once(':') else {
        warn!("Invalid header format: '{header_str}'. Expected 'Name: Value'");
        return;
    };
    let (name, value) = (name.trim(), value.trim());

    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        warn!("Invalid header name: '{name}'");
        return;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        warn!("Invalid header value for '{name}'");
        return;
    };

    info!("Adding header: {name}");
    headers.insert(header_name, header_value);
}

/// Parse a collection of header strings and return a HeaderMap
pub fn parse_headers(header_strings: &[String]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for header_str in header_strings {
        parse_and_add_header(&mut headers, header_str);
    }
    headers
}

/// Request headers from `-H` values plus the dedicated `--origin` and
/// `--referer` flags, which win over a `-H` header of the same name.
pub fn build_headers(
    header_strings: &[String],
    origin: Option<&str>,
    referer: Option<&str>,
) -> HeaderMap {
    let mut headers = parse_headers(header_strings);
    for (name, value) in [(ORIGIN, origin), (REFERER, referer)] {
        let Some(value) = value else { continue };
        match HeaderValue::from_str(value.trim()) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => warn!("Invalid {name} header value: '{value}'"),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&[
            "Cookie: session=abc".to_string(),
            "X-Forwarded-For:127.0.0.1".to_string(),
            "no colon here".to_string(),
            "Bad Name: x".to_string(),
        ]);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("cookie").unwrap(), "session=abc");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "127.0.0.1");
    }

    #[test]
    fn test_value_may_contain_colons() {
        let headers = parse_headers(&["Referer: https://example.com:8443/".to_string()]);
        assert_eq!(headers.get(REFERER).unwrap(), "https://example.com:8443/");
    }

    #[test]
    fn test_origin_and_referer_override() {
        let headers = build_headers(
            &["Referer: https://old.example.com/".to_string()],
            Some("https://example.com"),
            Some("https://example.com/watch"),
        );

        assert_eq!(headers.get(ORIGIN).unwrap(), "https://example.com");
        assert_eq!(headers.get(REFERER).unwrap(), "https://example.com/watch");
    }
}
