//! Header rewriting for forwarded requests and relayed responses

use hyper::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, CONNECTION, PRAGMA, PROXY_AUTHORIZATION,
    SERVER, STRICT_TRANSPORT_SECURITY, USER_AGENT, VIA, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
    X_XSS_PROTECTION,
};

/// Sent when the client did not supply its own user agent
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded-proto",
    "proxy-connection",
];

const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "x-powered-by",
    "x-aspnet-version",
    "x-aspnetmvc-version",
];

/// Remove identifying headers from a client request before it goes upstream
pub fn sanitize_request(headers: &mut HeaderMap) {
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(VIA);
    for name in STRIPPED_REQUEST_HEADERS {
        headers.remove(*name);
    }

    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }

    if !headers.contains_key(CONNECTION) {
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
}

/// Strip origin fingerprints and force no-cache; TLS endpoints add hardening headers
pub fn sanitize_response(headers: &mut HeaderMap, tls_terminated: bool) {
    headers.remove(SERVER);
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(*name);
    }

    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

    if tls_terminated {
        augment_tls_response(headers);
    }
}

fn augment_tls_response(headers: &mut HeaderMap) {
    headers.insert(
        STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.append(*k, HeaderValue::from_static(v));
        }
        headers
    }

    #[test]
    fn test_request_strips_and_defaults() {
        let mut headers = map(&[
            ("proxy-authorization", "Basic abc"),
            ("x-forwarded-for", "1.2.3.4"),
            ("x-real-ip", "1.2.3.4"),
            ("via", "1.1 other"),
            ("accept", "*/*"),
        ]);
        sanitize_request(&mut headers);

        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("x-forwarded-for").is_none());
        assert!(headers.get("x-real-ip").is_none());
        assert!(headers.get("via").is_none());
        assert_eq!(headers["accept"], "*/*");
        assert_eq!(headers[USER_AGENT], DEFAULT_USER_AGENT);
        assert_eq!(headers[CONNECTION], "keep-alive");
    }

    #[test]
    fn test_request_keeps_client_values() {
        let mut headers = map(&[("user-agent", "curl/8.0"), ("connection", "close")]);
        sanitize_request(&mut headers);
        assert_eq!(headers[USER_AGENT], "curl/8.0");
        assert_eq!(headers[CONNECTION], "close");
    }

    #[test]
    fn test_response_plain_and_tls() {
        let origin = map(&[
            ("server", "nginx/1.25"),
            ("x-powered-by", "PHP/8"),
            ("x-aspnet-version", "4.0"),
            ("cache-control", "max-age=600"),
            ("content-type", "text/html"),
        ]);

        let mut plain = origin.clone();
        sanitize_response(&mut plain, false);
        assert!(plain.get(SERVER).is_none());
        assert!(plain.get("x-powered-by").is_none());
        assert!(plain.get("x-aspnet-version").is_none());
        assert_eq!(plain[CACHE_CONTROL], "no-cache, no-store, must-revalidate");
        assert_eq!(plain[PRAGMA], "no-cache");
        assert_eq!(plain["content-type"], "text/html");
        assert!(plain.get(STRICT_TRANSPORT_SECURITY).is_none());

        let mut tls = origin;
        sanitize_response(&mut tls, true);
        assert_eq!(tls[STRICT_TRANSPORT_SECURITY], "max-age=31536000; includeSubDomains");
        assert_eq!(tls[X_FRAME_OPTIONS], "DENY");
        assert_eq!(tls[X_CONTENT_TYPE_OPTIONS], "nosniff");
    }
}
