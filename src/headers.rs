//! Header names the helper routes on, and the allow-lists applied in both
//! directions

use hyper::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};

/// Upstream host the request is routed to
pub const SURGE_HOST: &str = "x-surge-host";

/// Upstream port the request is routed to
pub const SURGE_PORT: &str = "x-surge-port";

/// Surge HTTP API key
pub const API_KEY: &str = "x-key";

/// Every genuine Surge response carries this header
pub const IDENTITY_MARKER: &str = "x-surge-version";

/// Header added to every response the helper produces itself or forwards
pub const POWERED_BY: &str = "x-powered-by";

/// Request headers forwarded upstream. Everything else is dropped,
/// including the routing headers.
pub const REQUEST_HEADER_ALLOW_LIST: [&str; 4] = [API_KEY, "user-agent", "host", "connection"];

/// Response headers copied back to the client
pub const RESPONSE_HEADER_ALLOW_LIST: [&str; 3] = ["x-system", "x-surge-build", IDENTITY_MARKER];

/// Headers every CORS request may carry
pub const CORS_DEFAULT_HEADERS: [&str; 4] = ["accept", "authorization", "content-type", "if-none-match"];

/// Extra headers browsers are allowed to send cross-origin
pub const CORS_EXTRA_HEADERS: [&str; 3] = [API_KEY, SURGE_HOST, SURGE_PORT];

/// Copy the headers named in `allow` from `source`, keeping repeated values
pub fn filter_headers(source: &HeaderMap, allow: &[&str]) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in source.iter() {
        if allow.contains(&name.as_str()) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Value of the [`POWERED_BY`] header for a given release
pub fn powered_by(name: &str, version: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!("{}/{}", name, version))
}

/// `names` as header names for the CORS layer
pub(crate) fn header_names(names: &[&'static str]) -> Vec<HeaderName> {
    names.iter().copied().map(HeaderName::from_static).collect()
}
