use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left intact by query component encoding.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encodes a query component, keeping the RFC 3986 unreserved characters.
pub fn encode_url_component(component: &str) -> String {
    utf8_percent_encode(component, QUERY_COMPONENT).to_string()
}
