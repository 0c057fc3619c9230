//! Ingress-path rewriting of HTML responses
//!
//! When the gateway is reached through an ingress path prefix, the UI's
//! relative asset URLs would miss that prefix. HTML documents carrying a
//! `<base href="...">` tag get the prefix spliced into the href, preceded
//! by a small client-side script that rewrites dynamic requests the same
//! way.

const BASE_HREF_MARKER: &[u8] = b"<base href=\"";

/// Client-side request rewriter, pre-minified. It expects the prefix
/// variable established inline right before it.
const PREFIX_SCRIPT: &str = include_str!("rewrite_prefix.min.js");

fn fix_requests_script(ingress_path: &str) -> String {
    format!(
        "<script>const __wrapperPrefix__=\"{}\";{}</script>",
        ingress_path,
        PREFIX_SCRIPT.trim_end()
    )
}

/// Strip a single trailing slash; the ingress supplies paths both with and
/// without one.
pub fn normalize_ingress_path(raw: &str) -> &str {
    raw.strip_suffix('/').unwrap_or(raw)
}

/// Splice the ingress prefix into the first `<base href="` occurrence,
/// preceded by the request-rewriter script. Returns `None` when the
/// document carries no marker.
pub fn inject_prefix(body: &[u8], ingress_path: &str) -> Option<Vec<u8>> {
    let at = find(body, BASE_HREF_MARKER)?;
    let script = fix_requests_script(ingress_path);

    let mut out = Vec::with_capacity(body.len() + script.len() + ingress_path.len());
    out.extend_from_slice(&body[..at]);
    out.extend_from_slice(script.as_bytes());
    out.extend_from_slice(BASE_HREF_MARKER);
    out.extend_from_slice(ingress_path.as_bytes());
    out.extend_from_slice(&body[at + BASE_HREF_MARKER.len()..]);
    Some(out)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ingress_path() {
        assert_eq!(normalize_ingress_path("/ingress/abc/"), "/ingress/abc");
        assert_eq!(normalize_ingress_path("/ingress/abc"), "/ingress/abc");
        assert_eq!(normalize_ingress_path(""), "");
        assert_eq!(normalize_ingress_path("/"), "");
    }

    #[test]
    fn test_inject_prefix_rewrites_base_href() {
        let body = br#"<html><head><base href="https://x/"></head></html>"#;
        let out = inject_prefix(body, "/ingress/abc").unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains(r#"const __wrapperPrefix__="/ingress/abc";"#));
        assert!(out.contains(r#"<base href="/ingress/abchttps://x/">"#));
        // The script lands immediately before the rewritten tag
        let script_at = out.find("<script>").unwrap();
        let base_at = out.find("<base href=").unwrap();
        assert!(script_at < base_at);
    }

    #[test]
    fn test_inject_prefix_only_touches_first_marker() {
        let body = br#"<base href="/one/"><base href="/two/">"#;
        let out = inject_prefix(body, "/p").unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains(r#"<base href="/p/one/">"#));
        assert!(out.contains(r#"<base href="/two/">"#));
        assert_eq!(out.matches("<script>").count(), 1);
    }

    #[test]
    fn test_document_without_marker_is_left_alone() {
        assert!(inject_prefix(b"<html><body>plain</body></html>", "/p").is_none());
    }

    #[test]
    fn test_script_carries_minified_rewriter() {
        let script = fix_requests_script("/p");
        assert!(script.starts_with("<script>"));
        assert!(script.ends_with("</script>"));
        assert!(script.contains("window.fetch"));
        assert!(script.contains("XMLHttpRequest.prototype.open"));
        assert!(script.contains("window.WebSocket"));
        assert!(!script.contains('\n'));
    }
}
