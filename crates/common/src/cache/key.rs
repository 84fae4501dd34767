//! Cache key derivation

/// Key for a `(method, path, params)` triple.
///
/// Query parameters are sorted so that `?b=2&a=1` and `?a=1&b=2` share an
/// entry. Fragments are dropped.
pub fn cache_key(method: &str, path: &str) -> String {
    let path = path.split('#').next().unwrap_or_default();
    let (base, query) = match path.split_once('?') {
        Some((base, query)) => (base, query),
        None => (path, ""),
    };

    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    params.sort_unstable();

    let method = method.to_ascii_uppercase();
    if params.is_empty() {
        format!("{method} {base}")
    } else {
        format!("{method} {base}?{}", params.join("&"))
    }
}
