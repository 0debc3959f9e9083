/// Characters that are never allowed inside a stored path segment.
pub const FORBIDDEN_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Normalise an arbitrary user-supplied string into a single path segment.
///
/// Leading and trailing whitespace is trimmed, each forbidden character is
/// replaced with `_`, and every run of whitespace collapses into one `_`.
/// The result is safe as a filesystem segment and as a quoted literal in a
/// provider query. Empty input yields an empty string; deciding whether an
/// empty segment is acceptable is left to the caller.
pub fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_whitespace = false;
    for c in value.trim().chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
                in_whitespace = true;
            }
            continue;
        }
        in_whitespace = false;
        if FORBIDDEN_CHARS.contains(&c) {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}
