//! Mapping between server folder names and file system names
//!
//! `:`, `%` and `;` cannot be used safely in file names, so each is replaced
//! by `%<hex>;`, where `<hex>` is its lowercase Unicode code point.
//! `/` is kept: nested folders become nested directories.

/// Characters that are escaped in file names
const INVALID_FILENAME_CHARACTERS: [char; 3] = [':', '%', ';'];

/// Escape the characters that cannot appear in a file name
pub fn to_local_path(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if INVALID_FILENAME_CHARACTERS.contains(&c) {
            escaped.push_str(&format!("%{:x};", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Replace `%<hex>;` sequences with the characters they encode
///
/// Sequences that are not valid hex code points are left as they are.
pub fn from_local_path(name: &str) -> String {
    let mut decoded = String::with_capacity(name.len());
    let mut rest = name;

    while let Some(start) = rest.find('%') {
        decoded.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        match after.find(';').and_then(|end| decode_escape(&after[..end]).map(|c| (c, end))) {
            Some((c, end)) => {
                decoded.push(c);
                rest = &after[end + 1..];
            }
            None => {
                decoded.push('%');
                rest = after;
            }
        }
    }

    decoded.push_str(rest);
    decoded
}

fn decode_escape(hex: &str) -> Option<char> {
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}
