use std::collections::{HashMap, hash_map};

/// Key-value metadata carried alongside a message body.
///
/// Keys are case-insensitive: they are canonicalized to the MIME header form
/// (first letter and every letter following a `-` uppercased, the rest
/// lowercased) on every access, so `content-encoding`, `CONTENT-ENCODING`,
/// and `Content-Encoding` all address the same entry. Each key maps to an
/// ordered list of values.
///
/// Cloning an `Attributes` produces a deep copy: the value lists of the
/// clone are independently owned and mutations on either side are invisible
/// to the other.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    inner: HashMap<String, Vec<String>>,
}

/// Canonicalizes a key to its MIME header form.
///
/// Keys containing bytes that are not valid header token characters are
/// returned verbatim.
fn canonical_key(key: &str) -> String {
    if !key.bytes().all(is_token_char) {
        return key.to_owned();
    }

    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for b in key.bytes() {
        let b = if upper {
            b.to_ascii_uppercase()
        } else {
            b.to_ascii_lowercase()
        };
        upper = b == b'-';
        out.push(b as char);
    }
    out
}

/// Header token characters per RFC 7230.
fn is_token_char(b: u8) -> bool {
    const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={} \t";
    b > b' ' && b < 0x7f && !SEPARATORS.contains(&b)
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value associated with `key`, or `""` when the key
    /// is absent.
    pub fn get(&self, key: &str) -> &str {
        self.inner
            .get(&canonical_key(key))
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Returns every value associated with `key`.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.inner
            .get(&canonical_key(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Associates `key` with the single element `value`, replacing any
    /// existing values.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner.insert(canonical_key(key), vec![value.into()]);
    }

    /// Appends `value` to the list associated with `key`.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.inner
            .entry(canonical_key(key))
            .or_default()
            .push(value.into());
    }

    /// Removes `key` and its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.inner.remove(&canonical_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(&canonical_key(key))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over `(canonical key, values)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.inner
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = (&'a String, &'a Vec<String>);
    type IntoIter = hash_map::Iter<'a, String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
