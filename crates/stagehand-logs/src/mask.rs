//! Streaming secret masking.
//!
//! The replacer sits between a step's raw output and everything
//! downstream. Matching is byte-level and longest-match; a secret split
//! across two writes is still caught because up to `max_len - 1` trailing
//! bytes are held back until the next write or the final flush.

use std::collections::HashMap;

/// The fixed mask emitted in place of every secret occurrence.
pub const MASK: &str = "**************";

/// Streaming multi-literal replacer.
pub struct Replacer {
    /// Match candidates, longest first.
    secrets: Vec<Vec<u8>>,
    max_len: usize,
    pending: Vec<u8>,
    error: Option<String>,
}

impl Replacer {
    /// Build a replacer over the given secret literals. Empty secrets are
    /// ignored. Multi-line secrets additionally register each of their
    /// line segments so remnants surviving a downstream line split are
    /// still masked.
    pub fn new(secrets: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self::build(secrets, false, &HashMap::new())
    }

    /// Like [`Replacer::new`] but additionally registers normalized
    /// variants of every secret: its URL-encoded form, its JSON-escaped
    /// form, and its shell-variable expansion against `envs`.
    pub fn with_extra_variants(
        secrets: impl IntoIterator<Item = Vec<u8>>,
        envs: &HashMap<String, String>,
    ) -> Self {
        Self::build(secrets, true, envs)
    }

    fn build(
        secrets: impl IntoIterator<Item = Vec<u8>>,
        extra: bool,
        envs: &HashMap<String, String>,
    ) -> Self {
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        let mut error = None;

        for secret in secrets {
            if secret.is_empty() {
                continue;
            }
            push_unique(&mut candidates, secret.clone());

            // Line segments of multi-line secrets.
            if secret.contains(&b'\n') {
                for part in secret.split(|b| *b == b'\n') {
                    let part = part.strip_suffix(b"\r").unwrap_or(part);
                    if !part.is_empty() {
                        push_unique(&mut candidates, part.to_vec());
                    }
                }
            }

            if extra {
                match String::from_utf8(secret.clone()) {
                    Ok(text) => {
                        let url = urlencoding::encode(&text).into_owned();
                        if url != text {
                            push_unique(&mut candidates, url.into_bytes());
                        }
                        if let Ok(json) = serde_json::to_string(&text) {
                            let trimmed = json.trim_matches('"');
                            if trimmed != text {
                                push_unique(&mut candidates, trimmed.as_bytes().to_vec());
                            }
                        }
                        let expanded = expand_shell_vars(&text, envs);
                        if expanded != text && !expanded.is_empty() {
                            push_unique(&mut candidates, expanded.into_bytes());
                        }
                    }
                    Err(_) => {
                        // Non-UTF-8 secrets only match literally.
                        error = Some("non-utf8 secret skipped variant expansion".to_string());
                    }
                }
            }
        }

        candidates.sort_by(|a, b| b.len().cmp(&a.len()));
        let max_len = candidates.first().map(|s| s.len()).unwrap_or(0);

        Self {
            secrets: candidates,
            max_len,
            pending: Vec::new(),
            error,
        }
    }

    /// True when there is nothing to mask; callers may bypass the
    /// replacer entirely.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Error recorded during construction or streaming, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Feed raw bytes, returning the masked bytes that are safe to emit.
    /// Up to `max_len - 1` trailing bytes may be withheld until the next
    /// call or [`Replacer::finish`].
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        if self.secrets.is_empty() {
            return bytes.to_vec();
        }
        self.pending.extend_from_slice(bytes);
        self.scan(false)
    }

    /// Flush the held-back tail. Call exactly once, when the stream ends.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.secrets.is_empty() {
            return Vec::new();
        }
        self.scan(true)
    }

    /// One-shot literal pass over already-captured text. Used as the
    /// close-time fallback over the retained buffer.
    pub fn mask_all(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            let needle = String::from_utf8_lossy(secret);
            if !needle.is_empty() {
                out = out.replace(needle.as_ref(), MASK);
            }
        }
        out
    }

    fn scan(&mut self, final_pass: bool) -> Vec<u8> {
        let pending = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(pending.len());
        let mut i = 0;

        'outer: while i < pending.len() {
            let rest = &pending[i..];
            for secret in &self.secrets {
                if rest.len() >= secret.len() {
                    if &rest[..secret.len()] == secret.as_slice() {
                        out.extend_from_slice(MASK.as_bytes());
                        i += secret.len();
                        continue 'outer;
                    }
                } else if !final_pass && secret.starts_with(rest) {
                    // The tail could be the head of a secret; hold it.
                    break 'outer;
                }
            }
            out.push(pending[i]);
            i += 1;
        }

        if !final_pass {
            self.pending = pending[i..].to_vec();
            debug_assert!(self.pending.len() < self.max_len.max(1));
        }
        out
    }
}

fn push_unique(candidates: &mut Vec<Vec<u8>>, value: Vec<u8>) {
    if !candidates.contains(&value) {
        candidates.push(value);
    }
}

/// Minimal `$VAR` / `${VAR}` expansion against an env map. Unknown
/// variables expand to the empty string.
fn expand_shell_vars(text: &str, envs: &HashMap<String, String>) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            let (name, consumed) = if bytes[i + 1] == b'{' {
                match text[i + 2..].find('}') {
                    Some(end) => (&text[i + 2..i + 2 + end], end + 3),
                    None => {
                        out.push('$');
                        i += 1;
                        continue;
                    }
                }
            } else {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                if end == start {
                    out.push('$');
                    i += 1;
                    continue;
                }
                (&text[start..end], end - i)
            };
            if let Some(value) = envs.get(name) {
                out.push_str(value);
            }
            i += consumed;
        } else {
            out.push(text[i..].chars().next().unwrap_or('\u{FFFD}'));
            i += text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_stream(replacer: &mut Replacer, chunks: &[&[u8]]) -> String {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(replacer.feed(chunk));
        }
        out.extend(replacer.finish());
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_basic_replacement() {
        let mut r = Replacer::new(vec![b"topsecret".to_vec()]);
        let out = mask_stream(&mut r, &[b"hello topsecret world\n"]);
        assert_eq!(out, format!("hello {MASK} world\n"));
    }

    #[test]
    fn test_secret_straddling_write_boundary() {
        let mut r = Replacer::new(vec![b"topsecret".to_vec()]);
        let out = mask_stream(&mut r, &[b"prefix topsec", b"ret suffix"]);
        assert_eq!(out, format!("prefix {MASK} suffix"));
    }

    #[test]
    fn test_partial_tail_flushed_verbatim_on_finish() {
        let mut r = Replacer::new(vec![b"topsecret".to_vec()]);
        let out = mask_stream(&mut r, &[b"ends with topsec"]);
        assert_eq!(out, "ends with topsec");
    }

    #[test]
    fn test_longest_match_wins() {
        let mut r = Replacer::new(vec![b"secret".to_vec(), b"secret-extended".to_vec()]);
        let out = mask_stream(&mut r, &[b"a secret-extended b"]);
        // One mask, not "MASK-extended".
        assert_eq!(out, format!("a {MASK} b"));
    }

    #[test]
    fn test_adjacent_occurrences() {
        let mut r = Replacer::new(vec![b"ab".to_vec()]);
        let out = mask_stream(&mut r, &[b"ababab"]);
        assert_eq!(out, format!("{MASK}{MASK}{MASK}"));
    }

    #[test]
    fn test_empty_secrets_ignored() {
        let mut r = Replacer::new(vec![Vec::new()]);
        assert!(r.is_empty());
        let out = mask_stream(&mut r, &[b"anything"]);
        assert_eq!(out, "anything");
    }

    #[test]
    fn test_multiline_secret_masks_line_segments() {
        let secret = b"line-one\nline-two".to_vec();
        let mut r = Replacer::new(vec![secret]);
        // Downstream split the secret; each remnant still masks.
        let out = mask_stream(&mut r, &[b"saw line-two today"]);
        assert_eq!(out, format!("saw {MASK} today"));
    }

    #[test]
    fn test_mask_all_fallback_pass() {
        let r = Replacer::new(vec![b"hunter2".to_vec()]);
        assert_eq!(r.mask_all("pw is hunter2!"), format!("pw is {MASK}!"));
    }

    #[test]
    fn test_no_secret_bytes_survive_chunked_input() {
        let secret = b"Sup3r-Secret-Value".to_vec();
        let mut r = Replacer::new(vec![secret.clone()]);
        let input = b"x Sup3r-Secret-Value y Sup3r-Secret-Value z";
        // Feed one byte at a time; the worst case for boundary handling.
        let chunks: Vec<&[u8]> = input.chunks(1).collect();
        let out = mask_stream(&mut r, &chunks);
        assert!(!out.contains("Sup3r-Secret-Value"));
        assert_eq!(out, format!("x {MASK} y {MASK} z"));
    }

    #[test]
    fn test_url_encoded_variant() {
        let envs = HashMap::new();
        let mut r = Replacer::with_extra_variants(vec![b"my secret".to_vec()], &envs);
        let out = mask_stream(&mut r, &[b"query=my%20secret done"]);
        assert_eq!(out, format!("query={MASK} done"));
    }

    #[test]
    fn test_json_escaped_variant() {
        let envs = HashMap::new();
        let mut r = Replacer::with_extra_variants(vec![b"tab\there".to_vec()], &envs);
        let out = mask_stream(&mut r, &[br#"{"v":"tab\there"}"#.as_slice()]);
        assert!(out.contains(MASK));
        assert!(!out.contains("tab\\there"));
    }

    #[test]
    fn test_shell_variable_expansion_variant() {
        let mut envs = HashMap::new();
        envs.insert("TOKEN".to_string(), "abc123".to_string());
        let mut r = Replacer::with_extra_variants(vec![b"$TOKEN-suffix".to_vec()], &envs);
        let out = mask_stream(&mut r, &[b"got abc123-suffix here"]);
        assert_eq!(out, format!("got {MASK} here"));
    }

    #[test]
    fn test_expand_shell_vars() {
        let mut envs = HashMap::new();
        envs.insert("A".to_string(), "1".to_string());
        assert_eq!(expand_shell_vars("$A/${A}/$MISSING", &envs), "1/1/");
        assert_eq!(expand_shell_vars("no vars", &envs), "no vars");
        assert_eq!(expand_shell_vars("trailing $", &envs), "trailing $");
    }
}
