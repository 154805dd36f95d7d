/// Stable cache key: blake3 over the normalized prompt plus whatever
/// context actually changes the answer (verbosity, retrieval lines).
/// Normalization collapses the differences that never change the answer —
/// case, leading/trailing space, run-length whitespace.
pub fn fingerprint(prompt: &str, context: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize(prompt).as_bytes());
    for line in context {
        hasher.update(b"\n");
        hasher.update(normalize(line).as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::fingerprint;

    #[test]
    fn test_whitespace_and_case_insensitive() {
        let a = fingerprint("What is  the\tmelting point of PLA?", &[]);
        let b = fingerprint("what is the melting point of pla?", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_context_changes_key() {
        let a = fingerprint("status", &["verbosity:1".into()]);
        let b = fingerprint("status", &["verbosity:5".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_prompts_differ() {
        assert_ne!(fingerprint("open the door", &[]), fingerprint("close the door", &[]));
    }
}
