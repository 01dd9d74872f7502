//! Domain-name normalisation for submitted work lists.

use std::collections::HashSet;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Check that a (normalised, lowercase) name is hostname-shaped:
/// at least two labels, the last of which is two or more letters.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || !labels.iter().all(|l| is_valid_label(l)) {
        return false;
    }

    labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Trim, lowercase, drop invalid entries and deduplicate, keeping the first
/// occurrence of each domain in input order.
pub fn normalize_domains<S: AsRef<str>>(domains: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    domains
        .iter()
        .map(|d| d.as_ref().trim().to_ascii_lowercase())
        .filter(|d| is_valid_domain(d))
        .filter(|d| seen.insert(d.clone()))
        .collect()
}

/// Filesystem-safe form of a domain: dots become dashes.
pub fn sanitize_domain(domain: &str) -> String {
    domain.replace('.', "-")
}

/// Best-effort reversal of [`sanitize_domain`].
///
/// Lossy for domains that already contain dashes.
pub fn unsanitize_domain(name: &str) -> String {
    name.replace('-', ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_hostnames() {
        assert!(is_valid_domain("acme.com"));
        assert!(is_valid_domain("my-site.co.uk"));
        assert!(is_valid_domain("app.eu.example.io"));
        assert!(is_valid_domain("123.example.org"));
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(!is_valid_domain("bad"));
        assert!(!is_valid_domain("bad_domain"));
        assert!(!is_valid_domain("acme.c"));
        assert!(!is_valid_domain("acme.c0m"));
        assert!(!is_valid_domain("-acme.com"));
        assert!(!is_valid_domain("acme..com"));
        assert!(!is_valid_domain(".com"));
        assert!(!is_valid_domain(""));
    }

    #[test]
    fn dedupes_case_insensitively_in_order() {
        let input = ["Foo.com", " foo.com ", "bad", "bar.io", "FOO.COM"];
        assert_eq!(normalize_domains(&input), vec!["foo.com", "bar.io"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let input: [&str; 0] = [];
        assert!(normalize_domains(&input).is_empty());
    }

    #[test]
    fn sanitizing_is_reversible_for_plain_domains() {
        assert_eq!(sanitize_domain("www.acme.com"), "www-acme-com");
        assert_eq!(unsanitize_domain("www-acme-com"), "www.acme.com");
        assert_eq!(unsanitize_domain(&sanitize_domain("my-site.com")), "my.site.com");
    }
}
