use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'`^{}|]+"#).unwrap());

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Extract the distinct `http://` and `https://` URLs in free text, sorted.
///
/// Scheme-less links are ignored. Sentence punctuation and unbalanced closing
/// brackets at the end of a match are not part of the URL.
#[must_use]
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_RE
        .find_iter(text)
        .map(|m| trim_trailing(m.as_str()))
        .filter(|candidate| is_url(candidate))
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn trim_trailing(mut candidate: &str) -> &str {
    loop {
        let Some(last) = candidate.chars().last() else {
            return candidate;
        };
        let unbalanced = match last {
            ')' => candidate.matches('(').count() < candidate.matches(')').count(),
            ']' => candidate.matches('[').count() < candidate.matches(']').count(),
            c => TRAILING_PUNCTUATION.contains(&c),
        };
        if !unbalanced {
            return candidate;
        }
        candidate = &candidate[..candidate.len() - last.len_utf8()];
    }
}

fn is_url(candidate: &str) -> bool {
    Url::parse(candidate).is_ok_and(|url| url.host_str().is_some_and(|host| !host.is_empty()))
}
