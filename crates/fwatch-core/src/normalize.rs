//! Markup and whitespace cleanup for posting description text.

use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

// Every pass shrinks or keeps the text, so the fixpoint is reached quickly.
const MAX_PASSES: usize = 8;

/// Decode entities, drop tags and collapse whitespace.
///
/// Runs to a fixpoint so entity-encoded markup (`&lt;b&gt;`) is removed too and
/// `normalize(normalize(x)) == normalize(x)` holds.
pub fn normalize(raw: &str) -> String {
    let mut current = raw.to_string();
    for _ in 0..MAX_PASSES {
        let next = normalize_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

pub fn normalize_optional(raw: Option<&str>) -> Option<String> {
    raw.map(normalize)
}

fn normalize_pass(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let decoded = decode_entities(text);
    let stripped = TAG.replace_all(&decoded, "");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

// `<` is escaped first so the parser only decodes entities and never consumes
// markup; tag removal stays with TAG.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    Html::parse_fragment(&text.replace('<', "&lt;"))
        .root_element()
        .text()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_collapses_whitespace() {
        assert_eq!(normalize("<b>A</b>  B"), "A B");
        assert_eq!(
            normalize("<p>Serve meals\n\n<br/>at   the\tfacility</p>"),
            "Serve meals at the facility"
        );
    }

    #[test]
    fn decodes_entities() {
        assert_eq!(normalize("Fish &amp; Chips"), "Fish & Chips");
        assert_eq!(normalize("Pay&nbsp;rate: $15"), "Pay rate: $15");
    }

    #[test]
    fn only_complete_tags_are_removed() {
        assert_eq!(normalize("budget <x"), "budget <x");
        assert_eq!(normalize("R&amp;D budget <x"), "R&D budget <x");
        assert_eq!(normalize("R&amp;D <b>budget</b> <x"), "R&D budget <x");
    }

    #[test]
    fn empty_input_is_returned_unchanged() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize_optional(None), None);
        assert_eq!(normalize_optional(Some("")), Some(String::new()));
    }

    #[test]
    fn is_idempotent_on_encoded_markup() {
        for raw in [
            "&lt;b&gt;Cook&lt;/b&gt; wanted",
            "&amp;lt;i&amp;gt;x&amp;lt;/i&amp;gt;",
            "  <div> plain </div> ",
            "Tom &amp; Jerry &lt; 3",
        ] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
            assert!(!once.contains("<b>"));
        }
        assert_eq!(normalize("&lt;b&gt;Cook&lt;/b&gt; wanted"), "Cook wanted");
    }
}
