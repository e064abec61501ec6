//! Property tests for the page-body merge.
//!
//! Generated surrounding text and payloads never contain `:` or `]`, so they
//! cannot form macro tags or close a CDATA section.

use confdoc_core::digest::digest;
use confdoc_core::macros::{MacroKind, build, locate};
use confdoc_core::merge::merge;
use proptest::prelude::*;

const NOW: &str = "2024-03-05, 4:07:09pm";
const LATER: &str = "2024-03-06, 10:15:00am";

fn arb_kind() -> impl Strategy<Value = MacroKind> {
    prop_oneof![
        Just(MacroKind::Code),
        Just(MacroKind::Html),
        Just(MacroKind::Panel),
    ]
}

fn arb_file() -> impl Strategy<Value = String> {
    "/[a-z]{1,8}/[a-z]{1,8}\\.txt"
}

fn arb_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 <>/=\n]{0,40}"
}

fn arb_content() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 <>/=\"\n]{0,80}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn merging_twice_is_a_no_op(
        kind in arb_kind(),
        file in arb_file(),
        prefix in arb_text(),
        content in arb_content(),
    ) {
        let first = merge(&file, Some(prefix.as_str()), &content, kind, NOW);
        let second = merge(&file, Some(first.body.as_str()), &content, kind, NOW);
        prop_assert_eq!(&second.body, &first.body);
        prop_assert!(!second.changed);
        prop_assert_eq!(second.previous_content.as_deref(), Some(content.as_str()));
    }

    #[test]
    fn replacing_owned_block_keeps_surroundings(
        kind in arb_kind(),
        file in arb_file(),
        prefix in arb_text(),
        suffix in arb_text(),
        old in arb_content(),
        new in arb_content(),
    ) {
        let owned = build(kind, &format!("{file} (earlier)"), &old);
        let body = format!("{prefix}{owned}{suffix}");
        let result = merge(&file, Some(body.as_str()), &new, kind, LATER);

        let expected = format!(
            "{prefix}{}{suffix}",
            build(kind, &format!("{file} ({LATER})"), &new)
        );
        prop_assert_eq!(&result.body, &expected);
        prop_assert_eq!(result.changed, digest(&old) != digest(&new));
    }

    #[test]
    fn foreign_blocks_survive_byte_for_byte(
        kind in arb_kind(),
        other_kind in arb_kind(),
        file in arb_file(),
        prefix in arb_text(),
        other_content in arb_content(),
        content in arb_content(),
    ) {
        let foreign = build(other_kind, "/other/report.log (earlier)", &other_content);
        let body = format!("{prefix}{foreign}");
        let result = merge(&file, Some(body.as_str()), &content, kind, NOW);

        prop_assert!(result.body.starts_with(&body));
        prop_assert!(result.changed);
        let owned = locate(Some(result.body.as_str()), kind)
            .filter(|block| block.title.contains(file.as_str()))
            .collect::<Vec<_>>();
        prop_assert_eq!(owned.len(), 1);
        prop_assert_eq!(owned[0].inner_content, content.as_str());
    }

    #[test]
    fn ownership_ignores_title_case(
        kind in arb_kind(),
        file in arb_file(),
        old in arb_content(),
        new in arb_content(),
    ) {
        let body = build(kind, &format!("{} (earlier)", file.to_uppercase()), &old);
        let result = merge(&file, Some(body.as_str()), &new, kind, NOW);
        prop_assert_eq!(locate(Some(result.body.as_str()), kind).count(), 1);
    }

    #[test]
    fn digest_ignores_line_ending_style(lines in prop::collection::vec("[a-z ]{0,12}", 0..8)) {
        prop_assert_eq!(digest(&lines.join("\n")), digest(&lines.join("\r\n")));
    }
}
