//! Kobo KEPUB sentence segmentation.
//!
//! Kobo readers track reading position and highlighting per `koboSpan`
//! element, so every sentence-like fragment of body text gets wrapped in
//! `<span class="koboSpan" id="kobo.P.S">` where P is a paragraph counter
//! and S a per-paragraph segment counter, both 1-based.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::dom::{Attr, Dom, NodeId};

/// One sentence-like fragment: a lazy run of non-terminal characters, one
/// terminal punctuation mark, then optionally a hair-spaced ellipsis, a
/// close quote, and a hair-spaced right double quote, then trailing
/// whitespace. Text after the last match (no terminal mark) forms the final
/// fragment on its own.
static SENTENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        "[^.!?:]*?[.!?:]",
        "(?:\u{200a}\u{2026})?",
        "['\"\u{201d}\u{2019}]?",
        "(?:\u{200a}\u{201d})?",
        "\\s*"
    ))
    .unwrap()
});

/// Segmentation state threaded explicitly through the recursion so the
/// segmenter is re-entrant. Fresh counters per document.
#[derive(Debug, Clone, Copy)]
struct Counters {
    paragraph: u32,
    segment: u32,
}

impl Counters {
    fn next_id(&mut self) -> String {
        let id = format!("kobo.{}.{}", self.paragraph, self.segment);
        self.segment += 1;
        id
    }

    fn next_paragraph(&mut self) {
        self.paragraph += 1;
        self.segment = 1;
    }
}

/// Wrap sentence fragments across the document body in `koboSpan` spans.
/// Returns the number of spans in the finished document.
pub fn add_spans(dom: &mut Dom) -> usize {
    let Some(body) = dom.find_by_tag("body") else {
        return 0;
    };

    let mut counters = Counters {
        paragraph: 1,
        segment: 1,
    };
    let mut fresh = Vec::new();
    segment_element(dom, body, &mut counters, &mut fresh);
    let merged = merge_nested_spans(dom, &fresh);
    fresh.len() - merged
}

/// Kobo system fonts lack a glyph for the text-presentation return arrow,
/// so endnote referrer backlinks get a guillemet instead.
pub fn swap_referrer_glyph(xhtml: &str) -> String {
    xhtml.replace(
        "epub:type=\"se:referrer\">\u{21a9}\u{fe0e}</a>",
        "epub:type=\"se:referrer\">\u{ab}</a>",
    )
}

/// Split text into fragments whose concatenation is exactly the input.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut cursor = 0;
    for m in SENTENCE_RE.find_iter(text) {
        if m.start() > cursor {
            parts.push(&text[cursor..m.start()]);
        }
        parts.push(m.as_str());
        cursor = m.end();
    }
    if cursor < text.len() {
        parts.push(&text[cursor..]);
    }
    parts
}

/// Leading text is segmented under the current paragraph. Each element
/// child advances the paragraph counter twice when it carries tail text:
/// once before the tail (the tail is its own paragraph group) and once when
/// the child is finished; a child without a tail advances it once. The
/// closing advance is deferred so it lands after the tail.
fn segment_element(
    dom: &mut Dom,
    element: NodeId,
    counters: &mut Counters,
    fresh: &mut Vec<NodeId>,
) {
    // An element child has finished but its closing advance is still owed.
    let mut closing_owed = false;
    // The owed child's tail has already opened its paragraph group.
    let mut tail_opened = false;
    for child in dom.child_ids(element) {
        if dom.is_text(child) {
            let blank = dom
                .text_content(child)
                .is_none_or(|text| text.trim().is_empty());
            if blank {
                // Whitespace-only runs stay as they are, counters untouched.
                continue;
            }
            if closing_owed && !tail_opened {
                counters.next_paragraph();
                tail_opened = true;
            }
            segment_text_node(dom, child, counters, fresh);
        } else if dom.is_element(child) {
            if closing_owed {
                counters.next_paragraph();
            }
            closing_owed = true;
            tail_opened = false;
            match dom.local_name(child) {
                Some("img") => wrap_whole(dom, child, counters, fresh),
                // Foreign content keeps its own vocabulary
                Some("math") | Some("svg") => {}
                _ => segment_element(dom, child, counters, fresh),
            }
        }
        // comments and processing instructions pass through
    }
    if closing_owed {
        counters.next_paragraph();
    }
}

/// Replace a text node with one span per sentence fragment. Whitespace-only
/// runs are left as they are.
fn segment_text_node(
    dom: &mut Dom,
    text_node: NodeId,
    counters: &mut Counters,
    fresh: &mut Vec<NodeId>,
) {
    let Some(text) = dom.text_content(text_node).map(str::to_string) else {
        return;
    };
    if text.trim().is_empty() {
        return;
    }

    let parts: Vec<String> = split_sentences(&text)
        .into_iter()
        .map(str::to_string)
        .collect();
    for part in parts {
        let span = new_span(dom, counters, fresh);
        let content = dom.create_text(part);
        dom.append(span, content);
        dom.insert_before(text_node, span);
    }
    dom.detach(text_node);
}

/// Wrap an element whole in a single span, counted as one segment.
fn wrap_whole(dom: &mut Dom, element: NodeId, counters: &mut Counters, fresh: &mut Vec<NodeId>) {
    let span = new_span(dom, counters, fresh);
    dom.insert_before(element, span);
    dom.append(span, element);
}

fn new_span(dom: &mut Dom, counters: &mut Counters, fresh: &mut Vec<NodeId>) -> NodeId {
    let span = dom.create_element(
        "span",
        vec![
            Attr {
                name: "class".to_string(),
                value: "koboSpan".to_string(),
            },
            Attr {
                name: "id".to_string(),
                value: counters.next_id(),
            },
        ],
    );
    fresh.push(span);
    span
}

/// Collapse any freshly inserted span whose sole child is another freshly
/// inserted span, keeping the outer id. Double nesting breaks Kobo's
/// span-addressed position tracking. Spans are visited in insertion order,
/// each collapsed until its child is no longer a fresh span, so a chain of
/// nested spans flattens completely and the output does not depend on set
/// iteration order.
fn merge_nested_spans(dom: &mut Dom, fresh: &[NodeId]) -> usize {
    let members: HashSet<NodeId> = fresh.iter().copied().collect();
    let mut merged = 0;
    for &outer in fresh {
        loop {
            let children = dom.child_ids(outer);
            let [inner] = children.as_slice() else {
                break;
            };
            let inner = *inner;
            if !members.contains(&inner) {
                break;
            }
            for grandchild in dom.child_ids(inner) {
                dom.insert_before(inner, grandchild);
            }
            dom.detach(inner);
            merged += 1;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::parse;
    use proptest::prelude::*;
    use std::path::Path;

    fn parse_body(body: &str) -> Dom {
        let source = format!(
            "<html xmlns=\"http://www.w3.org/1999/xhtml\"><body>{body}</body></html>"
        );
        parse(&source, Path::new("test.xhtml")).unwrap()
    }

    fn spans(dom: &Dom) -> Vec<(String, String)> {
        dom.find_all_by_tag("span")
            .into_iter()
            .filter(|&s| dom.element_classes(s).iter().any(|c| c == "koboSpan"))
            .map(|s| {
                (
                    dom.get_attr(s, "id").unwrap_or_default().to_string(),
                    dom.text_of(s),
                )
            })
            .collect()
    }

    #[test]
    fn test_simple_sentences() {
        let mut dom = parse_body("<p>First. Second.</p>");
        let count = add_spans(&mut dom);
        assert_eq!(count, 2);
        assert_eq!(
            spans(&dom),
            vec![
                ("kobo.1.1".to_string(), "First. ".to_string()),
                ("kobo.1.2".to_string(), "Second.".to_string()),
            ]
        );
    }

    #[test]
    fn test_nested_inline_counters() {
        let mut dom = parse_body("<p>Hello <i>world</i>. Bye.</p>");
        add_spans(&mut dom);
        assert_eq!(
            spans(&dom),
            vec![
                ("kobo.1.1".to_string(), "Hello ".to_string()),
                ("kobo.1.2".to_string(), "world".to_string()),
                ("kobo.2.1".to_string(), ". ".to_string()),
                ("kobo.2.2".to_string(), "Bye.".to_string()),
            ]
        );
    }

    #[test]
    fn test_every_tail_opens_its_own_paragraph_group() {
        // Each inline child closes its paragraph group after its tail, so
        // the second child's text cannot share a group with the first tail.
        let mut dom = parse_body("<p>A. <i>B.</i> C. <b>D.</b> E.</p>");
        add_spans(&mut dom);
        assert_eq!(
            spans(&dom),
            vec![
                ("kobo.1.1".to_string(), "A. ".to_string()),
                ("kobo.1.2".to_string(), "B.".to_string()),
                ("kobo.2.1".to_string(), " C. ".to_string()),
                ("kobo.3.1".to_string(), "D.".to_string()),
                ("kobo.4.1".to_string(), " E.".to_string()),
            ]
        );
    }

    #[test]
    fn test_sibling_blocks_count_inner_closings() {
        // The first paragraph spends groups 1-2 on its text and tail and
        // closes twice (inner child, then the block itself), so the second
        // block starts at group 4.
        let mut dom = parse_body("<p>A. <i>B.</i> C.</p><p>X.</p>");
        add_spans(&mut dom);
        assert_eq!(
            spans(&dom),
            vec![
                ("kobo.1.1".to_string(), "A. ".to_string()),
                ("kobo.1.2".to_string(), "B.".to_string()),
                ("kobo.2.1".to_string(), " C.".to_string()),
                ("kobo.4.1".to_string(), "X.".to_string()),
            ]
        );
    }

    #[test]
    fn test_close_quote_stays_with_sentence() {
        let mut dom = parse_body("<p>\u{201c}Stop!\u{201d} he said.</p>");
        add_spans(&mut dom);
        assert_eq!(
            spans(&dom),
            vec![
                ("kobo.1.1".to_string(), "\u{201c}Stop!\u{201d} ".to_string()),
                ("kobo.1.2".to_string(), "he said.".to_string()),
            ]
        );
    }

    #[test]
    fn test_hair_spaced_ellipsis_and_quote_stay_with_sentence() {
        // Terminal mark, hair space, ellipsis, close quote: one segment.
        assert_eq!(
            split_sentences("Stop.\u{200a}\u{2026}\u{201d} Go."),
            vec!["Stop.\u{200a}\u{2026}\u{201d} ", "Go."]
        );
        // Hair space before a bare right double quote, same rule.
        assert_eq!(
            split_sentences("Wait!\u{200a}\u{201d} Fine."),
            vec!["Wait!\u{200a}\u{201d} ", "Fine."]
        );
    }

    #[test]
    fn test_img_wrapped_whole() {
        let mut dom = parse_body("<p>See: <img src=\"x.png\"/> here.</p>");
        add_spans(&mut dom);

        let img = dom.find_by_tag("img").unwrap();
        let parent = dom.parent(img);
        assert_eq!(dom.local_name(parent), Some("span"));
        assert_eq!(dom.get_attr(parent, "class"), Some("koboSpan"));
        assert_eq!(dom.get_attr(parent, "id"), Some("kobo.1.2"));
        assert_eq!(
            spans(&dom).iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["kobo.1.1", "kobo.1.2", "kobo.2.1"]
        );
    }

    #[test]
    fn test_whitespace_runs_left_unwrapped() {
        let mut dom = parse_body("<div>\n\t<p>A.</p>\n</div>");
        let before = dom.text_of(dom.find_by_tag("div").unwrap());
        let count = add_spans(&mut dom);
        assert_eq!(count, 1);
        assert_eq!(dom.text_of(dom.find_by_tag("div").unwrap()), before);
    }

    #[test]
    fn test_text_concatenation_unchanged() {
        let mut dom = parse_body(
            "<p>\u{201c}Well?\u{201d} said I. <i>Nothing</i> came of it: not a word. Done</p>",
        );
        let body = dom.find_by_tag("body").unwrap();
        let before = dom.text_of(body);
        add_spans(&mut dom);
        assert_eq!(dom.text_of(body), before);
    }

    #[test]
    fn test_mathml_left_alone() {
        let mut dom = parse_body("<p>Let <math><mi>x</mi></math> be real.</p>");
        add_spans(&mut dom);
        let mi = dom.find_by_tag("mi").unwrap();
        let children = dom.child_ids(mi);
        assert_eq!(children.len(), 1);
        assert!(dom.is_text(children[0]));
    }

    #[test]
    fn test_merge_nested_fresh_spans() {
        let mut dom = parse_body("<p>x</p>");
        let p = dom.find_by_tag("p").unwrap();
        let outer = dom.create_element(
            "span",
            vec![Attr {
                name: "id".to_string(),
                value: "kobo.1.1".to_string(),
            }],
        );
        let inner = dom.create_element(
            "span",
            vec![Attr {
                name: "id".to_string(),
                value: "kobo.1.2".to_string(),
            }],
        );
        let text = dom.create_text("y");
        dom.append(p, outer);
        dom.append(outer, inner);
        dom.append(inner, text);

        let fresh = vec![outer, inner];
        assert_eq!(merge_nested_spans(&mut dom, &fresh), 1);
        let children = dom.child_ids(outer);
        assert_eq!(children.len(), 1);
        assert!(dom.is_text(children[0]));
        assert_eq!(dom.get_attr(outer, "id"), Some("kobo.1.1"));
    }

    #[test]
    fn test_merge_flattens_span_chain_in_any_order() {
        let make_chain = |dom: &mut Dom, p: NodeId| -> Vec<NodeId> {
            let ids: Vec<NodeId> = (1..=3)
                .map(|n| {
                    dom.create_element(
                        "span",
                        vec![Attr {
                            name: "id".to_string(),
                            value: format!("kobo.1.{n}"),
                        }],
                    )
                })
                .collect();
            let text = dom.create_text("y");
            dom.append(p, ids[0]);
            dom.append(ids[0], ids[1]);
            dom.append(ids[1], ids[2]);
            dom.append(ids[2], text);
            ids
        };

        // Outermost-first and innermost-first both flatten the chain down
        // to the outer span holding the text.
        for reversed in [false, true] {
            let mut dom = parse_body("<p>x</p>");
            let p = dom.find_by_tag("p").unwrap();
            let mut fresh = make_chain(&mut dom, p);
            let outer = fresh[0];
            if reversed {
                fresh.reverse();
            }
            assert_eq!(merge_nested_spans(&mut dom, &fresh), 2);
            let children = dom.child_ids(outer);
            assert_eq!(children.len(), 1);
            assert!(dom.is_text(children[0]));
            assert_eq!(dom.get_attr(outer, "id"), Some("kobo.1.1"));
        }
    }

    #[test]
    fn test_referrer_glyph_swap() {
        let xhtml = "<a href=\"chapter-1.xhtml#noteref-1\" epub:type=\"se:referrer\">\u{21a9}\u{fe0e}</a>";
        assert_eq!(
            swap_referrer_glyph(xhtml),
            "<a href=\"chapter-1.xhtml#noteref-1\" epub:type=\"se:referrer\">\u{ab}</a>"
        );
    }

    proptest! {
        #[test]
        fn prop_split_concatenation_is_identity(
            s in prop::collection::vec(
                prop_oneof![
                    prop::char::range('a', 'z'),
                    Just('.'), Just('!'), Just('?'), Just(':'),
                    Just(' '), Just('\n'),
                    Just('\u{201c}'), Just('\u{201d}'), Just('\u{2019}'),
                ],
                0..200
            )
        ) {
            let text: String = s.into_iter().collect();
            let joined: String = split_sentences(&text).concat();
            prop_assert_eq!(joined, text);
        }

        #[test]
        fn prop_segment_ids_strictly_ordered(
            sentences in prop::collection::vec("[a-z ]{1,12}\\.", 1..8)
        ) {
            let text = sentences.concat();
            let mut dom = parse_body(&format!("<p>{text}</p>"));
            add_spans(&mut dom);

            let ids: Vec<(u32, u32)> = spans(&dom)
                .iter()
                .map(|(id, _)| {
                    let mut it = id.trim_start_matches("kobo.").split('.');
                    (
                        it.next().unwrap().parse().unwrap(),
                        it.next().unwrap().parse().unwrap(),
                    )
                })
                .collect();
            for pair in ids.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
