//! CSS selector simplification for legacy reading systems.
//!
//! Older RMSDK-based renderers ignore structural pseudo-classes and
//! namespace attribute selectors entirely. Every affected selector gets a
//! class-based twin in the stylesheet, and the synthesized class is added
//! to the elements the original selector matched, so the twin selects the
//! same set under class-only matching.

use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use cssparser::{
    AtRuleParser, CowRcStr, ParseError, Parser, ParserInput, ParserState, QualifiedRuleParser,
    StyleSheetParser,
};
use regex::Regex;
use tracing::debug;

use crate::dom::{self, Dom};
use crate::store::SourceTree;
use crate::Result;

/// Pseudo-classes legacy renderers cannot match.
const SIMPLIFIED_PSEUDO_CLASSES: [&str; 3] = [":first-child", ":last-child", ":only-child"];

/// Matches `[epub|type~="value"]` attribute selectors.
static EPUB_TYPE_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[epub\|type~="([^"]+)"\]"#).unwrap());

/// Matches `[xml|lang="value"]` attribute selectors, any operator.
static XML_LANG_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[xml\|lang[~|]?="([^"]+)"\]"#).unwrap());

/// Rewrites stylesheets and applies the synthesized classes to documents.
///
/// One instance spans the whole build: `simplify` is called per stylesheet
/// and records every selector it sees, then `apply_classes` walks the
/// documents once against the accumulated set.
#[derive(Debug, Default)]
pub struct Simplifier {
    selectors: Vec<String>,
    seen: HashSet<String>,
}

impl Simplifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite one stylesheet, giving every selector that uses a structural
    /// pseudo-class or namespace attribute selector a class-based twin. The
    /// twin comes first, the original is kept alongside so conforming
    /// renderers are unaffected. Everything else, including comments,
    /// whitespace, and declaration blocks, passes through byte-for-byte.
    pub fn simplify(&mut self, css: &str) -> String {
        let mut splices = Vec::new();
        let mut input = ParserInput::new(css);
        let mut parser = Parser::new(&mut input);
        let mut scanner = RuleScanner {
            simplifier: self,
            splices: &mut splices,
        };

        for result in StyleSheetParser::new(&mut parser, &mut scanner) {
            // Unparseable rules are left untouched
            let _ = result;
        }

        splices.sort_by_key(|(range, _)| range.start);

        let mut out = String::with_capacity(css.len());
        let mut cursor = 0;
        for (range, replacement) in splices {
            out.push_str(&css[cursor..range.start]);
            out.push_str(&replacement);
            cursor = range.end;
        }
        out.push_str(&css[cursor..]);
        out
    }

    /// Walk the given documents, adding each synthesized class to the
    /// elements its original selector matches. The navigation ToC is skipped
    /// so its native child-position styling stays intact.
    pub fn apply_classes(
        &self,
        tree: &mut SourceTree,
        documents: &[PathBuf],
        toc: &Path,
    ) -> Result<()> {
        let mut matched = vec![false; self.selectors.len()];

        for rel in documents {
            if rel == toc {
                continue;
            }
            let dom = tree.get(rel)?.tree_mut()?;
            self.apply_to_document(dom, &mut matched);
        }

        for (selector, matched) in self.selectors.iter().zip(&matched) {
            if !matched {
                debug!("selector matched no elements: {selector}");
            }
        }
        Ok(())
    }

    fn apply_to_document(&self, dom: &mut Dom, matched: &mut [bool]) {
        for (i, selector) in self.selectors.iter().enumerate() {
            if apply_selector(dom, selector) {
                matched[i] = true;
            }
        }
    }

    fn record_rule(
        &mut self,
        range: Range<usize>,
        selectors: &[String],
        splices: &mut Vec<(Range<usize>, String)>,
    ) {
        let mut rewritten: Vec<String> = Vec::new();
        let mut changed = false;

        for selector in selectors {
            if self.seen.insert(selector.clone()) {
                self.selectors.push(selector.clone());
            }
            match class_twin(selector) {
                // A twin already present in the rule means the stylesheet
                // was simplified before; adding it again would duplicate.
                Some(twin)
                    if !selectors.contains(&twin) && !rewritten.iter().any(|s| *s == twin) =>
                {
                    rewritten.push(twin);
                    rewritten.push(selector.clone());
                    changed = true;
                }
                _ => rewritten.push(selector.clone()),
            }
        }

        if changed {
            splices.push((range, rewritten.join(",\n")));
        }
    }
}

/// The class-based twin of a selector, or None if nothing needs simplifying.
fn class_twin(selector: &str) -> Option<String> {
    let mut twin = selector.to_string();
    for pseudo in SIMPLIFIED_PSEUDO_CLASSES {
        if twin.contains(pseudo) {
            twin = twin.replace(pseudo, &format!(".{}", &pseudo[1..]));
        }
    }
    twin = EPUB_TYPE_ATTR_RE
        .replace_all(&twin, |caps: &regex::Captures| {
            format!(".{}", epub_type_class(&caps[1]))
        })
        .into_owned();
    twin = XML_LANG_ATTR_RE
        .replace_all(&twin, |caps: &regex::Captures| {
            format!(".{}", xml_lang_class(&caps[1]))
        })
        .into_owned();

    if twin == selector { None } else { Some(twin) }
}

/// `se:image.color-depth` becomes `epub-type-se-image-color-depth`.
pub fn epub_type_class(value: &str) -> String {
    format!("epub-type-{}", value.replace([':', '.'], "-"))
}

/// `en-US` becomes `xml-lang-en-us`.
pub fn xml_lang_class(value: &str) -> String {
    format!("xml-lang-{}", value.to_lowercase())
}

/// Apply every class this selector implies to one document. Returns whether
/// the selector matched anything (selectors that fail to compile count as
/// matched, since we cannot prove them unused).
fn apply_selector(dom: &mut Dom, selector: &str) -> bool {
    let mut matched = false;

    match dom::compile(selector) {
        Ok(compiled) => {
            let hits = dom::select(dom, &compiled);
            matched = !hits.is_empty();
            let classes: Vec<&str> = SIMPLIFIED_PSEUDO_CLASSES
                .iter()
                .filter(|p| selector.contains(*p))
                .map(|p| &p[1..])
                .collect();
            if !classes.is_empty() {
                for node in hits {
                    for class in &classes {
                        dom.add_class(node, class);
                    }
                }
            }
        }
        // Pseudo-element selectors don't compile; their embedded attribute
        // selectors below still need classes.
        Err(_) => matched = true,
    }

    if apply_attr_classes(dom, selector) {
        matched = true;
    }
    matched
}

/// Attribute-selector classes go on the element carrying the attribute,
/// which is not necessarily the selector's subject, so each occurrence is
/// extracted and matched on its own.
fn apply_attr_classes(dom: &mut Dom, selector: &str) -> bool {
    let mut applied = false;

    for caps in EPUB_TYPE_ATTR_RE.captures_iter(selector) {
        let class = epub_type_class(&caps[1]);
        if let Ok(compiled) = dom::compile(&caps[0]) {
            for node in dom::select(dom, &compiled) {
                dom.add_class(node, &class);
                applied = true;
            }
        }
    }

    for caps in XML_LANG_ATTR_RE.captures_iter(selector) {
        let class = xml_lang_class(&caps[1]);
        if let Ok(compiled) = dom::compile(&caps[0]) {
            for node in dom::select(dom, &compiled) {
                // Language classes on html/body would bleed into everything
                if matches!(dom.local_name(node), Some("html") | Some("body")) {
                    continue;
                }
                dom.add_class(node, &class);
                applied = true;
            }
        }
    }

    applied
}

/// Collects selector preludes as raw byte ranges so the rewrite can splice
/// the source text instead of re-serializing it.
struct RuleScanner<'a> {
    simplifier: &'a mut Simplifier,
    splices: &'a mut Vec<(Range<usize>, String)>,
}

struct AtPrelude {
    name: String,
}

impl<'i> QualifiedRuleParser<'i> for RuleScanner<'_> {
    type Prelude = (Range<usize>, Vec<String>);
    type QualifiedRule = ();
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        input: &mut Parser<'i, 't>,
    ) -> std::result::Result<Self::Prelude, ParseError<'i, Self::Error>> {
        let start = input.position();
        let selectors = input.parse_comma_separated(|i| {
            let s = i.position();
            while i.next_including_whitespace().is_ok() {}
            Ok(i.slice_from(s).trim().to_string())
        })?;
        let range = start.byte_index()..input.position().byte_index();
        Ok((range, selectors))
    }

    fn parse_block<'t>(
        &mut self,
        (range, selectors): Self::Prelude,
        _start: &ParserState,
        _input: &mut Parser<'i, 't>,
    ) -> std::result::Result<Self::QualifiedRule, ParseError<'i, Self::Error>> {
        self.simplifier.record_rule(range, &selectors, self.splices);
        Ok(())
    }
}

impl<'i> AtRuleParser<'i> for RuleScanner<'_> {
    type Prelude = AtPrelude;
    type AtRule = ();
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        name: CowRcStr<'i>,
        _input: &mut Parser<'i, 't>,
    ) -> std::result::Result<Self::Prelude, ParseError<'i, Self::Error>> {
        Ok(AtPrelude {
            name: name.to_string(),
        })
    }

    fn parse_block<'t>(
        &mut self,
        prelude: Self::Prelude,
        _start: &ParserState,
        input: &mut Parser<'i, 't>,
    ) -> std::result::Result<Self::AtRule, ParseError<'i, Self::Error>> {
        // Conditional group rules nest ordinary style rules; recurse so
        // their selectors are simplified too. All other at-rules
        // (@font-face, @namespace, ...) pass through untouched.
        if matches!(prelude.name.as_str(), "media" | "supports") {
            let mut nested = RuleScanner {
                simplifier: &mut *self.simplifier,
                splices: &mut *self.splices,
            };
            for result in StyleSheetParser::new(input, &mut nested) {
                let _ = result;
            }
        }
        Ok(())
    }

    fn rule_without_block(
        &mut self,
        _prelude: Self::Prelude,
        _start: &ParserState,
    ) -> std::result::Result<Self::AtRule, ()> {
        Ok(())
    }
}
