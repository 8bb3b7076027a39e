//! String-level compatibility rewrites shared by every target.
//!
//! These passes run on the working tree after CSS simplification and before
//! packaging. They are all written to be idempotent: running a pass twice
//! leaves the document byte-identical, which keeps rebuilt trees stable.

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Appended to the core stylesheet before simplification so its selectors
/// get the same legacy rewrite as the book's own rules.
pub const COMPATIBILITY_CSS: &str = "\n\
/* Legacy renderer fixes, appended at build time. */\n\
img{\n\
\tmax-width: 100%;\n\
}\n\
\n\
hr{\n\
\tborder: none;\n\
\tborder-top: 1px solid;\n\
\theight: 0;\n\
}\n\
\n\
[epub|type~=\"se:image.color-depth.black-on-transparent\"]{\n\
\tbackground-color: #fff;\n\
}\n\
\n\
section[epub|type~=\"endnotes\"] > ol > li{\n\
\tmargin: 1em 0;\n\
}\n";

/// Appended to the core stylesheet for the Kindle branch only.
pub const KINDLE_CSS: &str = "\n\
/* Kindle overrides, appended at build time. */\n\
span.em{\n\
\tfont-style: italic;\n\
}\n\
\n\
@media amzn-kf8{\n\
\tbody{\n\
\t\thyphens: none;\n\
\t}\n\
}\n\
\n\
@media amzn-mobi{\n\
\tbody{\n\
\t\tfont-family: serif;\n\
\t}\n\
}\n";

// === ARIA mirroring ===

/// `epub:type` values that map straight onto a `doc-` ARIA role.
const ARIA_VOCABULARY: [&str; 16] = [
    "afterword",
    "appendix",
    "biblioentry",
    "bibliography",
    "chapter",
    "colophon",
    "conclusion",
    "dedication",
    "epilogue",
    "foreword",
    "introduction",
    "noteref",
    "part",
    "preface",
    "prologue",
    "toc",
];

/// Matches an epub:type attribute carrying any plain vocabulary value.
static ARIA_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "(epub:type=\"[^\"]*?({})[^\"]*?\")",
        ARIA_VOCABULARY.join("|")
    ))
    .unwrap()
});

/// Matches a note or note-container semantic in any of its spellings.
static NOTE_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("(epub:type=\"[^\"]*?(?:end|foot|rear)note(s?)[^\"]*?\")").unwrap()
});

/// Matches a subtitle semantic on an element that supports `doc-subtitle`.
static SUBTITLE_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("(<(?:h[1-6]|p)\\s[^>]*?epub:type=\"[^\"]*?subtitle[^\"]*?\")").unwrap()
});

/// Matches a previously mirrored role directly after its epub:type.
static MIRRORED_ROLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(epub:type=\"[^\"]*?\") role=\"doc-[^\"]*?\"").unwrap());

/// Give `epub:type` semantics a matching `role="doc-…"` attribute.
///
/// Note semantics always mirror to `doc-endnote(s)` regardless of spelling,
/// links carrying the backlink semantic gain `doc-backlink` (endnotes file
/// only), and `subtitle` is mirrored only on elements that support the
/// role. Previously mirrored roles are stripped first, so the pass can run
/// on its own output.
pub fn mirror_aria_roles(xhtml: &str, in_endnotes: bool) -> String {
    let mut out = MIRRORED_ROLE_RE.replace_all(xhtml, "$1").into_owned();
    out = out.replace(
        " role=\"doc-backlink\" epub:type=\"se:referrer\"",
        " epub:type=\"se:referrer\"",
    );

    out = NOTE_TYPE_RE
        .replace_all(&out, |caps: &Captures| {
            format!("{} role=\"doc-endnote{}\"", &caps[1], &caps[2])
        })
        .into_owned();
    if in_endnotes {
        out = out.replace(
            " epub:type=\"se:referrer\"",
            " role=\"doc-backlink\" epub:type=\"se:referrer\"",
        );
    }
    out = SUBTITLE_TYPE_RE
        .replace_all(&out, "$1 role=\"doc-subtitle\"")
        .into_owned();
    ARIA_TYPE_RE
        .replace_all(&out, |caps: &Captures| {
            format!("{} role=\"doc-{}\"", &caps[1], &caps[2])
        })
        .into_owned()
}

// === Note semantics ===

/// Matches the endnote semantic inside an epub:type attribute.
static ENDNOTE_SEMANTIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("epub:type=\"([^\"]*?)endnote(s?)([^\"]*?)\"").unwrap());

/// Rename note semantics for popup renderers: `endnote` becomes `footnote`
/// with a `rearnote` alias, and the container gains the plural aliases.
/// iBooks keys its popups off `footnote`; ADE-era renderers look for
/// `rearnote`.
pub fn convert_endnote_semantics(xhtml: &str) -> String {
    let out = ENDNOTE_SEMANTIC_RE
        .replace_all(xhtml, |caps: &Captures| {
            format!(
                "epub:type=\"{}footnote{} rearnote{}{}\"",
                &caps[1], &caps[2], &caps[2], &caps[3]
            )
        })
        .into_owned();
    out.replace("epub-type-endnote", "epub-type-footnote")
}

/// The stylesheet half of [`convert_endnote_semantics`]: attribute selectors
/// and simplified class twins both follow the rename.
pub fn convert_endnote_styles(css: &str) -> String {
    css.replace("endnote", "footnote")
}

// === Referrer glyph ===

/// Force text presentation on the return glyph; iOS renders the bare
/// character as an emoji. Already-suffixed glyphs are left with a single
/// variation selector.
pub fn referrer_text_presentation(xhtml: &str) -> String {
    xhtml
        .replace("\u{21a9}\u{fe0e}", "\u{21a9}")
        .replace('\u{21a9}', "\u{21a9}\u{fe0e}")
}

// === Language attributes ===

/// Matches an xml:lang attribute preceded by whitespace.
static XML_LANG_MIRROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("([ \\t])xml:lang=\"([^\"]+?)\"").unwrap());

/// Matches a previously mirrored lang/xml:lang pair.
static LANG_PAIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("([ \\t])lang=\"[^\"]+?\" (xml:lang=)").unwrap());

/// Duplicate `xml:lang` into a plain `lang` attribute; assistive tech on
/// legacy renderers only reads the HTML attribute.
pub fn mirror_lang_attributes(xhtml: &str) -> String {
    let out = LANG_PAIR_RE.replace_all(xhtml, "$1$2").into_owned();
    XML_LANG_MIRROR_RE
        .replace_all(&out, "${1}lang=\"${2}\" xml:lang=\"${2}\"")
        .into_owned()
}

// === Typography ===

/// Downgrade characters that legacy renderers drop or draw as boxes.
///
/// Two- and three-em dashes become em dash runs glued with word joiners,
/// then every remaining word joiner is swapped for U+FEFF, the deprecated
/// zero-width no-break space that the same renderers do honor.
pub fn downgrade_typography(text: &str) -> String {
    let text = text.replace('\u{2e3a}', "\u{2014}\u{2060}\u{2014}");
    let text = text.replace('\u{2e3b}', "\u{2014}\u{2060}\u{2014}\u{2060}\u{2014}");
    let text = text.replace('\u{2152}', "1/10");
    let text = text.replace('\u{2105}', "c/o");
    let text = text.replace('\u{2717}', "\u{d7}");
    let text = text.replace('\u{2003}', "\u{a0}\u{a0}");
    text.replace('\u{2060}', "\u{feff}")
}

/// Strip the invisible characters Kindle firmware mishandles: soft hyphens
/// and zero-width no-break spaces.
pub fn strip_invisible_joiners(text: &str) -> String {
    text.replace('\u{ad}', "").replace('\u{feff}', "")
}

// === Night-mode raster hints ===

/// Matches a class attribute containing the publisher-logo twin class.
static LOGO_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("class=\"([^\"]*?)epub-type-z3998-publisher-logo([^\"]*?)\"").unwrap()
});

const NIGHT_MODE_SEMANTIC: &str = "se:image.color-depth.black-on-transparent";
const NIGHT_MODE_CLASS: &str = "epub-type-se-image-color-depth-black-on-transparent";

/// Once vector art is rasterized the night-mode hint must ride on the
/// document: the publisher logo and every titlepage image pick up the
/// black-on-transparent semantic and its class twin.
pub fn mark_raster_night_mode(xhtml: &str, in_titlepage: bool) -> String {
    let mut out = xhtml
        .replace(
            &format!("z3998:publisher-logo {NIGHT_MODE_SEMANTIC}"),
            "z3998:publisher-logo",
        )
        .replace(
            &format!("epub-type-z3998-publisher-logo {NIGHT_MODE_CLASS}"),
            "epub-type-z3998-publisher-logo",
        )
        .replace(
            &format!("<img class=\"{NIGHT_MODE_CLASS}\" epub:type=\"{NIGHT_MODE_SEMANTIC}\""),
            "<img",
        );
    out = out.replace(
        "z3998:publisher-logo",
        &format!("z3998:publisher-logo {NIGHT_MODE_SEMANTIC}"),
    );
    out = LOGO_CLASS_RE
        .replace_all(&out, |caps: &Captures| {
            format!(
                "class=\"{}epub-type-z3998-publisher-logo {NIGHT_MODE_CLASS}{}\"",
                &caps[1], &caps[2]
            )
        })
        .into_owned();
    if in_titlepage {
        out = out.replace(
            "<img",
            &format!("<img class=\"{NIGHT_MODE_CLASS}\" epub:type=\"{NIGHT_MODE_SEMANTIC}\""),
        );
    }
    out
}

// === Stylesheet aliases ===

/// Matches a page-break declaration to alias.
static PAGE_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\s+)page-break-(.+?:\s.+?;)").unwrap());

/// Matches a previously inserted break alias.
static BREAK_ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\t\s+break-(?:before|after|inside)[^;]*;").unwrap());

/// Give every `page-break-*` declaration a modern `break-*` twin; newer
/// renderers only honor the unprefixed form.
pub fn alias_break_properties(css: &str) -> String {
    let out = BREAK_ALIAS_RE.replace_all(css, "").into_owned();
    PAGE_BREAK_RE
        .replace_all(&out, |caps: &Captures| {
            format!(
                "{}page-break-{}\t{}break-{}",
                &caps[1], &caps[2], &caps[1], &caps[2]
            )
        })
        .into_owned()
}

/// Matches a vendor expansion previously added after a hyphens declaration.
static HYPHEN_VENDOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "\\n\\t(?:adobe-hyphenate|-webkit-hyphens|-epub-hyphens|-moz-hyphens|adobe-text-layout):[^\\n]*",
    )
    .unwrap()
});

/// Matches a hyphens declaration at the start of a line.
static HYPHENS_DECL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)hyphens\s*:\s*([^;\n]+);").unwrap());

/// Expand `hyphens` declarations with the vendor spellings older renderers
/// read, plus the Nook layout hint when hyphenation is off.
pub fn prefix_hyphen_properties(css: &str) -> String {
    let out = HYPHEN_VENDOR_RE.replace_all(css, "").into_owned();
    HYPHENS_DECL_RE
        .replace_all(&out, |caps: &Captures| {
            let value = caps[2].trim();
            let mut block = format!(
                "{}hyphens: {value};\n\tadobe-hyphenate: {value};\n\t-webkit-hyphens: {value};\n\t-epub-hyphens: {value};\n\t-moz-hyphens: {value};",
                &caps[1]
            );
            if value == "none" {
                block.push_str("\n\tadobe-text-layout: optimizeSpeed;");
            }
            block
        })
        .into_owned()
}

/// Matches an abbr element rule.
static ABBR_RULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)abbr\{.+?\}").unwrap());

/// Drop `abbr` element rules from the core stylesheet; RMSDK crashes on
/// them.
pub fn strip_abbr_rules(css: &str) -> String {
    ABBR_RULE_RE.replace_all(css, "").into_owned()
}
