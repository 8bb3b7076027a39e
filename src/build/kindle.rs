//! The Kindle branch: AZW3 conversion of the compatible tree.
//!
//! Kindle renderers only follow a ToC two levels deep, popup notes must be
//! top-level `p` blocks, and Calibre mangles `epub:type` attributes, so the
//! working tree gets one more rewrite before it is handed to the converter.
//! MathML is simplified to plain markup where the expression allows it and
//! rasterized where it does not.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::assets;
use crate::build::{canonicalize_tree, core_stylesheet, is_endnotes, survey, Survey};
use crate::compat;
use crate::dom::{self, escape_text, Dom, NodeId};
use crate::epub::{self, ManifestItem};
use crate::error::{Error, Result};
use crate::mobi;
use crate::ncx;
use crate::store::SourceTree;
use crate::tools::{FirefoxMath, KindleConverter, MathRasterizer, Toolbox};

/// Build the `.azw3` and its store thumbnail into the scratch directory.
pub(crate) fn build(
    scratch: &Path,
    tree: &mut SourceTree,
    basename: &str,
    asin: &str,
    tools: &Toolbox,
    converter: &dyn KindleConverter,
) -> Result<Vec<(PathBuf, String)>> {
    transform(tree, None)?;
    canonicalize_tree(tree, tools)?;
    tree.save_all()?;

    let intermediate = scratch.join(format!("{basename}.kindle.epub"));
    epub::write_container(tree.root(), &intermediate)?;

    let cover = cover_path(tree)?;
    let azw3_name = format!("{basename}.azw3");
    let azw3 = scratch.join(&azw3_name);
    converter.convert(&intermediate, &azw3, &cover)?;
    mobi::update_asin_file(&azw3, asin)?;
    info!(artifact = %azw3_name, "converted");

    let thumbnail = assets::kindle_thumbnail(&cover, scratch, asin, tools.images.as_ref())?;
    let thumbnail_name = thumbnail
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    Ok(vec![(azw3, azw3_name), (thumbnail, thumbnail_name)])
}

/// The tree rewrite, separated from the subprocess steps. When `math` is
/// `None` a MathML renderer is probed only if an expression survives
/// simplification.
pub(crate) fn transform(
    tree: &mut SourceTree,
    math: Option<&dyn MathRasterizer>,
) -> Result<()> {
    let plan = survey(tree)?;

    {
        let doc = tree.get(&plan.toc_rel)?;
        flatten_toc(doc.tree_mut()?);
    }
    ncx::generate(tree, &plan.opf_rel, &plan.toc_rel)?;

    for rel in &plan.documents {
        if !is_endnotes(rel) {
            continue;
        }
        let doc = tree.get(rel)?;
        restructure_notes(doc.tree_mut()?)?;
        debug!(file = %rel.display(), "restructured notes for popups");
    }

    process_mathml(tree, &plan, math)?;

    for rel in &plan.documents {
        let in_endnotes = is_endnotes(rel);
        let doc = tree.get(rel)?;
        doc.rewrite_text(|text| {
            let mut text = text.replace('\u{200b}', "");
            if in_endnotes {
                text = compat::strip_invisible_joiners(&text);
            }
            strip_epub_types(&text)
        });
    }

    if let Some(core) = core_stylesheet(&plan.stylesheets) {
        let doc = tree.get(core)?;
        doc.rewrite_text(|text| {
            if text.contains("Kindle overrides") {
                text.to_string()
            } else {
                format!("{text}{}", compat::KINDLE_CSS)
            }
        });
    }
    Ok(())
}

// === ToC flattening ===

/// Hoist every entry nested three or more levels deep up to the second
/// level, preserving document order.
fn flatten_toc(dom: &mut Dom) {
    let Some(nav) = dom.find_all_by_tag("nav").into_iter().find(|id| {
        dom.get_attr(*id, "epub:type")
            .is_some_and(|t| t.split_whitespace().any(|tok| tok == "toc"))
    }) else {
        return;
    };
    let Some(top) = dom
        .children(nav)
        .find(|id| dom.local_name(*id) == Some("ol"))
    else {
        return;
    };

    loop {
        let mut hoisted = false;
        for li1 in element_children(dom, top, "li") {
            for inner in element_children(dom, li1, "ol") {
                for li2 in element_children(dom, inner, "li") {
                    for deep in element_children(dom, li2, "ol") {
                        let mut anchor = li2;
                        for entry in element_children(dom, deep, "li") {
                            dom.detach(entry);
                            dom.insert_after(anchor, entry);
                            anchor = entry;
                        }
                        dom.detach(deep);
                        hoisted = true;
                    }
                }
            }
        }
        if !hoisted {
            break;
        }
    }
}

fn element_children(dom: &Dom, parent: NodeId, name: &str) -> Vec<NodeId> {
    dom.children(parent)
        .filter(|id| dom.local_name(*id) == Some(name))
        .collect()
}

// === Popup note restructuring ===

/// Rewrite each note `li` into a top-level `p id="note-N"` block whose
/// leading anchor is the backlink, renumbered to the note number. Kindle's
/// popup footnotes need the anchor target and the note text in one block
/// element.
fn restructure_notes(dom: &mut Dom) -> Result<()> {
    let notes: Vec<NodeId> = dom
        .find_all_by_tag("li")
        .into_iter()
        .filter(|id| {
            dom.get_attr(*id, "epub:type").is_some_and(|t| {
                t.split_whitespace()
                    .any(|tok| matches!(tok, "footnote" | "rearnote" | "endnote"))
            })
        })
        .collect();
    if notes.is_empty() {
        return Ok(());
    }

    let mut lists = Vec::new();
    for li in &notes {
        let note_id = dom
            .get_attr(*li, "id")
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidSource("endnote without an id".to_string()))?;
        let number = note_id
            .strip_prefix("note-")
            .unwrap_or(&note_id)
            .to_string();

        let backlink = find_backlink(dom, *li).ok_or_else(|| {
            Error::InvalidSource(format!("no backlink in #{note_id}"))
        })?;
        let old_parent = dom.parent(backlink);
        dom.detach(backlink);
        for child in dom.child_ids(backlink) {
            dom.detach(child);
        }
        let label = dom.create_text(number);
        dom.append(backlink, label);
        if is_blank_element(dom, old_parent) {
            dom.detach(old_parent);
        }

        let first_p = dom
            .children(*li)
            .find(|id| dom.local_name(*id) == Some("p"));
        match first_p {
            Some(p) => {
                dom.set_attr(p, "id", &note_id);
                let dot = dom.create_text(". ");
                match dom.child_ids(p).first().copied() {
                    Some(first) => {
                        dom.insert_before(first, backlink);
                        dom.insert_before(first, dot);
                    }
                    None => {
                        dom.append(p, backlink);
                        dom.append(p, dot);
                    }
                }
            }
            None => {
                let p = dom.create_element(
                    "p",
                    vec![crate::dom::Attr {
                        name: "id".into(),
                        value: note_id.clone(),
                    }],
                );
                dom.append(p, backlink);
                let dot = dom.create_text(".");
                dom.append(p, dot);
                match dom.child_ids(*li).first().copied() {
                    Some(first) => dom.insert_before(first, p),
                    None => dom.append(*li, p),
                }
            }
        }
        dom.remove_attr(*li, "id");

        let list = dom.parent(*li);
        if !lists.contains(&list) {
            lists.push(list);
        }
    }

    // Dissolve the lists: note bodies become siblings where the ol stood.
    for list in lists {
        for li in element_children(dom, list, "li") {
            for child in dom.child_ids(li) {
                if !dom.is_element(child) {
                    continue;
                }
                dom.detach(child);
                let lead = dom.create_text("\n\t\t\t");
                dom.insert_before(list, lead);
                dom.insert_before(list, child);
            }
        }
        dom.detach(list);
    }
    Ok(())
}

/// Last `se:referrer` anchor inside the note.
fn find_backlink(dom: &Dom, li: NodeId) -> Option<NodeId> {
    dom.descendants(li)
        .filter(|id| {
            dom.local_name(*id) == Some("a")
                && dom
                    .get_attr(*id, "epub:type")
                    .is_some_and(|t| t.split_whitespace().any(|tok| tok == "se:referrer"))
        })
        .last()
}

fn is_blank_element(dom: &Dom, id: NodeId) -> bool {
    if !dom.is_element(id) {
        return false;
    }
    dom.children(id).all(|child| {
        dom.text_content(child)
            .is_some_and(|t| t.trim().is_empty())
    })
}

// === MathML ===

static MATH_FRAGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<math[^>]*>.*?</math>").unwrap());

/// Replace every MathML expression with simplified inline markup, falling
/// back to a rasterized PNG for expressions simplification can't express.
fn process_mathml(
    tree: &mut SourceTree,
    plan: &Survey,
    math: Option<&dyn MathRasterizer>,
) -> Result<()> {
    let mut lazy: Option<Box<dyn MathRasterizer>> = None;
    let mut counter = 1usize;
    let mut rendered = Vec::new();
    let mut saw_math = false;

    for rel in &plan.documents {
        let text = {
            let doc = tree.get(rel)?;
            let text = doc.text();
            if !text.contains("<math") {
                continue;
            }
            text.to_string()
        };
        saw_math = true;

        let mut out = text.clone();
        for m in MATH_FRAGMENT_RE.find_iter(&text) {
            let fragment = m.as_str();
            if !out.contains(fragment) {
                continue;
            }
            match simplify_math(fragment) {
                Some(simple) => {
                    out = out.replace(fragment, &simple);
                }
                None => {
                    let renderer = resolve_renderer(math, &mut lazy)?;
                    let file_name = format!("mathml-{counter}.png");
                    counter += 1;
                    let png_rel = plan.opf_dir.join("images").join(&file_name);
                    renderer.render(fragment, &tree.abs(&png_rel))?;
                    let img = format!(
                        "<img class=\"mathml epub-type-se-image-color-depth-black-on-transparent\" \
                         epub:type=\"se:image.color-depth.black-on-transparent\" \
                         src=\"../images/{file_name}\"/>"
                    );
                    out = out.replace(fragment, &img);
                    rendered.push(file_name);
                    debug!(file = %rel.display(), "rasterized a MathML expression");
                }
            }
        }
        tree.get(rel)?.set_text(out);
    }

    if saw_math {
        let opf = tree.get(&plan.opf_rel)?.tree_mut()?;
        for file_name in &rendered {
            epub::add_manifest_item(
                opf,
                &ManifestItem {
                    id: file_name.clone(),
                    href: format!("images/{file_name}"),
                    media_type: "image/png".to_string(),
                    properties: None,
                },
            );
        }
        drop_mathml_property(opf);
    }
    Ok(())
}

fn resolve_renderer<'a>(
    math: Option<&'a dyn MathRasterizer>,
    lazy: &'a mut Option<Box<dyn MathRasterizer>>,
) -> Result<&'a dyn MathRasterizer> {
    if let Some(renderer) = math {
        return Ok(renderer);
    }
    if lazy.is_none() {
        *lazy = Some(Box::new(FirefoxMath::probe()?));
    }
    match lazy {
        Some(renderer) => Ok(&**renderer),
        None => Err(Error::MissingDependency("firefox".to_string())),
    }
}

/// No document embeds MathML any more, so the manifest property goes.
fn drop_mathml_property(opf: &mut Dom) {
    for item in opf.find_all_by_tag("item") {
        let Some(props) = opf.get_attr(item, "properties") else {
            continue;
        };
        let kept: Vec<&str> = props
            .split_whitespace()
            .filter(|p| *p != "mathml")
            .collect();
        if kept.len() == props.split_whitespace().count() {
            continue;
        }
        if kept.is_empty() {
            opf.remove_attr(item, "properties");
        } else {
            let joined = kept.join(" ");
            opf.set_attr(item, "properties", &joined);
        }
    }
}

/// Render a simple MathML expression as plain inline markup: identifiers
/// italicized, scripts as `sub`/`sup`, single-child fences parenthesized.
/// Returns `None` when the expression uses anything richer.
fn simplify_math(fragment: &str) -> Option<String> {
    let dom = dom::parse(fragment, Path::new("mathml")).ok()?;
    let root = dom.root_element()?;
    let mut out = String::new();
    for child in dom.child_ids(root) {
        render_math(&dom, child, &mut out)?;
    }
    Some(out.trim().to_string())
}

const FUNCTION_APPLICATION: char = '\u{2061}';

fn render_math(dom: &Dom, id: NodeId, out: &mut String) -> Option<()> {
    if let Some(text) = dom.text_content(id) {
        if !text.trim().is_empty() {
            out.push_str(&escape_text(text.trim()));
        }
        return Some(());
    }
    if !dom.is_element(id) {
        // Comments and PIs contribute nothing.
        return Some(());
    }
    match dom.local_name(id)? {
        "mrow" => {
            for child in dom.child_ids(id) {
                render_math(dom, child, out)?;
            }
        }
        "mi" => {
            let text = escape_text(dom.text_of(id).trim());
            if dom.get_attr(id, "mathvariant") == Some("normal") {
                out.push_str(&text);
            } else {
                out.push_str(&format!("<i>{text}</i>"));
            }
        }
        "mn" => out.push_str(&escape_text(dom.text_of(id).trim())),
        "mo" => {
            let text = dom.text_of(id).trim().to_string();
            if text.chars().all(|c| c == FUNCTION_APPLICATION) {
                // Invisible function application renders as nothing.
            } else if text.chars().count() == 1
                && matches!(text.chars().next(), Some('+' | '-' | '\u{2212}' | '=' | '\u{d7}'))
            {
                out.push(' ');
                out.push_str(&escape_text(&text));
                out.push(' ');
            } else {
                out.push_str(&escape_text(&text));
            }
        }
        "msub" | "msup" => {
            let tag = if dom.local_name(id) == Some("msub") {
                "sub"
            } else {
                "sup"
            };
            let operands: Vec<NodeId> = dom
                .child_ids(id)
                .into_iter()
                .filter(|c| dom.is_element(*c))
                .collect();
            let [base, script] = operands.as_slice() else {
                return None;
            };
            render_math(dom, *base, out)?;
            out.push_str(&format!("<{tag}>"));
            render_math(dom, *script, out)?;
            out.push_str(&format!("</{tag}>"));
        }
        "mfenced" => {
            let inner: Vec<NodeId> = dom
                .child_ids(id)
                .into_iter()
                .filter(|c| dom.is_element(*c))
                .collect();
            match inner.as_slice() {
                [] => out.push_str("()"),
                [only] => {
                    out.push('(');
                    render_math(dom, *only, out)?;
                    out.push(')');
                }
                // Multiple children render comma-separated; too rich.
                _ => return None,
            }
        }
        _ => return None,
    }
    Some(())
}

fn strip_epub_types(xhtml: &str) -> String {
    static EPUB_TYPE_ATTR_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#" ?epub:type="[^"]*""#).unwrap());
    EPUB_TYPE_ATTR_RE.replace_all(xhtml, "").into_owned()
}

fn cover_path(tree: &mut SourceTree) -> Result<PathBuf> {
    let opf_rel = epub::find_opf_path(tree.root())?;
    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let items = {
        let doc = tree.get(&opf_rel)?;
        epub::manifest_items(doc.tree()?)
    };
    let href = items
        .iter()
        .find(|item| {
            item.properties
                .as_deref()
                .is_some_and(|props| props.split_whitespace().any(|p| p == "cover-image"))
        })
        .map(|item| item.href.clone())
        .ok_or_else(|| Error::InvalidSource("manifest has no cover image".to_string()))?;
    Ok(tree.abs(epub::resolve_href(&opf_dir, &href)))
}
