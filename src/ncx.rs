//! EPUB 2 navigation fallbacks derived from the EPUB 3 nav document.
//!
//! Older readers ignore the nav ToC entirely, so the compatible build
//! carries a generated `toc.ncx` plus an OPF `<guide>` mirroring the nav
//! landmarks. The nav document stays the source of truth; everything here
//! is derived from it and regenerated on every build.

use std::path::Path;

use crate::dom::{escape_attr, escape_text, Attr, Dom, NodeId};
use crate::epub::{self, ManifestItem};
use crate::error::{Error, Result};
use crate::store::SourceTree;

/// One entry of the nav ToC, flattened out of the `ol`/`li` nesting.
struct TocEntry {
    label: String,
    href: String,
    children: Vec<TocEntry>,
}

/// Regenerate `toc.ncx` next to the OPF and mirror the nav landmarks into
/// an OPF `<guide>`, wiring the spine and manifest up for EPUB 2 readers.
pub fn generate(tree: &mut SourceTree, opf_rel: &Path, toc_rel: &Path) -> Result<()> {
    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();

    let (title, identifier) = {
        let doc = tree.get(opf_rel)?;
        let meta = epub::metadata(doc.tree()?)?;
        (meta.title, meta.identifier)
    };

    let (entries, landmarks) = {
        let doc = tree.get(toc_rel)?;
        let dom = doc.tree()?;
        (toc_entries(dom)?, landmark_references(dom))
    };

    let ncx = render_ncx(&title, &identifier, &entries);
    let ncx_rel = opf_dir.join("toc.ncx");
    if tree.exists(&ncx_rel) {
        tree.get(&ncx_rel)?.set_text(ncx);
    } else {
        tree.create(&ncx_rel, ncx);
    }

    // Regeneration must be able to run on its own output: the Kindle
    // branch rebuilds the NCX after flattening the nav ToC.
    let opf = tree.get(opf_rel)?.tree_mut()?;
    if !epub::manifest_items(opf).iter().any(|item| item.id == "ncx") {
        epub::add_manifest_item(
            opf,
            &ManifestItem {
                id: "ncx".to_string(),
                href: "toc.ncx".to_string(),
                media_type: "application/x-dtbncx+xml".to_string(),
                properties: None,
            },
        );
    }
    if let Some(spine) = epub::find_child(opf, "spine") {
        opf.set_attr(spine, "toc", "ncx");
    }
    add_cover_meta(opf);
    add_guide(opf, &landmarks);
    Ok(())
}

/// Collect the nested entry list from the `epub:type="toc"` nav.
fn toc_entries(dom: &Dom) -> Result<Vec<TocEntry>> {
    let nav = find_nav(dom, "toc").ok_or_else(|| {
        Error::InvalidSource("navigation document has no toc nav".to_string())
    })?;
    let list = dom
        .children(nav)
        .find(|id| dom.local_name(*id) == Some("ol"))
        .ok_or_else(|| Error::InvalidSource("toc nav has no list".to_string()))?;
    Ok(entries_of(dom, list))
}

fn entries_of(dom: &Dom, list: NodeId) -> Vec<TocEntry> {
    let mut entries = Vec::new();
    for li in dom.children(list) {
        if dom.local_name(li) != Some("li") {
            continue;
        }
        let Some(anchor) = dom
            .children(li)
            .find(|id| dom.local_name(*id) == Some("a"))
        else {
            continue;
        };
        let children = dom
            .children(li)
            .find(|id| dom.local_name(*id) == Some("ol"))
            .map(|nested| entries_of(dom, nested))
            .unwrap_or_default();
        entries.push(TocEntry {
            label: normalize_label(&dom.text_of(anchor)),
            href: dom.get_attr(anchor, "href").unwrap_or("").to_string(),
            children,
        });
    }
    entries
}

fn normalize_label(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_nav(dom: &Dom, kind: &str) -> Option<NodeId> {
    dom.find_all_by_tag("nav").into_iter().find(|id| {
        dom.get_attr(*id, "epub:type")
            .is_some_and(|value| value.split_whitespace().any(|token| token == kind))
    })
}

fn render_ncx(title: &str, identifier: &str, entries: &[TocEntry]) -> String {
    let mut ncx = String::new();
    ncx.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    ncx.push_str(
        "<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n",
    );
    ncx.push_str("\t<head>\n");
    ncx.push_str(&format!(
        "\t\t<meta name=\"dtb:uid\" content=\"{}\"/>\n",
        escape_attr(identifier)
    ));
    ncx.push_str(&format!(
        "\t\t<meta name=\"dtb:depth\" content=\"{}\"/>\n",
        depth_of(entries)
    ));
    ncx.push_str("\t\t<meta name=\"dtb:totalPageCount\" content=\"0\"/>\n");
    ncx.push_str("\t\t<meta name=\"dtb:maxPageNumber\" content=\"0\"/>\n");
    ncx.push_str("\t</head>\n");
    ncx.push_str("\t<docTitle>\n");
    ncx.push_str(&format!("\t\t<text>{}</text>\n", escape_text(title)));
    ncx.push_str("\t</docTitle>\n");
    ncx.push_str("\t<navMap id=\"navmap\">\n");

    // Play order is a single counter threaded through the recursion so
    // nested entries keep document order.
    let mut play_order = 1usize;
    for entry in entries {
        write_nav_point(&mut ncx, entry, &mut play_order, 2);
    }

    ncx.push_str("\t</navMap>\n</ncx>\n");
    ncx
}

fn write_nav_point(ncx: &mut String, entry: &TocEntry, play_order: &mut usize, depth: usize) {
    let indent = "\t".repeat(depth);
    ncx.push_str(&format!(
        "{indent}<navPoint id=\"navpoint-{n}\" playOrder=\"{n}\">\n",
        n = play_order
    ));
    ncx.push_str(&format!(
        "{indent}\t<navLabel>\n{indent}\t\t<text>{}</text>\n{indent}\t</navLabel>\n",
        escape_text(&entry.label)
    ));
    ncx.push_str(&format!(
        "{indent}\t<content src=\"{}\"/>\n",
        escape_attr(&entry.href)
    ));
    *play_order += 1;
    for child in &entry.children {
        write_nav_point(ncx, child, play_order, depth + 1);
    }
    ncx.push_str(&format!("{indent}</navPoint>\n"));
}

fn depth_of(entries: &[TocEntry]) -> usize {
    entries
        .iter()
        .map(|entry| 1 + depth_of(&entry.children))
        .max()
        .unwrap_or(0)
}

/// Guide reference types EPUB 2 readers understand. `frontmatter` and
/// `backmatter` are structural qualifiers, not destinations, so they are
/// dropped before the lookup.
const GUIDE_TYPES: &[&str] = &[
    "acknowledgements",
    "bibliography",
    "colophon",
    "copyright-page",
    "cover",
    "dedication",
    "epigraph",
    "foreword",
    "glossary",
    "index",
    "loi",
    "lot",
    "notes",
    "preface",
    "bodymatter",
    "titlepage",
    "toc",
];

struct GuideReference {
    kind: Option<String>,
    href: String,
    title: String,
}

fn landmark_references(dom: &Dom) -> Vec<GuideReference> {
    let Some(nav) = find_nav(dom, "landmarks") else {
        return Vec::new();
    };
    let mut references = Vec::new();
    for anchor in dom.find_all_by_tag("a") {
        let mut ancestor = dom.parent(anchor);
        let mut inside = false;
        while ancestor.is_some() {
            if ancestor == nav {
                inside = true;
                break;
            }
            ancestor = dom.parent(ancestor);
        }
        if !inside {
            continue;
        }
        references.push(GuideReference {
            kind: dom.get_attr(anchor, "epub:type").and_then(guide_type),
            href: dom.get_attr(anchor, "href").unwrap_or("").to_string(),
            title: normalize_label(&dom.text_of(anchor)),
        });
    }
    references
}

/// Map an `epub:type` value onto the legacy guide vocabulary. The
/// titlepage doubles as the `text` start-reading target.
fn guide_type(epub_type: &str) -> Option<String> {
    let token = epub_type
        .split_whitespace()
        .find(|token| GUIDE_TYPES.contains(token))?;
    Some(match token {
        "copyright-page" => "copyright page".to_string(),
        "titlepage" => "title-page text".to_string(),
        other => other.to_string(),
    })
}

/// Insert the EPUB 2 cover meta as the first metadata child.
fn add_cover_meta(opf: &mut Dom) {
    let Some(metadata) = epub::find_child(opf, "metadata") else {
        return;
    };
    let already = opf
        .children(metadata)
        .any(|id| opf.local_name(id) == Some("meta") && opf.get_attr(id, "name") == Some("cover"));
    if already {
        return;
    }
    let cover_id = epub::manifest_items(opf)
        .into_iter()
        .find(|item| {
            item.properties
                .as_deref()
                .is_some_and(|props| props.split_whitespace().any(|p| p == "cover-image"))
        })
        .map(|item| item.id);
    let Some(cover_id) = cover_id else {
        return;
    };
    let meta = opf.create_element(
        "meta",
        vec![
            Attr {
                name: "content".into(),
                value: cover_id,
            },
            Attr {
                name: "name".into(),
                value: "cover".into(),
            },
        ],
    );
    let indent = opf.create_text("\n\t\t");
    match opf.child_ids(metadata).first().copied() {
        Some(first) => {
            opf.insert_before(first, indent);
            opf.insert_before(first, meta);
        }
        None => {
            opf.append(metadata, indent);
            opf.append(metadata, meta);
        }
    }
}

/// Append a `<guide>` after the spine, one `<reference>` per landmark.
/// An existing guide is replaced wholesale.
fn add_guide(opf: &mut Dom, references: &[GuideReference]) {
    if let Some(existing) = epub::find_child(opf, "guide") {
        opf.detach(existing);
    }
    if references.is_empty() {
        return;
    }
    let Some(package) = opf.root_element() else {
        return;
    };
    let guide = opf.create_element("guide", Vec::new());
    for reference in references {
        let mut attrs = Vec::new();
        if let Some(kind) = &reference.kind {
            attrs.push(Attr {
                name: "type".into(),
                value: kind.clone(),
            });
        }
        attrs.push(Attr {
            name: "href".into(),
            value: reference.href.clone(),
        });
        attrs.push(Attr {
            name: "title".into(),
            value: reference.title.clone(),
        });
        let node = opf.create_element("reference", attrs);
        let indent = opf.create_text("\n\t\t");
        opf.append(guide, indent);
        opf.append(guide, node);
    }
    let close = opf.create_text("\n\t");
    opf.append(guide, close);

    let indent = opf.create_text("\n\t");
    opf.append(package, indent);
    opf.append(package, guide);
    let trailing = opf.create_text("\n");
    opf.append(package, trailing);
}
