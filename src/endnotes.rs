//! Endnote chunking for oversized endnote files.
//!
//! A single file holding every note in the book chokes legacy renderers once
//! it grows past a few hundred entries; popup-footnote lookups reflow the
//! whole file each time. Past a threshold the file is split into fixed-size
//! chunks and every reference in the publication is rewired to the chunk
//! that actually holds its note.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::dom::{self, Attr, Dom, NodeId};
use crate::epub;
use crate::error::{Error, Result};
use crate::store::SourceTree;

/// Entry count above which an endnotes file is split.
pub const CHUNK_THRESHOLD: usize = 500;
/// Entries per chunk file after a split.
pub const CHUNK_SIZE: usize = 500;

/// One planned chunk file.
struct Chunk {
    file_name: String,
    title: String,
}

/// Split the endnotes file into fixed-size chunks when it holds more than
/// [`CHUNK_THRESHOLD`] entries, rewiring the manifest, the spine, both navs
/// and every inbound reference. Returns the number of chunk files created,
/// zero when the file was left alone.
pub fn chunk_endnotes(
    tree: &mut SourceTree,
    opf_rel: &Path,
    endnotes_rel: &Path,
) -> Result<usize> {
    chunk_with(tree, opf_rel, endnotes_rel, CHUNK_THRESHOLD, CHUNK_SIZE)
}

fn chunk_with(
    tree: &mut SourceTree,
    opf_rel: &Path,
    endnotes_rel: &Path,
    threshold: usize,
    size: usize,
) -> Result<usize> {
    let file_name = endnotes_rel
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::InvalidSource(format!("bad endnotes path {}", endnotes_rel.display()))
        })?
        .to_string();
    let stem = file_name
        .strip_suffix(".xhtml")
        .unwrap_or(&file_name)
        .to_string();

    // Count entries without dirtying the document, then qualify its local
    // anchors and take the serialized form as the template every chunk is
    // cloned from.
    let (total, template) = {
        let doc = tree.get(endnotes_rel)?;
        let dom = doc.tree()?;
        let total = match note_list(dom) {
            Some(list) => entry_items(dom, list).len(),
            None => 0,
        };
        if total <= threshold {
            return Ok(0);
        }
        let dom = doc.tree_mut()?;
        qualify_local_anchors(dom, &file_name);
        (total, dom::to_xml(dom))
    };

    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let toc_rel = {
        let opf = tree.get(opf_rel)?.tree()?;
        epub::manifest_items(opf)
            .iter()
            .find(|item| {
                item.properties
                    .as_deref()
                    .is_some_and(|p| p.split_whitespace().any(|w| w == "nav"))
            })
            .map(|item| epub::resolve_href(&opf_dir, &item.href))
            .ok_or_else(|| Error::InvalidSource("manifest has no nav document".into()))?
    };

    let spans = chunk_spans(total, size);
    info!(
        file = %endnotes_rel.display(),
        entries = total,
        chunks = spans.len(),
        "splitting endnotes"
    );

    // Build each chunk from the template and collect every id it carries.
    // Ids shared by all chunks (the heading, the container section) map to
    // the first chunk that defines them.
    let mut id_map: HashMap<String, String> = HashMap::new();
    let mut chunks = Vec::new();
    for (k, &(first, last)) in spans.iter().enumerate() {
        let chunk_file = format!("{stem}-{}.xhtml", k + 1);
        let chunk_rel = endnotes_rel.with_file_name(&chunk_file);
        let title = range_title(first, last);

        let mut chunk = dom::parse(&template, &chunk_rel)?;
        let list = note_list(&chunk)
            .ok_or_else(|| Error::InvalidSource(format!("{file_name} has no note list")))?;
        retain_entries(&mut chunk, list, first - 1, last);
        if first > 1 {
            chunk.set_attr(list, "start", &first.to_string());
        }
        retitle(&mut chunk, &title);

        for node in chunk.descendants(chunk.document()) {
            if let Some(id) = chunk.element_id(node) {
                id_map
                    .entry(id.to_string())
                    .or_insert_with(|| chunk_file.clone());
            }
        }

        let text = dom::to_xml(&chunk);
        tree.create(&chunk_rel, text);
        chunks.push(Chunk {
            file_name: chunk_file,
            title,
        });
    }

    rewrite_package(tree, opf_rel, endnotes_rel, &chunks)?;
    rewrite_navigation(tree, &toc_rel, endnotes_rel, &chunks)?;

    // The post-rewrite manifest already lists the chunk files and no longer
    // lists the original, so it doubles as the inbound-rewrite walk list.
    let documents: Vec<PathBuf> = {
        let opf = tree.get(opf_rel)?.tree()?;
        epub::manifest_items(opf)
            .iter()
            .filter(|item| item.media_type == "application/xhtml+xml")
            .map(|item| epub::resolve_href(&opf_dir, &item.href))
            .collect()
    };
    rewrite_inbound(
        tree,
        &documents,
        endnotes_rel,
        &file_name,
        &id_map,
        &chunks[0].file_name,
    )?;

    tree.remove(endnotes_rel)?;
    Ok(chunks.len())
}

/// The top-level `<ol>` holding the entries. Document order guarantees the
/// outer list is found before any list nested inside a note body.
fn note_list(dom: &Dom) -> Option<NodeId> {
    let body = dom.find_by_tag("body")?;
    dom.descendants(body)
        .find(|&n| dom.local_name(n) == Some("ol"))
}

/// Direct `<li>` children of the note list, in document order.
fn entry_items(dom: &Dom, list: NodeId) -> Vec<NodeId> {
    dom.children(list)
        .filter(|&n| dom.local_name(n) == Some("li"))
        .collect()
}

/// Split `total` entries into 1-based inclusive `(first, last)` spans of at
/// most `size` entries each.
fn chunk_spans(total: usize, size: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut first = 1;
    while first <= total {
        let last = usize::min(first + size - 1, total);
        spans.push((first, last));
        first = last + 1;
    }
    spans
}

fn range_title(first: usize, last: usize) -> String {
    format!("Endnotes {first}\u{2013}{last}")
}

/// Rewrite every `#id` self-reference to `file.xhtml#id` so the links
/// survive redistribution across chunk files.
fn qualify_local_anchors(dom: &mut Dom, file_name: &str) {
    for a in dom.find_all_by_tag("a") {
        let Some(frag) = dom
            .get_attr(a, "href")
            .and_then(|h| h.strip_prefix('#'))
            .map(str::to_string)
        else {
            continue;
        };
        dom.set_attr(a, "href", &format!("{file_name}#{frag}"));
    }
}

/// Drop every entry outside `from..to` (zero-based, half-open) from the
/// list, along with the indentation text node in front of it.
fn retain_entries(dom: &mut Dom, list: NodeId, from: usize, to: usize) {
    let entries = entry_items(dom, list);
    for (i, &li) in entries.iter().enumerate() {
        if i >= from && i < to {
            continue;
        }
        if let Some(prev) = dom.get(li).map(|n| n.prev_sibling) {
            if dom.text_content(prev).is_some_and(|t| t.trim().is_empty()) {
                dom.detach(prev);
            }
        }
        dom.detach(li);
    }
}

/// Point `<title>` and the visible heading at the chunk's entry range.
fn retitle(dom: &mut Dom, title: &str) {
    if let Some(t) = dom.find_by_tag("title") {
        dom.set_text(t, title);
    }
    if let Some(h) = dom
        .descendants(dom.document())
        .find(|&n| matches!(dom.local_name(n), Some("h2") | Some("h3")))
    {
        dom.set_text(h, title);
    }
}

/// Swap the final path segment of an href, keeping directory and fragment.
fn swap_href_file(href: &str, new_file: &str) -> String {
    let (path, frag) = match href.split_once('#') {
        Some((p, f)) => (p, Some(f)),
        None => (href, None),
    };
    let swapped = match path.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{new_file}"),
        None => new_file.to_string(),
    };
    match frag {
        Some(f) => format!("{swapped}#{f}"),
        None => swapped,
    }
}

/// Replace the single manifest item and spine itemref with one per chunk,
/// in order, preserving the surrounding indentation.
fn rewrite_package(
    tree: &mut SourceTree,
    opf_rel: &Path,
    endnotes_rel: &Path,
    chunks: &[Chunk],
) -> Result<()> {
    let opf_dir = opf_rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let opf = tree.get(opf_rel)?.tree_mut()?;

    let manifest = epub::find_child(opf, "manifest")
        .ok_or_else(|| Error::InvalidSource("package has no manifest".into()))?;
    let old_item = opf
        .children(manifest)
        .find(|&id| {
            opf.get_attr(id, "href")
                .is_some_and(|h| epub::resolve_href(&opf_dir, h) == endnotes_rel)
        })
        .ok_or_else(|| {
            Error::InvalidSource(format!("{} is not in the manifest", endnotes_rel.display()))
        })?;
    let old_href = opf.get_attr(old_item, "href").unwrap_or_default().to_string();
    let old_id = opf.get_attr(old_item, "id").unwrap_or_default().to_string();

    for (i, chunk) in chunks.iter().enumerate() {
        let item = opf.create_element(
            "item",
            vec![
                Attr {
                    name: "href".into(),
                    value: swap_href_file(&old_href, &chunk.file_name),
                },
                Attr {
                    name: "id".into(),
                    value: chunk.file_name.clone(),
                },
                Attr {
                    name: "media-type".into(),
                    value: "application/xhtml+xml".into(),
                },
            ],
        );
        opf.insert_before(old_item, item);
        if i + 1 < chunks.len() {
            let ws = opf.create_text("\n\t\t");
            opf.insert_before(old_item, ws);
        }
    }
    opf.detach(old_item);

    let spine = epub::find_child(opf, "spine")
        .ok_or_else(|| Error::InvalidSource("package has no spine".into()))?;
    let old_ref = opf
        .children(spine)
        .find(|&id| opf.get_attr(id, "idref") == Some(old_id.as_str()))
        .ok_or_else(|| Error::InvalidSource(format!("spine has no itemref for {old_id}")))?;
    for (i, chunk) in chunks.iter().enumerate() {
        let itemref = opf.create_element(
            "itemref",
            vec![Attr {
                name: "idref".into(),
                value: chunk.file_name.clone(),
            }],
        );
        opf.insert_before(old_ref, itemref);
        if i + 1 < chunks.len() {
            let ws = opf.create_text("\n\t\t");
            opf.insert_before(old_ref, ws);
        }
    }
    opf.detach(old_ref);

    Ok(())
}

/// Expand the ToC entry for the old file into one entry per chunk and point
/// the landmarks entry at the first chunk.
fn rewrite_navigation(
    tree: &mut SourceTree,
    toc_rel: &Path,
    endnotes_rel: &Path,
    chunks: &[Chunk],
) -> Result<()> {
    let toc_dir = toc_rel.parent().unwrap_or(Path::new("")).to_path_buf();
    let toc = tree.get(toc_rel)?.tree_mut()?;

    for nav in toc.find_all_by_tag("nav") {
        let kind = toc.get_attr(nav, "epub:type").unwrap_or_default().to_string();
        let is_toc = kind.split_whitespace().any(|w| w == "toc");
        let is_landmarks = kind.split_whitespace().any(|w| w == "landmarks");
        if !is_toc && !is_landmarks {
            continue;
        }
        let anchors: Vec<NodeId> = toc
            .descendants(nav)
            .filter(|&n| toc.local_name(n) == Some("a"))
            .collect();
        for a in anchors {
            let Some(href) = toc.get_attr(a, "href").map(str::to_string) else {
                continue;
            };
            if epub::resolve_href(&toc_dir, &href) != endnotes_rel {
                continue;
            }
            if is_landmarks {
                toc.set_attr(a, "href", &swap_href_file(&href, &chunks[0].file_name));
            } else {
                expand_toc_entry(toc, a, &href, chunks);
            }
        }
    }
    Ok(())
}

/// Replace the `<li>` holding `anchor` with one row per chunk, reusing the
/// original row's leading whitespace as the separator.
fn expand_toc_entry(toc: &mut Dom, anchor: NodeId, href: &str, chunks: &[Chunk]) {
    let mut li = anchor;
    while li.is_some() && toc.local_name(li) != Some("li") {
        li = toc.parent(li);
    }
    if li.is_none() {
        return;
    }
    let sep = toc
        .get(li)
        .map(|n| n.prev_sibling)
        .and_then(|p| toc.text_content(p))
        .filter(|t| t.trim().is_empty())
        .map(str::to_string);

    for (i, chunk) in chunks.iter().enumerate() {
        let new_a = toc.create_element(
            "a",
            vec![Attr {
                name: "href".into(),
                value: swap_href_file(href, &chunk.file_name),
            }],
        );
        let label = toc.create_text(chunk.title.clone());
        toc.append(new_a, label);
        let new_li = toc.create_element("li", Vec::new());
        toc.append(new_li, new_a);
        toc.insert_before(li, new_li);
        if i + 1 < chunks.len() {
            if let Some(sep) = &sep {
                let ws = toc.create_text(sep.clone());
                toc.insert_before(li, ws);
            }
        }
    }
    toc.detach(li);
}

/// Point every reference to the old file at the chunk holding its note.
/// Fragmentless links land on the first chunk.
fn rewrite_inbound(
    tree: &mut SourceTree,
    documents: &[PathBuf],
    endnotes_rel: &Path,
    file_name: &str,
    id_map: &HashMap<String, String>,
    first_chunk: &str,
) -> Result<()> {
    for rel in documents {
        let doc_dir = rel.parent().unwrap_or(Path::new("")).to_path_buf();
        let doc = tree.get(rel)?;
        // Cheap pre-filter keeps untouched documents out of the dirty set.
        if !doc.text().contains(file_name) {
            continue;
        }
        let dom = doc.tree_mut()?;
        for a in dom.find_all_by_tag("a") {
            let Some(href) = dom.get_attr(a, "href").map(str::to_string) else {
                continue;
            };
            if epub::resolve_href(&doc_dir, &href) != endnotes_rel {
                continue;
            }
            let new_href = match href.split_once('#') {
                Some((_, frag)) => {
                    let target = id_map.get(frag).ok_or_else(|| Error::DanglingReference {
                        file: rel.clone(),
                        id: frag.to_string(),
                    })?;
                    swap_href_file(&href, target)
                }
                None => swap_href_file(&href, first_chunk),
            };
            dom.set_attr(a, "href", &new_href);
        }
    }
    Ok(())
}
