//! EPUB package plumbing: container discovery, OPF access, and zip packaging.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::debug;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::dom::{Attr, Dom, NodeId};
use crate::error::{Error, Result};
use crate::store::SourceTree;

/// One `<item>` in the package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

/// Package metadata the pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub title: String,
    pub authors: Vec<String>,
    pub language: String,
    /// Full `dc:identifier` value (a URL for our sources).
    pub identifier: String,
}

/// Locate the OPF (root-relative) via `META-INF/container.xml`.
pub fn find_opf_path(container_root: &Path) -> Result<PathBuf> {
    let container = fs::read_to_string(container_root.join("META-INF/container.xml"))?;

    let mut reader = Reader::from_str(&container);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if e.name().as_ref() == b"rootfile" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"full-path" {
                        return Ok(PathBuf::from(String::from_utf8(attr.value.to_vec())?));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    Err(Error::InvalidSource(
        "no rootfile in META-INF/container.xml".into(),
    ))
}

/// Extract pipeline metadata from a parsed OPF tree.
pub fn metadata(opf: &Dom) -> Result<Metadata> {
    let mut meta = Metadata::default();
    for id in opf.descendants(opf.document()) {
        match opf.element_name(id) {
            Some("dc:title") => {
                if meta.title.is_empty() {
                    meta.title = opf.text_of(id);
                }
            }
            Some("dc:creator") => meta.authors.push(opf.text_of(id)),
            Some("dc:language") => meta.language = opf.text_of(id),
            Some("dc:identifier") => {
                if meta.identifier.is_empty() {
                    meta.identifier = opf.text_of(id);
                }
            }
            _ => {}
        }
    }
    if meta.title.is_empty() {
        return Err(Error::InvalidSource("OPF has no dc:title".into()));
    }
    if meta.identifier.is_empty() {
        return Err(Error::InvalidSource("OPF has no dc:identifier".into()));
    }
    Ok(meta)
}

/// All manifest items, in document order.
pub fn manifest_items(opf: &Dom) -> Vec<ManifestItem> {
    let mut items = Vec::new();
    let Some(manifest) = find_child(opf, "manifest") else {
        return items;
    };
    for id in opf.children(manifest) {
        if opf.local_name(id) != Some("item") {
            continue;
        }
        items.push(ManifestItem {
            id: opf.get_attr(id, "id").unwrap_or("").to_string(),
            href: opf.get_attr(id, "href").unwrap_or("").to_string(),
            media_type: opf.get_attr(id, "media-type").unwrap_or("").to_string(),
            properties: opf.get_attr(id, "properties").map(str::to_string),
        });
    }
    items
}

/// Spine idrefs, in order.
pub fn spine_idrefs(opf: &Dom) -> Vec<String> {
    let mut idrefs = Vec::new();
    let Some(spine) = find_child(opf, "spine") else {
        return idrefs;
    };
    for id in opf.children(spine) {
        if opf.local_name(id) == Some("itemref") {
            if let Some(idref) = opf.get_attr(id, "idref") {
                idrefs.push(idref.to_string());
            }
        }
    }
    idrefs
}

/// Find a direct child of `<package>` by local name (`metadata`, `manifest`,
/// `spine`, `guide`).
pub fn find_child(opf: &Dom, name: &str) -> Option<NodeId> {
    let package = opf.root_element()?;
    opf.children(package).find(|id| opf.local_name(*id) == Some(name))
}

/// Append a manifest item element.
pub fn add_manifest_item(opf: &mut Dom, item: &ManifestItem) {
    let Some(manifest) = find_child(opf, "manifest") else {
        return;
    };
    let mut attrs = vec![
        Attr {
            name: "href".into(),
            value: item.href.clone(),
        },
        Attr {
            name: "id".into(),
            value: item.id.clone(),
        },
        Attr {
            name: "media-type".into(),
            value: item.media_type.clone(),
        },
    ];
    if let Some(props) = &item.properties {
        attrs.push(Attr {
            name: "properties".into(),
            value: props.clone(),
        });
    }
    let node = opf.create_element("item", attrs);
    // Keep the manifest's closing indentation stable: insert before the
    // trailing whitespace node when there is one.
    let last = opf.get(manifest).map(|n| n.last_child).unwrap_or(NodeId::NONE);
    let indent = opf.create_text("\n\t\t");
    if opf.text_content(last).is_some_and(|t| t.trim().is_empty()) {
        opf.insert_before(last, indent);
        opf.insert_before(last, node);
    } else {
        opf.append(manifest, indent);
        opf.append(manifest, node);
    }
}

/// Structural check: manifest ids unique, every href present on disk.
pub fn check_manifest(tree: &SourceTree, opf_dir: &Path, items: &[ManifestItem]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for item in items {
        if !seen.insert(item.id.clone()) {
            return Err(Error::InvalidSource(format!(
                "duplicate manifest id `{}`",
                item.id
            )));
        }
        let rel = resolve_href(opf_dir, &item.href);
        if !tree.exists(&rel) {
            return Err(Error::MissingAsset(tree.abs(rel)));
        }
    }
    Ok(())
}

/// Resolve an href against the directory of the referring file, handling
/// `../` segments and percent-encoding.
pub fn resolve_href(base_dir: &Path, href: &str) -> PathBuf {
    let decoded = percent_encoding::percent_decode_str(href)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| href.to_string());
    let without_fragment = decoded.split('#').next().unwrap_or("");

    let mut parts: Vec<&str> = base_dir
        .to_str()
        .unwrap_or("")
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();
    for seg in without_fragment.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    PathBuf::from(parts.join("/"))
}

const MIMETYPE: &str = "application/epub+zip";

/// Package a container-layout tree into an EPUB zip at `output`.
///
/// The `mimetype` entry goes first and uncompressed, per OCF; everything
/// else is deflated in sorted walk order so the archive is reproducible.
pub fn write_container(container_root: &Path, output: &Path) -> Result<()> {
    let file = File::create(output)?;
    let mut zip = ZipWriter::new(file);

    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("mimetype", stored)?;
    zip.write_all(MIMETYPE.as_bytes())?;

    let deflated =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries = Vec::new();
    collect_files(container_root, container_root, &mut entries)?;
    entries.sort();

    for rel in entries {
        if rel == Path::new("mimetype") {
            continue;
        }
        let name = rel
            .to_str()
            .ok_or_else(|| Error::InvalidSource(format!("non-UTF-8 path {}", rel.display())))?
            .replace('\\', "/");
        zip.start_file(name, deflated)?;
        let bytes = fs::read(container_root.join(&rel))?;
        zip.write_all(&bytes)?;
    }

    zip.finish()?;
    debug!(output = %output.display(), "wrote container");
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            out.push(path.strip_prefix(root).unwrap().to_path_buf());
        }
    }
    Ok(())
}
