//! Strict XML parsing into the arena DOM.
//!
//! EPUB3 source documents are well-formed XML, so parsing is event-based and
//! unforgiving. Any malformation is reported with the file path and a
//! 1-based line/column derived from the reader's byte position.

use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::arena::{Attr, Dom, NodeId};
use crate::error::{Error, Result};

/// Parse a source document into a [`Dom`]. `path` is used for error context
/// only; the content comes from `source`.
pub fn parse(source: &str, path: &Path) -> Result<Dom> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().check_end_names = true;

    let mut dom = Dom::new();
    // Open-element stack; the document root is the outermost "element".
    let mut stack: Vec<NodeId> = vec![dom.document()];

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                return Err(located(path, source, reader.error_position(), e.to_string()));
            }
        };
        let parent = *stack.last().unwrap_or(&NodeId::NONE);

        match event {
            Event::Decl(e) => {
                dom.xml_decl = Some(String::from_utf8_lossy(e.as_ref()).into_owned());
            }
            Event::DocType(e) => {
                let raw = String::from_utf8_lossy(e.as_ref()).trim().to_string();
                let node = dom.create_doctype(raw);
                dom.append(parent, node);
            }
            Event::PI(e) => {
                let node = dom.create_pi(String::from_utf8_lossy(e.as_ref()).into_owned());
                dom.append(parent, node);
            }
            Event::Start(e) => {
                let node = element_from_start(&mut dom, &e, path, source, &reader)?;
                dom.append(parent, node);
                stack.push(node);
            }
            Event::Empty(e) => {
                let node = element_from_start(&mut dom, &e, path, source, &reader)?;
                dom.append(parent, node);
            }
            Event::End(_) => {
                // Name agreement is already checked by the reader.
                if stack.len() > 1 {
                    stack.pop();
                }
            }
            Event::Text(e) => {
                append_text(&mut dom, parent, &String::from_utf8_lossy(e.as_ref()));
            }
            Event::CData(e) => {
                append_text(&mut dom, parent, &String::from_utf8_lossy(e.as_ref()));
            }
            Event::GeneralRef(e) => {
                let entity = String::from_utf8_lossy(e.as_ref()).into_owned();
                let resolved = resolve_entity(&entity).ok_or_else(|| {
                    located(
                        path,
                        source,
                        reader.buffer_position(),
                        format!("unknown entity `&{entity};`"),
                    )
                })?;
                let mut buf = String::new();
                buf.push(resolved);
                append_text(&mut dom, parent, &buf);
            }
            Event::Comment(e) => {
                let node = dom.create_comment(String::from_utf8_lossy(e.as_ref()).into_owned());
                dom.append(parent, node);
            }
            Event::Eof => break,
        }
    }

    if dom.root_element().is_none() {
        return Err(located(path, source, reader.buffer_position(), "no root element".into()));
    }

    Ok(dom)
}

fn element_from_start(
    dom: &mut Dom,
    e: &BytesStart<'_>,
    path: &Path,
    source: &str,
    reader: &Reader<&[u8]>,
) -> Result<NodeId> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();

    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| {
            located(path, source, reader.buffer_position(), err.to_string())
        })?;
        let value = attr.unescape_value().map_err(|err| {
            located(path, source, reader.buffer_position(), err.to_string())
        })?;
        attrs.push(Attr {
            name: String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value: value.into_owned(),
        });
    }

    Ok(dom.create_element(name, attrs))
}

/// Append text, merging with a trailing text node so entity references do
/// not fragment runs.
fn append_text(dom: &mut Dom, parent: NodeId, text: &str) {
    let last_child = dom.get(parent).map(|n| n.last_child).unwrap_or(NodeId::NONE);
    if let Some(existing) = dom.text_content(last_child) {
        let merged = format!("{existing}{text}");
        dom.set_text(last_child, merged);
        return;
    }
    let node = dom.create_text(text);
    dom.append(parent, node);
}

/// Resolve a general entity reference body (`amp` for `&amp;`, `#8212` for a
/// numeric reference).
fn resolve_entity(entity: &str) -> Option<char> {
    if let Some(num) = entity.strip_prefix('#') {
        let code = if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            num.parse::<u32>().ok()?
        };
        return char::from_u32(code);
    }
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => None,
    }
}

/// Turn a byte offset into a located parse error.
fn located(path: &Path, source: &str, offset: u64, detail: String) -> Error {
    let offset = (offset as usize).min(source.len());
    let consumed = &source.as_bytes()[..offset];
    let line = 1 + consumed.iter().filter(|b| **b == b'\n').count() as u64;
    let col = 1 + consumed
        .iter()
        .rev()
        .take_while(|b| **b != b'\n')
        .count() as u64;
    Error::Parse {
        path: path.to_path_buf(),
        line,
        col,
        detail,
    }
}
