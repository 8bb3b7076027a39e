//! Deterministic serialization of the arena DOM back to XML text.
//!
//! The writer touches nothing it does not have to: attribute order, text
//! runs, and inter-element whitespace come out exactly as stored, so an
//! unmodified tree round-trips to stable bytes.

use std::fmt::Write;

use super::arena::{Dom, NodeData, NodeId};

/// Serialize a whole document, XML declaration included.
pub fn to_xml(dom: &Dom) -> String {
    let mut out = String::new();
    if let Some(decl) = &dom.xml_decl {
        let _ = write!(out, "<?{decl}?>");
    }
    for child in dom.children(dom.document()) {
        write_node(dom, child, &mut out);
    }
    out
}

/// Serialize a single subtree (used for extracted fragments).
pub fn node_to_xml(dom: &Dom, id: NodeId) -> String {
    let mut out = String::new();
    write_node(dom, id, &mut out);
    out
}

fn write_node(dom: &Dom, id: NodeId, out: &mut String) {
    let node = match dom.get(id) {
        Some(n) => n,
        None => return,
    };
    match &node.data {
        NodeData::Document => {
            for child in dom.children(id) {
                write_node(dom, child, out);
            }
        }
        NodeData::Element { name, attrs, .. } => {
            out.push('<');
            out.push_str(name);
            for attr in attrs {
                out.push(' ');
                out.push_str(&attr.name);
                out.push_str("=\"");
                out.push_str(&escape_attr(&attr.value));
                out.push('"');
            }
            if node.first_child.is_none() {
                out.push_str("/>");
            } else {
                out.push('>');
                for child in dom.children(id) {
                    write_node(dom, child, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
        NodeData::Text(text) => out.push_str(&escape_text(text)),
        NodeData::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
        NodeData::Doctype(raw) => {
            out.push_str("<!DOCTYPE ");
            out.push_str(raw);
            out.push('>');
        }
        NodeData::Pi(raw) => {
            out.push_str("<?");
            out.push_str(raw);
            out.push_str("?>");
        }
    }
}

/// Escape character data.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape an attribute value for double-quoted output.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
