//! Arena-based DOM for EPUB source documents.
//!
//! All nodes live in a contiguous vector; parent/child/sibling links are
//! indices into it. Element names and attributes are stored exactly as
//! written (prefixes included), which keeps serialization deterministic.

use std::collections::HashMap;

/// Unique identifier for a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel value for no node.
    pub const NONE: NodeId = NodeId(u32::MAX);

    pub fn is_some(&self) -> bool {
        self.0 != u32::MAX
    }

    pub fn is_none(&self) -> bool {
        self.0 == u32::MAX
    }
}

/// An attribute, name as written in the source (prefix included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub name: String,
    pub value: String,
}

/// Node type in the arena.
#[derive(Debug, Clone)]
pub enum NodeData {
    /// Document root.
    Document,
    /// Element with qualified name and attributes in source order.
    Element {
        name: String,
        attrs: Vec<Attr>,
        /// Pre-extracted id for fast lookup and selector matching.
        id: Option<String>,
        /// Pre-split class list for fast selector matching.
        classes: Vec<String>,
    },
    /// Text content (entity references already resolved).
    Text(String),
    /// Comment body.
    Comment(String),
    /// Everything between `<!DOCTYPE ` and `>`.
    Doctype(String),
    /// Processing instruction body.
    Pi(String),
}

/// A node in the arena.
#[derive(Debug)]
pub struct Node {
    pub data: NodeData,
    pub parent: NodeId,
    pub first_child: NodeId,
    pub last_child: NodeId,
    pub prev_sibling: NodeId,
    pub next_sibling: NodeId,
}

impl Node {
    fn new(data: NodeData) -> Self {
        Self {
            data,
            parent: NodeId::NONE,
            first_child: NodeId::NONE,
            last_child: NodeId::NONE,
            prev_sibling: NodeId::NONE,
            next_sibling: NodeId::NONE,
        }
    }
}

/// Arena-allocated XML tree.
///
/// Detached nodes stay allocated until the tree is dropped; a tree lives for
/// at most one build.
#[derive(Debug)]
pub struct Dom {
    nodes: Vec<Node>,
    document: NodeId,
    /// `<?xml …?>` declaration body, verbatim, if the source had one.
    pub xml_decl: Option<String>,
    id_map: HashMap<String, NodeId>,
}

impl Dom {
    pub fn new() -> Self {
        let mut dom = Self {
            nodes: Vec::new(),
            document: NodeId::NONE,
            xml_decl: None,
            id_map: HashMap::new(),
        };
        dom.document = dom.alloc(Node::new(NodeData::Document));
        dom
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn document(&self) -> NodeId {
        self.document
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        if id.is_none() {
            return None;
        }
        self.nodes.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if id.is_none() {
            return None;
        }
        self.nodes.get_mut(id.0 as usize)
    }

    /// Create an element node, pre-extracting id and class.
    pub fn create_element(&mut self, name: impl Into<String>, attrs: Vec<Attr>) -> NodeId {
        let mut id = None;
        let mut classes = Vec::new();

        for attr in &attrs {
            if attr.name == "id" {
                id = Some(attr.value.clone());
            } else if attr.name == "class" {
                classes = attr.value.split_whitespace().map(str::to_string).collect();
            }
        }

        let node_id = self.alloc(Node::new(NodeData::Element {
            name: name.into(),
            attrs,
            id: id.clone(),
            classes,
        }));

        if let Some(id_str) = id {
            self.id_map.insert(id_str, node_id);
        }

        node_id
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(Node::new(NodeData::Text(text.into())))
    }

    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(Node::new(NodeData::Comment(text.into())))
    }

    pub fn create_doctype(&mut self, raw: impl Into<String>) -> NodeId {
        self.alloc(Node::new(NodeData::Doctype(raw.into())))
    }

    pub fn create_pi(&mut self, raw: impl Into<String>) -> NodeId {
        self.alloc(Node::new(NodeData::Pi(raw.into())))
    }

    /// Append a child to a parent node.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);

        let last_child = self.get(parent).map(|n| n.last_child).unwrap_or(NodeId::NONE);

        if let Some(child_node) = self.get_mut(child) {
            child_node.parent = parent;
            child_node.prev_sibling = last_child;
        }

        if last_child.is_some() {
            if let Some(last_node) = self.get_mut(last_child) {
                last_node.next_sibling = child;
            }
        }

        if let Some(parent_node) = self.get_mut(parent) {
            if parent_node.first_child.is_none() {
                parent_node.first_child = child;
            }
            parent_node.last_child = child;
        }
    }

    /// Insert a node before a sibling.
    pub fn insert_before(&mut self, sibling: NodeId, new_node: NodeId) {
        self.detach(new_node);

        let parent = self.get(sibling).map(|n| n.parent).unwrap_or(NodeId::NONE);
        let prev = self.get(sibling).map(|n| n.prev_sibling).unwrap_or(NodeId::NONE);

        if let Some(new) = self.get_mut(new_node) {
            new.parent = parent;
            new.prev_sibling = prev;
            new.next_sibling = sibling;
        }

        if let Some(sib) = self.get_mut(sibling) {
            sib.prev_sibling = new_node;
        }

        if prev.is_some() {
            if let Some(p) = self.get_mut(prev) {
                p.next_sibling = new_node;
            }
        } else if let Some(par) = self.get_mut(parent) {
            par.first_child = new_node;
        }
    }

    /// Insert a node after a sibling.
    pub fn insert_after(&mut self, sibling: NodeId, new_node: NodeId) {
        let next = self.get(sibling).map(|n| n.next_sibling).unwrap_or(NodeId::NONE);
        if next.is_some() {
            self.insert_before(next, new_node);
        } else {
            let parent = self.get(sibling).map(|n| n.parent).unwrap_or(NodeId::NONE);
            self.append(parent, new_node);
        }
    }

    /// Unlink a node from its parent and siblings. The node itself (and its
    /// subtree) stays alive and can be re-inserted.
    pub fn detach(&mut self, id: NodeId) {
        let (parent, prev, next) = match self.get(id) {
            Some(n) => (n.parent, n.prev_sibling, n.next_sibling),
            None => return,
        };
        if parent.is_none() && prev.is_none() && next.is_none() {
            return;
        }

        if prev.is_some() {
            if let Some(p) = self.get_mut(prev) {
                p.next_sibling = next;
            }
        } else if let Some(par) = self.get_mut(parent) {
            par.first_child = next;
        }

        if next.is_some() {
            if let Some(n) = self.get_mut(next) {
                n.prev_sibling = prev;
            }
        } else if let Some(par) = self.get_mut(parent) {
            par.last_child = prev;
        }

        if let Some(node) = self.get_mut(id) {
            node.parent = NodeId::NONE;
            node.prev_sibling = NodeId::NONE;
            node.next_sibling = NodeId::NONE;
        }
    }

    /// Get node by id attribute. Reflects creation and `set_attr` updates;
    /// detached subtrees are not evicted.
    pub fn get_by_id(&self, id: &str) -> Option<NodeId> {
        self.id_map.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Iterate over children of a node.
    pub fn children(&self, parent: NodeId) -> ChildrenIter<'_> {
        let first = self.get(parent).map(|n| n.first_child).unwrap_or(NodeId::NONE);
        ChildrenIter {
            dom: self,
            current: first,
        }
    }

    /// Child node ids collected up front, for mutation during iteration.
    pub fn child_ids(&self, parent: NodeId) -> Vec<NodeId> {
        self.children(parent).collect()
    }

    /// Depth-first walk of the subtree rooted at `root`, root included.
    pub fn descendants(&self, root: NodeId) -> DescendantsIter<'_> {
        DescendantsIter {
            dom: self,
            stack: vec![root],
        }
    }

    /// Find the first node matching a predicate (DFS).
    pub fn find<F>(&self, predicate: F) -> Option<NodeId>
    where
        F: Fn(&Node) -> bool,
    {
        self.descendants(self.document)
            .find(|id| self.get(*id).is_some_and(|n| predicate(n)))
    }

    /// Find first element by local tag name.
    pub fn find_by_tag(&self, tag: &str) -> Option<NodeId> {
        self.descendants(self.document)
            .find(|id| self.local_name(*id) == Some(tag))
    }

    /// All elements with the given local tag name, in document order.
    pub fn find_all_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.descendants(self.document)
            .filter(|id| self.local_name(*id) == Some(tag))
            .collect()
    }
}

impl Default for Dom {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over children of a node.
pub struct ChildrenIter<'a> {
    dom: &'a Dom,
    current: NodeId,
}

impl<'a> Iterator for ChildrenIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_none() {
            return None;
        }
        let id = self.current;
        self.current = self.dom.get(id).map(|n| n.next_sibling).unwrap_or(NodeId::NONE);
        Some(id)
    }
}

/// Depth-first iterator over a subtree.
pub struct DescendantsIter<'a> {
    dom: &'a Dom,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for DescendantsIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let mut children = self.dom.child_ids(id);
        children.reverse();
        self.stack.extend(children);
        Some(id)
    }
}

/// Element accessors and attribute mutation.
impl Dom {
    /// Qualified element name as written (`m:math`).
    pub fn element_name(&self, id: NodeId) -> Option<&str> {
        self.get(id).and_then(|n| match &n.data {
            NodeData::Element { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Local part of the element name (`math` for `m:math`).
    pub fn local_name(&self, id: NodeId) -> Option<&str> {
        self.element_name(id)
            .map(|name| name.rsplit_once(':').map(|(_, local)| local).unwrap_or(name))
    }

    pub fn get_attr(&self, id: NodeId, attr_name: &str) -> Option<&str> {
        self.get(id).and_then(|n| match &n.data {
            NodeData::Element { attrs, .. } => attrs
                .iter()
                .find(|a| a.name == attr_name)
                .map(|a| a.value.as_str()),
            _ => None,
        })
    }

    /// Set an attribute, replacing in place or appending at the end of the
    /// attribute list. Keeps the pre-extracted id/class caches in sync.
    pub fn set_attr(&mut self, id: NodeId, attr_name: &str, value: &str) {
        let mut new_id = None;
        if let Some(node) = self.get_mut(id) {
            if let NodeData::Element {
                attrs,
                id: elem_id,
                classes,
                ..
            } = &mut node.data
            {
                match attrs.iter_mut().find(|a| a.name == attr_name) {
                    Some(attr) => attr.value = value.to_string(),
                    None => attrs.push(Attr {
                        name: attr_name.to_string(),
                        value: value.to_string(),
                    }),
                }
                if attr_name == "id" {
                    *elem_id = Some(value.to_string());
                    new_id = elem_id.clone();
                } else if attr_name == "class" {
                    *classes = value.split_whitespace().map(str::to_string).collect();
                }
            }
        }
        if let Some(new_id) = new_id {
            self.id_map.insert(new_id, id);
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, attr_name: &str) {
        if let Some(node) = self.get_mut(id) {
            if let NodeData::Element {
                attrs,
                id: elem_id,
                classes,
                ..
            } = &mut node.data
            {
                attrs.retain(|a| a.name != attr_name);
                if attr_name == "id" {
                    *elem_id = None;
                } else if attr_name == "class" {
                    classes.clear();
                }
            }
        }
    }

    /// Add a class, preserving existing ones. No-op if already present.
    pub fn add_class(&mut self, id: NodeId, class: &str) {
        let current = self.get_attr(id, "class").unwrap_or("").to_string();
        if current.split_whitespace().any(|c| c == class) {
            return;
        }
        let merged = if current.is_empty() {
            class.to_string()
        } else {
            format!("{current} {class}")
        };
        self.set_attr(id, "class", &merged);
    }

    pub fn element_id(&self, id: NodeId) -> Option<&str> {
        self.get(id).and_then(|n| match &n.data {
            NodeData::Element { id, .. } => id.as_deref(),
            _ => None,
        })
    }

    pub fn element_classes(&self, id: NodeId) -> &[String] {
        static EMPTY: &[String] = &[];
        self.get(id)
            .and_then(|n| match &n.data {
                NodeData::Element { classes, .. } => Some(classes.as_slice()),
                _ => None,
            })
            .unwrap_or(EMPTY)
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.get(id)
            .is_some_and(|n| matches!(n.data, NodeData::Element { .. }))
    }

    pub fn is_text(&self, id: NodeId) -> bool {
        self.get(id)
            .is_some_and(|n| matches!(n.data, NodeData::Text(_)))
    }

    /// Text content of a text node.
    pub fn text_content(&self, id: NodeId) -> Option<&str> {
        self.get(id).and_then(|n| match &n.data {
            NodeData::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        if let Some(node) = self.get_mut(id) {
            if let NodeData::Text(s) = &mut node.data {
                *s = text.into();
            }
        }
    }

    /// Concatenated descendant text of a subtree.
    pub fn text_of(&self, root: NodeId) -> String {
        let mut out = String::new();
        for id in self.descendants(root) {
            if let Some(text) = self.text_content(id) {
                out.push_str(text);
            }
        }
        out
    }

    pub fn parent(&self, id: NodeId) -> NodeId {
        self.get(id).map(|n| n.parent).unwrap_or(NodeId::NONE)
    }

    /// Root element of the document (the `html`/`svg`/`package` node).
    pub fn root_element(&self) -> Option<NodeId> {
        self.children(self.document).find(|id| self.is_element(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str, value: &str) -> Attr {
        Attr {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn create_and_look_up_elements() {
        let mut dom = Dom::new();

        let div = dom.create_element("div", vec![attr("id", "main")]);
        dom.append(dom.document(), div);

        assert_eq!(dom.element_name(div), Some("div"));
        assert_eq!(dom.element_id(div), Some("main"));
        assert_eq!(dom.get_by_id("main"), Some(div));
    }

    #[test]
    fn append_preserves_order() {
        let mut dom = Dom::new();

        let parent = dom.create_element("div", vec![]);
        let child1 = dom.create_element("p", vec![]);
        let child2 = dom.create_element("p", vec![]);

        dom.append(dom.document(), parent);
        dom.append(parent, child1);
        dom.append(parent, child2);

        assert_eq!(dom.child_ids(parent), vec![child1, child2]);
    }

    #[test]
    fn detach_relinks_siblings() {
        let mut dom = Dom::new();

        let parent = dom.create_element("div", vec![]);
        let a = dom.create_element("p", vec![]);
        let b = dom.create_element("p", vec![]);
        let c = dom.create_element("p", vec![]);
        dom.append(dom.document(), parent);
        dom.append(parent, a);
        dom.append(parent, b);
        dom.append(parent, c);

        dom.detach(b);
        assert_eq!(dom.child_ids(parent), vec![a, c]);

        dom.insert_before(a, c);
        assert_eq!(dom.child_ids(parent), vec![c, a]);
    }

    #[test]
    fn insert_after_handles_last_child() {
        let mut dom = Dom::new();

        let parent = dom.create_element("div", vec![]);
        let a = dom.create_element("p", vec![]);
        dom.append(dom.document(), parent);
        dom.append(parent, a);

        let b = dom.create_element("span", vec![]);
        dom.insert_after(a, b);
        assert_eq!(dom.child_ids(parent), vec![a, b]);

        let mid = dom.create_element("em", vec![]);
        dom.insert_after(a, mid);
        assert_eq!(dom.child_ids(parent), vec![a, mid, b]);
    }

    #[test]
    fn set_attr_updates_class_cache() {
        let mut dom = Dom::new();

        let p = dom.create_element("p", vec![attr("class", "intro")]);
        dom.append(dom.document(), p);

        dom.add_class(p, "highlight");
        assert_eq!(dom.get_attr(p, "class"), Some("intro highlight"));
        assert_eq!(dom.element_classes(p), ["intro", "highlight"]);

        dom.add_class(p, "intro");
        assert_eq!(dom.get_attr(p, "class"), Some("intro highlight"));
    }

    #[test]
    fn local_name_strips_prefix() {
        let mut dom = Dom::new();
        let math = dom.create_element("m:math", vec![]);
        dom.append(dom.document(), math);

        assert_eq!(dom.element_name(math), Some("m:math"));
        assert_eq!(dom.local_name(math), Some("math"));
        assert_eq!(dom.find_by_tag("math"), Some(math));
    }

    #[test]
    fn text_of_concatenates_descendants() {
        let mut dom = Dom::new();
        let p = dom.create_element("p", vec![]);
        let em = dom.create_element("em", vec![]);
        dom.append(dom.document(), p);
        let t1 = dom.create_text("Hello ");
        dom.append(p, t1);
        dom.append(p, em);
        let t2 = dom.create_text("world");
        dom.append(em, t2);

        assert_eq!(dom.text_of(p), "Hello world");
    }
}
