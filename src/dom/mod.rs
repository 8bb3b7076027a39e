//! XML DOM for source documents: arena tree, strict parser, deterministic
//! serializer, and CSS selector matching.

mod arena;
mod parse;
mod select;
mod serialize;

pub use arena::{Attr, ChildrenIter, DescendantsIter, Dom, Node, NodeData, NodeId};
pub use parse::parse;
pub use select::{
    BinderySelectors, ElementRef, OPS_NAMESPACE, Selector, XHTML_NAMESPACE, XML_NAMESPACE,
    compile, matches, select,
};
pub use serialize::{escape_attr, escape_text, node_to_xml, to_xml};
