//! selectors crate Element implementation for the arena DOM.
//!
//! This is what lets the stylesheet simplifier run real CSS selector
//! matching (including `:first-child` and friends) against source documents.
//! The `epub` and `xml` attribute-selector prefixes are registered here so
//! `[epub|type~="…"]` compiles without a stylesheet-level namespace rule.

use std::fmt;

use cssparser::{CowRcStr, SourceLocation};
use selectors::attr::{AttrSelectorOperation, CaseSensitivity, NamespaceConstraint};
use selectors::context::{MatchingContext, SelectorCaches};
use selectors::matching::ElementSelectorFlags;
use selectors::parser::SelectorParseErrorKind;
use selectors::{OpaqueElement, SelectorImpl};

use super::arena::{Dom, NodeData, NodeId};

pub const OPS_NAMESPACE: &str = "http://www.idpf.org/2007/ops";
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
pub const XHTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// Our selector implementation for the selectors crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinderySelectors;

/// A compiled selector.
pub type Selector = selectors::parser::Selector<BinderySelectors>;

/// Identifier string type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct IdentStr(pub String);

impl precomputed_hash::PrecomputedHash for IdentStr {
    fn precomputed_hash(&self) -> u32 {
        hash_str(&self.0)
    }
}

fn hash_str(s: &str) -> u32 {
    let mut h: u32 = 0;
    for byte in s.bytes() {
        h = h.wrapping_mul(31).wrapping_add(byte as u32);
    }
    h
}

impl AsRef<str> for IdentStr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdentStr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'a> From<&'a str> for IdentStr {
    fn from(s: &'a str) -> Self {
        Self(s.to_string())
    }
}

impl cssparser::ToCss for IdentStr {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        dest.write_str(&self.0)
    }
}

/// Local name wrapper that implements ToCss.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CssLocalName(pub String);

impl precomputed_hash::PrecomputedHash for CssLocalName {
    fn precomputed_hash(&self) -> u32 {
        hash_str(&self.0)
    }
}

impl cssparser::ToCss for CssLocalName {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        dest.write_str(&self.0)
    }
}

impl From<String> for CssLocalName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'a> From<&'a str> for CssLocalName {
    fn from(s: &'a str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CssLocalName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Namespace URL wrapper that implements ToCss.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CssNamespace(pub String);

impl precomputed_hash::PrecomputedHash for CssNamespace {
    fn precomputed_hash(&self) -> u32 {
        hash_str(&self.0)
    }
}

impl cssparser::ToCss for CssNamespace {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        dest.write_str(&self.0)
    }
}

impl From<String> for CssNamespace {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'a> From<&'a str> for CssNamespace {
    fn from(s: &'a str) -> Self {
        Self(s.to_string())
    }
}

impl<'i> selectors::parser::Parser<'i> for BinderySelectors {
    type Impl = BinderySelectors;
    type Error = SelectorParseErrorKind<'i>;

    fn parse_non_ts_pseudo_class(
        &self,
        location: SourceLocation,
        name: CowRcStr<'i>,
    ) -> Result<NonTSPseudoClass, cssparser::ParseError<'i, Self::Error>> {
        match name.as_ref() {
            "link" => Ok(NonTSPseudoClass::Link),
            "visited" => Ok(NonTSPseudoClass::Visited),
            "hover" => Ok(NonTSPseudoClass::Hover),
            "active" => Ok(NonTSPseudoClass::Active),
            "focus" => Ok(NonTSPseudoClass::Focus),
            _ => Err(location.new_custom_error(
                SelectorParseErrorKind::UnsupportedPseudoClassOrElement(name),
            )),
        }
    }

    fn namespace_for_prefix(&self, prefix: &IdentStr) -> Option<CssNamespace> {
        match prefix.0.as_str() {
            "epub" => Some(CssNamespace(OPS_NAMESPACE.to_string())),
            "xml" => Some(CssNamespace(XML_NAMESPACE.to_string())),
            _ => None,
        }
    }
}

/// Pseudo-element type. Empty: pseudo-element selectors never compile, which
/// callers detect and handle textually.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PseudoElement {}

impl cssparser::ToCss for PseudoElement {
    fn to_css<W: fmt::Write>(&self, _dest: &mut W) -> fmt::Result {
        match *self {}
    }
}

impl selectors::parser::PseudoElement for PseudoElement {
    type Impl = BinderySelectors;

    fn accepts_state_pseudo_classes(&self) -> bool {
        false
    }

    fn valid_after_slotted(&self) -> bool {
        false
    }
}

/// Non-tree-structural pseudo-classes. None of these match in a static
/// document, but they must compile so mixed selectors can be inspected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NonTSPseudoClass {
    Link,
    Visited,
    Hover,
    Active,
    Focus,
}

impl selectors::parser::NonTSPseudoClass for NonTSPseudoClass {
    type Impl = BinderySelectors;

    fn is_active_or_hover(&self) -> bool {
        matches!(self, Self::Hover | Self::Active)
    }

    fn is_user_action_state(&self) -> bool {
        matches!(self, Self::Hover | Self::Active | Self::Focus)
    }
}

impl cssparser::ToCss for NonTSPseudoClass {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        match self {
            Self::Link => dest.write_str(":link"),
            Self::Visited => dest.write_str(":visited"),
            Self::Hover => dest.write_str(":hover"),
            Self::Active => dest.write_str(":active"),
            Self::Focus => dest.write_str(":focus"),
        }
    }
}

impl SelectorImpl for BinderySelectors {
    type ExtraMatchingData<'a> = ();
    type AttrValue = IdentStr;
    type Identifier = IdentStr;
    type LocalName = CssLocalName;
    type NamespaceUrl = CssNamespace;
    type NamespacePrefix = IdentStr;
    type BorrowedLocalName = CssLocalName;
    type BorrowedNamespaceUrl = CssNamespace;
    type NonTSPseudoClass = NonTSPseudoClass;
    type PseudoElement = PseudoElement;
}

/// Reference to an element in the arena for selector matching.
#[derive(Clone, Copy)]
pub struct ElementRef<'a> {
    pub dom: &'a Dom,
    pub id: NodeId,
}

impl<'a> ElementRef<'a> {
    pub fn new(dom: &'a Dom, id: NodeId) -> Self {
        Self { dom, id }
    }
}

impl fmt::Debug for ElementRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementRef")
            .field("id", &self.id)
            .field("name", &self.dom.element_name(self.id))
            .finish()
    }
}

impl<'a> selectors::Element for ElementRef<'a> {
    type Impl = BinderySelectors;

    fn opaque(&self) -> OpaqueElement {
        OpaqueElement::new(self)
    }

    fn parent_element(&self) -> Option<Self> {
        let node = self.dom.get(self.id)?;
        if node.parent.is_none() {
            return None;
        }
        if self.dom.is_element(node.parent) {
            Some(Self::new(self.dom, node.parent))
        } else {
            None
        }
    }

    fn parent_node_is_shadow_root(&self) -> bool {
        false
    }

    fn containing_shadow_host(&self) -> Option<Self> {
        None
    }

    fn is_pseudo_element(&self) -> bool {
        false
    }

    fn prev_sibling_element(&self) -> Option<Self> {
        let node = self.dom.get(self.id)?;
        let mut current = node.prev_sibling;
        while current.is_some() {
            if self.dom.is_element(current) {
                return Some(Self::new(self.dom, current));
            }
            current = self.dom.get(current)?.prev_sibling;
        }
        None
    }

    fn next_sibling_element(&self) -> Option<Self> {
        let node = self.dom.get(self.id)?;
        let mut current = node.next_sibling;
        while current.is_some() {
            if self.dom.is_element(current) {
                return Some(Self::new(self.dom, current));
            }
            current = self.dom.get(current)?.next_sibling;
        }
        None
    }

    fn first_element_child(&self) -> Option<Self> {
        self.dom
            .children(self.id)
            .find(|child| self.dom.is_element(*child))
            .map(|child| Self::new(self.dom, child))
    }

    fn is_html_element_in_html_document(&self) -> bool {
        // XML documents: matching stays case-sensitive.
        false
    }

    fn has_local_name(&self, name: &CssLocalName) -> bool {
        self.dom.local_name(self.id) == Some(name.0.as_str())
    }

    fn has_namespace(&self, ns: &CssNamespace) -> bool {
        // Elements are XHTML unless prefixed.
        let prefixed = self
            .dom
            .element_name(self.id)
            .is_some_and(|n| n.contains(':'));
        !prefixed && ns.0 == XHTML_NAMESPACE
    }

    fn is_same_type(&self, other: &Self) -> bool {
        let self_name = self.dom.element_name(self.id);
        let other_name = other.dom.element_name(other.id);
        self_name == other_name
    }

    fn attr_matches(
        &self,
        ns: &NamespaceConstraint<&CssNamespace>,
        local_name: &CssLocalName,
        operation: &AttrSelectorOperation<&IdentStr>,
    ) -> bool {
        let node = match self.dom.get(self.id) {
            Some(n) => n,
            None => return false,
        };
        let attrs = match &node.data {
            NodeData::Element { attrs, .. } => attrs,
            _ => return false,
        };

        // Attributes are stored with their source prefix; constraint
        // namespaces map back onto the known prefixes.
        let wanted: Option<String> = match ns {
            NamespaceConstraint::Any => None,
            NamespaceConstraint::Specific(url) => match url.0.as_str() {
                "" => Some(local_name.0.clone()),
                OPS_NAMESPACE => Some(format!("epub:{}", local_name.0)),
                XML_NAMESPACE => Some(format!("xml:{}", local_name.0)),
                _ => return false,
            },
        };

        for attr in attrs {
            let matched = match &wanted {
                Some(name) => attr.name == *name,
                None => {
                    let local = attr
                        .name
                        .rsplit_once(':')
                        .map(|(_, l)| l)
                        .unwrap_or(&attr.name);
                    local == local_name.0
                }
            };
            if matched {
                return operation.eval_str(&attr.value);
            }
        }
        false
    }

    fn match_non_ts_pseudo_class(
        &self,
        pc: &NonTSPseudoClass,
        _context: &mut MatchingContext<'_, Self::Impl>,
    ) -> bool {
        match pc {
            NonTSPseudoClass::Link => self.is_link(),
            // User-action states never apply in a static document.
            _ => false,
        }
    }

    fn match_pseudo_element(
        &self,
        _pe: &PseudoElement,
        _context: &mut MatchingContext<'_, Self::Impl>,
    ) -> bool {
        false
    }

    fn is_link(&self) -> bool {
        self.dom.local_name(self.id) == Some("a") && self.dom.get_attr(self.id, "href").is_some()
    }

    fn is_html_slot_element(&self) -> bool {
        false
    }

    fn has_id(&self, id: &IdentStr, case_sensitivity: CaseSensitivity) -> bool {
        match self.dom.element_id(self.id) {
            Some(elem_id) => case_sensitivity.eq(elem_id.as_bytes(), id.0.as_bytes()),
            None => false,
        }
    }

    fn has_class(&self, name: &IdentStr, case_sensitivity: CaseSensitivity) -> bool {
        self.dom
            .element_classes(self.id)
            .iter()
            .any(|c| case_sensitivity.eq(c.as_bytes(), name.0.as_bytes()))
    }

    fn imported_part(&self, _name: &IdentStr) -> Option<IdentStr> {
        None
    }

    fn is_part(&self, _name: &IdentStr) -> bool {
        false
    }

    fn is_empty(&self) -> bool {
        for child in self.dom.children(self.id) {
            let node = match self.dom.get(child) {
                Some(n) => n,
                None => continue,
            };
            match &node.data {
                NodeData::Element { .. } => return false,
                NodeData::Text(t) if !t.trim().is_empty() => return false,
                _ => {}
            }
        }
        true
    }

    fn is_root(&self) -> bool {
        let parent = self.dom.get(self.id).map(|n| n.parent);
        if let Some(parent) = parent {
            if let Some(parent_node) = self.dom.get(parent) {
                return matches!(parent_node.data, NodeData::Document);
            }
        }
        false
    }

    fn apply_selector_flags(&self, _flags: ElementSelectorFlags) {}

    fn add_element_unique_hashes(&self, _filter: &mut selectors::bloom::BloomFilter) -> bool {
        false
    }

    fn has_custom_state(&self, _name: &IdentStr) -> bool {
        false
    }
}

/// Compile a single selector.
pub fn compile(selector: &str) -> Result<Selector, String> {
    let mut parser_input = cssparser::ParserInput::new(selector);
    let mut parser = cssparser::Parser::new(&mut parser_input);
    selectors::parser::Selector::parse(&BinderySelectors, &mut parser)
        .map_err(|e| format!("unparseable selector `{selector}`: {e:?}"))
}

/// Does `node` match `selector`?
pub fn matches(dom: &Dom, node: NodeId, selector: &Selector) -> bool {
    if !dom.is_element(node) {
        return false;
    }
    let mut caches = SelectorCaches::default();
    let mut context = MatchingContext::new(
        selectors::matching::MatchingMode::Normal,
        None,
        &mut caches,
        selectors::context::QuirksMode::NoQuirks,
        selectors::matching::NeedsSelectorFlags::No,
        selectors::matching::MatchingForInvalidation::No,
    );
    let elem = ElementRef::new(dom, node);
    selectors::matching::matches_selector(selector, 0, None, &elem, &mut context)
}

/// All elements matching `selector`, in document order.
pub fn select(dom: &Dom, selector: &Selector) -> Vec<NodeId> {
    dom.descendants(dom.document())
        .filter(|id| matches(dom, *id, selector))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::super::parse::parse;
    use super::*;

    fn parse_doc(source: &str) -> Dom {
        parse(source, &PathBuf::from("t.xhtml")).unwrap()
    }

    #[test]
    fn tag_class_and_id_selectors() {
        let dom = parse_doc(r#"<html><body><p class="intro" id="main">Hello</p></body></html>"#);
        let p = dom.find_by_tag("p").unwrap();

        assert!(matches(&dom, p, &compile("p").unwrap()));
        assert!(matches(&dom, p, &compile(".intro").unwrap()));
        assert!(matches(&dom, p, &compile("p#main").unwrap()));
        assert!(!matches(&dom, p, &compile("div").unwrap()));
        assert!(!matches(&dom, p, &compile(".missing").unwrap()));
    }

    #[test]
    fn descendant_and_child_combinators() {
        let dom = parse_doc("<html><body><blockquote><p>Q</p></blockquote></body></html>");
        let p = dom.find_by_tag("p").unwrap();

        assert!(matches(&dom, p, &compile("body p").unwrap()));
        assert!(matches(&dom, p, &compile("blockquote > p").unwrap()));
        assert!(!matches(&dom, p, &compile("body > p").unwrap()));
    }

    #[test]
    fn structural_pseudo_classes() {
        let dom = parse_doc(
            "<html><body><section><p>one</p><p>two</p><p>three</p></section></body></html>",
        );
        let ps = dom.find_all_by_tag("p");
        let first = compile("p:first-child").unwrap();
        let last = compile("p:last-child").unwrap();
        let only = compile("p:only-child").unwrap();

        assert!(matches(&dom, ps[0], &first));
        assert!(!matches(&dom, ps[1], &first));
        assert!(matches(&dom, ps[2], &last));
        assert!(!matches(&dom, ps[0], &last));
        assert!(ps.iter().all(|p| !matches(&dom, *p, &only)));
    }

    #[test]
    fn first_child_skips_text_nodes() {
        let dom = parse_doc("<html><body><section>\n\t<p>one</p>\n</section></body></html>");
        let p = dom.find_by_tag("p").unwrap();
        assert!(matches(&dom, p, &compile("p:first-child").unwrap()));
    }

    #[test]
    fn epub_namespace_attribute_selector() {
        let dom = parse_doc(
            r#"<html><body><section epub:type="chapter"><p epub:type="z3998:letter">x</p></section></body></html>"#,
        );
        let section = dom.find_by_tag("section").unwrap();
        let p = dom.find_by_tag("p").unwrap();

        let sel = compile(r#"[epub|type~="chapter"]"#).unwrap();
        assert!(matches(&dom, section, &sel));
        assert!(!matches(&dom, p, &sel));

        let sel = compile(r#"p[epub|type~="z3998:letter"]"#).unwrap();
        assert!(matches(&dom, p, &sel));
    }

    #[test]
    fn plain_attribute_selector_ignores_prefixed_attrs() {
        let dom = parse_doc(r#"<html><body><p epub:type="dedication">x</p></body></html>"#);
        let p = dom.find_by_tag("p").unwrap();
        // No-namespace [type] must not match epub:type.
        assert!(!matches(&dom, p, &compile("[type]").unwrap()));
    }

    #[test]
    fn pseudo_element_selectors_do_not_compile() {
        assert!(compile("p::before").is_err());
        assert!(compile("p::first-letter").is_err());
    }

    #[test]
    fn select_returns_document_order() {
        let dom = parse_doc("<html><body><p>a</p><div><p>b</p></div><p>c</p></body></html>");
        let sel = compile("p").unwrap();
        let found = select(&dom, &sel);
        let texts: Vec<String> = found.iter().map(|id| dom.text_of(*id)).collect();
        assert_eq!(texts, ["a", "b", "c"]);
    }
}
