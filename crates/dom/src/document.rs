use std::collections::BTreeMap;
use std::fmt;

use consentgate_core::BannerProbe;

use crate::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// An attribute change seen by an attribute observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub observer: ObserverId,
    pub target: NodeId,
    pub attribute: String,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Document,
    Element { tag: String, attrs: Vec<(String, String)> },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
struct Observer {
    target: NodeId,
    attributes: Vec<String>,
}

/// Arena-backed DOM. Nodes are never freed: removing a node only detaches
/// it, so a `NodeId` stays valid for the document's life.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
    observers: BTreeMap<ObserverId, Observer>,
    next_observer: u64,
    mutations: Vec<MutationRecord>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData { kind: NodeKind::Document, parent: None, children: Vec::new() }],
            observers: BTreeMap::new(),
            next_observer: 0,
            mutations: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The `<body>` element, or the document root when there is none.
    pub fn body(&self) -> NodeId {
        self.descendants(self.root())
            .find(|&node| self.tag(node) == Some("body"))
            .unwrap_or(self.root())
    }

    fn data(&self, node: NodeId) -> &NodeData {
        &self.nodes[node.0]
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element { tag: tag.to_ascii_lowercase(), attrs: Vec::new() })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData { kind, parent: None, children: Vec::new() });
        id
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Detaches `node` (and its subtree) from the tree.
    pub fn remove(&mut self, node: NodeId) {
        self.detach(node);
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|&c| c != node);
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.data(node).parent
    }

    pub fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.parent(node).filter(|&p| self.is_element(p))
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.data(node).children
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        matches!(self.data(node).kind, NodeKind::Element { .. })
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match &self.data(node).kind {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        let mut current = node;
        loop {
            if current == self.root() {
                return true;
            }
            match self.parent(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Inclusive: a node contains itself.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent(n);
        }
        false
    }

    pub fn descendants(&self, node: NodeId) -> Descendants<'_> {
        let mut stack: Vec<NodeId> = self.children(node).to_vec();
        stack.reverse();
        Descendants { doc: self, stack }
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.data(node).kind {
            NodeKind::Element { attrs, .. } => {
                attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
            }
            _ => None,
        }
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) {
        self.write_attr(node, name, value);
        self.record(node, name);
    }

    pub(crate) fn write_attr(&mut self, node: NodeId, name: &str, value: &str) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[node.0].kind {
            match attrs.iter_mut().find(|(n, _)| n == name) {
                Some((_, existing)) => *existing = value.to_string(),
                None => attrs.push((name.to_string(), value.to_string())),
            }
        }
    }

    pub fn remove_attr(&mut self, node: NodeId, name: &str) -> Option<String> {
        let NodeKind::Element { attrs, .. } = &mut self.nodes[node.0].kind else {
            return None;
        };
        let index = attrs.iter().position(|(n, _)| n == name)?;
        let (_, value) = attrs.remove(index);
        self.record(node, name);
        Some(value)
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attr(node, "class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if self.has_class(node, class) {
            return;
        }
        let classes = match self.attr(node, "class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), class),
            _ => class.to_string(),
        };
        self.set_attr(node, "class", &classes);
    }

    pub fn remove_class(&mut self, node: NodeId, class: &str) {
        if !self.has_class(node, class) {
            return;
        }
        let classes = self
            .attr(node, "class")
            .unwrap_or_default()
            .split_whitespace()
            .filter(|c| *c != class)
            .collect::<Vec<_>>()
            .join(" ");
        self.set_attr(node, "class", &classes);
    }

    /// Inline style property, as in `element.style.display`.
    pub fn style(&self, node: NodeId, property: &str) -> Option<String> {
        parse_style(self.attr(node, "style")?)
            .into_iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
    }

    pub fn set_style(&mut self, node: NodeId, property: &str, value: &str) {
        let mut declarations = self.attr(node, "style").map(parse_style).unwrap_or_default();
        match declarations.iter_mut().find(|(name, _)| name == property) {
            Some((_, existing)) => *existing = value.to_string(),
            None => declarations.push((property.to_string(), value.to_string())),
        }
        let style = declarations
            .iter()
            .map(|(name, value)| format!("{}: {};", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        self.set_attr(node, "style", &style);
    }

    /// Rendered as far as inline state can tell: connected, and neither the
    /// node nor an ancestor has `display: none` or the `hidden` class or
    /// attribute. Mirrors the `offsetParent !== null` check.
    pub fn is_rendered(&self, node: NodeId) -> bool {
        if !self.is_connected(node) {
            return false;
        }
        let mut current = Some(node);
        while let Some(n) = current {
            if self.is_element(n)
                && (self.style(n, "display").as_deref() == Some("none")
                    || self.has_class(n, "hidden")
                    || self.attr(n, "hidden").is_some())
            {
                return false;
            }
            current = self.parent(n);
        }
        true
    }

    pub fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        selector.matches(self, node)
    }

    pub fn query_selector(&self, root: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(root).find(|&node| selector.matches(self, node))
    }

    pub fn query_selector_all(&self, root: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(root).filter(|&node| selector.matches(self, node)).collect()
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(n) = current {
            if selector.matches(self, n) {
                return Some(n);
            }
            current = self.parent(n);
        }
        None
    }

    pub fn text_content(&self, node: NodeId) -> String {
        let mut text = String::new();
        if let NodeKind::Text(t) = &self.data(node).kind {
            text.push_str(t);
        }
        for n in self.descendants(node) {
            if let NodeKind::Text(t) = &self.data(n).kind {
                text.push_str(t);
            }
        }
        text
    }

    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.serialize(node, &mut out);
        out
    }

    fn serialize(&self, node: NodeId, out: &mut String) {
        match &self.data(node).kind {
            NodeKind::Document => {
                for &child in self.children(node) {
                    self.serialize(child, out);
                }
            }
            NodeKind::Text(text) => out.push_str(&escape(text, false)),
            NodeKind::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push_str(&format!(" {}=\"{}\"", name, escape(value, true)));
                }
                out.push('>');
                if is_void(tag) {
                    return;
                }
                for &child in self.children(node) {
                    self.serialize(child, out);
                }
                out.push_str(&format!("</{}>", tag));
            }
        }
    }

    /// Starts reporting changes of `attributes` on `target`, like a
    /// `MutationObserver` with an `attributeFilter`.
    pub fn observe(&mut self, target: NodeId, attributes: &[String]) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.insert(id, Observer { target, attributes: attributes.to_vec() });
        id
    }

    pub fn disconnect(&mut self, observer: ObserverId) -> bool {
        self.mutations.retain(|record| record.observer != observer);
        self.observers.remove(&observer).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn take_mutations(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.mutations)
    }

    fn record(&mut self, target: NodeId, attribute: &str) {
        for (&observer, watch) in &self.observers {
            if watch.target == target && watch.attributes.iter().any(|a| a == attribute) {
                self.mutations.push(MutationRecord {
                    observer,
                    target,
                    attribute: attribute.to_string(),
                });
            }
        }
    }
}

impl BannerProbe for Document {
    fn banner_hidden(&self, selector: &str) -> bool {
        let Ok(selector) = Selector::parse(selector) else {
            tracing::debug!(selector, "Unparseable banner selector, heuristic skipped");
            return false;
        };
        self.query_selector(self.root(), &selector)
            .is_some_and(|banner| self.style(banner, "display").as_deref() == Some("none"))
    }
}

pub struct Descendants<'a> {
    doc: &'a Document,
    stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.stack.pop()?;
        self.stack.extend(self.doc.children(node).iter().rev());
        Some(node)
    }
}

fn parse_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|declaration| {
            let (name, value) = declaration.split_once(':')?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            (!name.is_empty()).then_some((name, value))
        })
        .collect()
}

fn is_void(tag: &str) -> bool {
    matches!(tag, "br" | "hr" | "img" | "input" | "link" | "meta" | "source" | "wbr")
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn banner_page() -> (Document, NodeId) {
        let doc = Document::parse(
            r#"<body><div class="cookie-banner" style="position: fixed"><a class="consent-link">OK</a></div></body>"#,
        );
        let banner = doc
            .query_selector(doc.root(), &Selector::parse(".cookie-banner").unwrap())
            .unwrap();
        (doc, banner)
    }

    #[test]
    fn style_edits_keep_other_declarations() {
        let (mut doc, banner) = banner_page();
        doc.set_style(banner, "display", "none");
        assert_eq!(doc.style(banner, "position").as_deref(), Some("fixed"));
        assert_eq!(doc.style(banner, "display").as_deref(), Some("none"));
        doc.set_style(banner, "display", "block");
        assert_eq!(doc.attr(banner, "style"), Some("position: fixed; display: block;"));
    }

    #[test]
    fn observers_see_only_watched_attributes() {
        let (mut doc, banner) = banner_page();
        let observer = doc.observe(banner, &["style".to_string(), "class".to_string()]);
        doc.set_attr(banner, "data-x", "1");
        doc.add_class(banner, "is-closing");
        doc.set_style(banner, "display", "none");
        let records = doc.take_mutations();
        let attributes: Vec<&str> = records.iter().map(|r| r.attribute.as_str()).collect();
        assert_eq!(attributes, vec!["class", "style"]);
        assert!(records.iter().all(|r| r.observer == observer && r.target == banner));

        assert!(doc.disconnect(observer));
        doc.set_style(banner, "display", "block");
        assert!(doc.take_mutations().is_empty());
        assert!(!doc.disconnect(observer));
    }

    #[test]
    fn rendering_follows_ancestors_and_detachment() {
        let (mut doc, banner) = banner_page();
        let link = doc.children(banner)[0];
        assert!(doc.is_rendered(link));
        doc.add_class(banner, "hidden");
        assert!(!doc.is_rendered(link));
        doc.remove_class(banner, "hidden");
        assert!(doc.is_rendered(link));
        doc.remove(banner);
        assert!(!doc.is_rendered(link));
        assert!(!doc.is_connected(link));
    }

    #[test]
    fn banner_probe_requires_inline_display_none() {
        let (mut doc, banner) = banner_page();
        assert!(!doc.banner_hidden(".cookie-banner"));
        doc.set_style(banner, "display", "none");
        assert!(doc.banner_hidden(".cookie-banner"));
        assert!(!doc.banner_hidden(".missing-banner"));
        assert!(!doc.banner_hidden("[["));
    }

    #[test]
    fn closest_is_inclusive() {
        let (doc, banner) = banner_page();
        let link = doc.children(banner)[0];
        let selector = Selector::parse(".cookie-banner").unwrap();
        assert_eq!(doc.closest(link, &selector), Some(banner));
        assert_eq!(doc.closest(banner, &selector), Some(banner));
        assert_eq!(doc.text_content(banner), "OK");
    }
}
