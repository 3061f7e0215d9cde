use scraper::{ElementRef, Html, Node};

use crate::{Document, NodeId};

impl Document {
    /// Builds a document from a full HTML page. Whitespace-only text nodes,
    /// comments and doctypes are dropped.
    pub fn parse(html: &str) -> Self {
        let parsed = Html::parse_document(html);
        let mut doc = Document::new();
        let root = doc.root();
        let html_element = doc.import_element(parsed.root_element());
        doc.append_child(root, html_element);
        doc
    }

    /// Parses `html` as a fragment and appends its top-level nodes to
    /// `parent`, like `insertAdjacentHTML('beforeend', ..)`.
    pub fn append_html(&mut self, parent: NodeId, html: &str) -> Vec<NodeId> {
        let parsed = Html::parse_fragment(html);
        self.import_children(parent, parsed.root_element())
    }

    fn import_element(&mut self, source: ElementRef<'_>) -> NodeId {
        let element = source.value();
        let id = self.create_element(element.name());
        for (name, value) in element.attrs() {
            self.write_attr(id, name, value);
        }
        self.import_children(id, source);
        id
    }

    fn import_children(&mut self, parent: NodeId, source: ElementRef<'_>) -> Vec<NodeId> {
        let mut created = Vec::new();
        for child in source.children() {
            let id = if let Some(element) = ElementRef::wrap(child) {
                self.import_element(element)
            } else if let Node::Text(text) = child.value() {
                let text: &str = text;
                if text.trim().is_empty() {
                    continue;
                }
                self.create_text(text)
            } else {
                continue;
            };
            self.append_child(parent, id);
            created.push(id);
        }
        created
    }
}
