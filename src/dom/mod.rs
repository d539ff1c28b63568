//! In-process model of the host page: an element tree with a structural
//! mutation feed and click dispatch. Handles are cheap to clone; every
//! accessor re-reads the live tree, so a handle to a removed element is
//! still safe to use (it simply reports `is_connected() == false`).

pub mod selector;

pub use selector::Selector;

use selector::{Combinator, Complex, Compound};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const VOID_TAGS: &[&str] = &["br", "hr", "img", "input", "meta", "link", "wbr"];
const MUTATION_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// A structural change: children were added to or removed from `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    ChildList { target: NodeId },
}

pub type ClickHandler = Arc<dyn Fn(&Element) + Send + Sync>;

/// Returned by [`Element::on_click`]; pass it to [`Document::off_click`] to
/// unbind that one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        value: Option<String>,
    },
    Text(String),
}

struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

struct Tree {
    nodes: Vec<Node>,
    handlers: HashMap<NodeId, Vec<(HandlerId, ClickHandler)>>,
    next_handler: u64,
}

const ROOT: NodeId = NodeId(0);

impl Tree {
    fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Element {
                    tag: "body".to_string(),
                    attrs: Vec::new(),
                    value: None,
                },
                parent: None,
                children: Vec::new(),
            }],
            handlers: HashMap::new(),
            next_handler: 0,
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element { tag, .. } => Some(tag),
            NodeKind::Text(_) => None,
        }
    }

    fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    fn is_element(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Element { .. })
    }

    fn element_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id)
            .children
            .iter()
            .copied()
            .filter(|c| self.is_element(*c))
    }

    fn is_ancestor_or_self(&self, candidate: NodeId, of: NodeId) -> bool {
        let mut cur = Some(of);
        while let Some(n) = cur {
            if n == candidate {
                return true;
            }
            cur = self.node(n).parent;
        }
        false
    }

    fn detach(&mut self, id: NodeId) -> Option<NodeId> {
        let parent = self.node(id).parent?;
        self.node_mut(parent).children.retain(|c| *c != id);
        self.node_mut(id).parent = None;
        Some(parent)
    }

    fn descendants(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for &c in &self.node(id).children {
            if self.is_element(c) {
                out.push(c);
            }
            self.descendants(c, out);
        }
    }

    fn matches(&self, id: NodeId, sel: &Selector) -> bool {
        self.is_element(id) && sel.alternatives.iter().any(|c| self.matches_complex(id, c))
    }

    fn matches_complex(&self, id: NodeId, c: &Complex) -> bool {
        let last = c.compounds.len() - 1;
        self.matches_compound(id, &c.compounds[last]) && self.matches_leftwards(id, c, last)
    }

    /// `c.compounds[idx]` matched at `id`; try to satisfy everything to its left.
    fn matches_leftwards(&self, id: NodeId, c: &Complex, idx: usize) -> bool {
        if idx == 0 {
            return true;
        }
        let prev = &c.compounds[idx - 1];
        match c.combinators[idx - 1] {
            Combinator::Child => match self.node(id).parent {
                Some(p) => self.matches_compound(p, prev) && self.matches_leftwards(p, c, idx - 1),
                None => false,
            },
            Combinator::Descendant => {
                let mut cur = self.node(id).parent;
                while let Some(a) = cur {
                    if self.matches_compound(a, prev) && self.matches_leftwards(a, c, idx - 1) {
                        return true;
                    }
                    cur = self.node(a).parent;
                }
                false
            }
        }
    }

    fn matches_compound(&self, id: NodeId, c: &Compound) -> bool {
        let Some(tag) = self.tag(id) else {
            return false;
        };
        if let Some(want) = &c.tag
            && !tag.eq_ignore_ascii_case(want)
        {
            return false;
        }
        if let Some(want) = &c.id
            && self.attr(id, "id") != Some(want.as_str())
        {
            return false;
        }
        if !c.classes.is_empty() {
            let class = self.attr(id, "class").unwrap_or("");
            if !c
                .classes
                .iter()
                .all(|want| class.split_whitespace().any(|have| have == want))
            {
                return false;
            }
        }
        for test in &c.attrs {
            match self.attr(id, &test.name) {
                Some(v) if test.op.test(v) => {}
                _ => return false,
            }
        }
        if c.last_child {
            let Some(p) = self.node(id).parent else {
                return false;
            };
            if self.element_children(p).last() != Some(id) {
                return false;
            }
        }
        true
    }

    fn text_content(&self, id: NodeId, out: &mut String) {
        match &self.node(id).kind {
            NodeKind::Text(t) => out.push_str(t),
            NodeKind::Element { .. } => {
                for &c in &self.node(id).children {
                    self.text_content(c, out);
                }
            }
        }
    }

    fn write_html(&self, id: NodeId, out: &mut String) {
        match &self.node(id).kind {
            NodeKind::Text(t) => escape_into(t, false, out),
            NodeKind::Element { tag, attrs, .. } => {
                out.push('<');
                out.push_str(tag);
                for (k, v) in attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    escape_into(v, true, out);
                    out.push('"');
                }
                out.push('>');
                if VOID_TAGS.contains(&tag.as_str()) {
                    return;
                }
                for &c in &self.node(id).children {
                    self.write_html(c, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn escape_into(s: &str, attr: bool, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attr => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

/// The host page.
#[derive(Clone)]
pub struct Document {
    tree: Arc<Mutex<Tree>>,
    mutations: broadcast::Sender<Mutation>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.lock().nodes.len())
            .finish()
    }
}

impl Document {
    pub fn new() -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_BACKLOG);
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            mutations,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, target: NodeId) {
        // No subscribers is fine.
        let _ = self.mutations.send(Mutation::ChildList { target });
    }

    fn handle(&self, id: NodeId) -> Element {
        Element {
            doc: self.clone(),
            id,
        }
    }

    pub fn body(&self) -> Element {
        self.handle(ROOT)
    }

    /// A new, detached element.
    pub fn create_element(&self, tag: &str) -> Element {
        let id = self.lock().push(NodeKind::Element {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            value: None,
        });
        self.handle(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Mutation> {
        self.mutations.subscribe()
    }

    pub fn element(&self, id: NodeId) -> Option<Element> {
        let tree = self.lock();
        (id.0 < tree.nodes.len() && tree.is_element(id)).then(|| self.handle(id))
    }

    pub fn select_all(&self, sel: &Selector) -> Vec<Element> {
        self.body().select_all(sel)
    }

    pub fn select(&self, sel: &Selector) -> Option<Element> {
        self.body().select(sel)
    }

    /// Dispatch a click to `target`'s handlers, outside the tree lock so
    /// handlers are free to mutate the document.
    pub fn click(&self, target: &Element) {
        let handlers: Vec<ClickHandler> = self
            .lock()
            .handlers
            .get(&target.id)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for h in handlers {
            h(target);
        }
    }

    /// Unbind one handler. Returns `false` if it was already gone.
    pub fn off_click(&self, handler: HandlerId) -> bool {
        let mut tree = self.lock();
        let Some(node) = tree
            .handlers
            .iter()
            .find(|(_, hs)| hs.iter().any(|(id, _)| *id == handler))
            .map(|(node, _)| *node)
        else {
            return false;
        };
        if let Some(hs) = tree.handlers.get_mut(&node) {
            hs.retain(|(id, _)| *id != handler);
            if hs.is_empty() {
                tree.handlers.remove(&node);
            }
        }
        true
    }

    /// Number of click handlers bound anywhere in the document.
    pub fn handler_count(&self) -> usize {
        self.lock().handlers.values().map(Vec::len).sum()
    }
}

#[derive(Clone)]
pub struct Element {
    doc: Document,
    id: NodeId,
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.doc.tree, &other.doc.tree)
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} #{}>", self.tag(), self.id.0)
    }
}

impl Element {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn tag(&self) -> String {
        self.doc.lock().tag(self.id).unwrap_or_default().to_string()
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.doc.lock().attr(self.id, name).map(str::to_string)
    }

    pub fn set_attr(&self, name: &str, value: &str) {
        let mut tree = self.doc.lock();
        if let NodeKind::Element { attrs, .. } = &mut tree.node_mut(self.id).kind {
            match attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some((_, v)) => *v = value.to_string(),
                None => attrs.push((name.to_ascii_lowercase(), value.to_string())),
            }
        }
    }

    pub fn remove_attr(&self, name: &str) {
        let mut tree = self.doc.lock();
        if let NodeKind::Element { attrs, .. } = &mut tree.node_mut(self.id).kind {
            attrs.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|c| c.split_whitespace().any(|have| have == class))
    }

    /// Form-control value (the live property, not the markup attribute).
    pub fn value(&self) -> Option<String> {
        match &self.doc.lock().node(self.id).kind {
            NodeKind::Element { value, .. } => value.clone(),
            NodeKind::Text(_) => None,
        }
    }

    pub fn set_value(&self, new_value: &str) {
        if let NodeKind::Element { value, .. } = &mut self.doc.lock().node_mut(self.id).kind {
            *value = Some(new_value.to_string());
        }
    }

    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.doc.lock().text_content(self.id, &mut out);
        out
    }

    pub fn inner_html(&self) -> String {
        let tree = self.doc.lock();
        let mut out = String::new();
        for &c in &tree.node(self.id).children {
            tree.write_html(c, &mut out);
        }
        out
    }

    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        self.doc.lock().write_html(self.id, &mut out);
        out
    }

    pub fn parent(&self) -> Option<Element> {
        let parent = self.doc.lock().node(self.id).parent?;
        Some(self.doc.handle(parent))
    }

    pub fn children(&self) -> Vec<Element> {
        let ids: Vec<NodeId> = self.doc.lock().element_children(self.id).collect();
        ids.into_iter().map(|id| self.doc.handle(id)).collect()
    }

    pub fn last_element_child(&self) -> Option<Element> {
        let last = self.doc.lock().element_children(self.id).last()?;
        Some(self.doc.handle(last))
    }

    pub fn is_connected(&self) -> bool {
        self.doc.lock().is_ancestor_or_self(ROOT, self.id)
    }

    /// Append `child`, moving it out of its current parent first.
    pub fn append(&self, child: &Element) {
        let old_parent = {
            let mut tree = self.doc.lock();
            if tree.is_ancestor_or_self(child.id, self.id) {
                log::warn!("refusing to append {child:?} into its own subtree");
                return;
            }
            let old = tree.detach(child.id);
            tree.node_mut(child.id).parent = Some(self.id);
            tree.node_mut(self.id).children.push(child.id);
            old
        };
        if let Some(p) = old_parent {
            self.doc.notify(p);
        }
        self.doc.notify(self.id);
    }

    pub fn append_text(&self, text: &str) {
        {
            let mut tree = self.doc.lock();
            let t = tree.push(NodeKind::Text(text.to_string()));
            tree.node_mut(t).parent = Some(self.id);
            tree.node_mut(self.id).children.push(t);
        }
        self.doc.notify(self.id);
    }

    /// Insert `node` as the next sibling of `self`. No-op when detached.
    pub fn insert_after(&self, node: &Element) {
        let parent = {
            let mut tree = self.doc.lock();
            let Some(parent) = tree.node(self.id).parent else {
                return;
            };
            if tree.is_ancestor_or_self(node.id, parent) || node.id == self.id {
                return;
            }
            tree.detach(node.id);
            let pos = tree
                .node(parent)
                .children
                .iter()
                .position(|c| *c == self.id)
                .map_or(0, |p| p + 1);
            tree.node_mut(parent).children.insert(pos, node.id);
            tree.node_mut(node.id).parent = Some(parent);
            parent
        };
        self.doc.notify(parent);
    }

    pub fn remove(&self) {
        let parent = self.doc.lock().detach(self.id);
        if let Some(p) = parent {
            self.doc.notify(p);
        }
    }

    /// Drop every child, the way an editor rewriting its content would.
    pub fn clear(&self) {
        {
            let mut tree = self.doc.lock();
            let children = std::mem::take(&mut tree.node_mut(self.id).children);
            for c in children {
                tree.node_mut(c).parent = None;
            }
        }
        self.doc.notify(self.id);
    }

    pub fn matches(&self, sel: &Selector) -> bool {
        self.doc.lock().matches(self.id, sel)
    }

    /// First matching descendant in document order.
    pub fn select(&self, sel: &Selector) -> Option<Element> {
        let id = {
            let tree = self.doc.lock();
            let mut all = Vec::new();
            tree.descendants(self.id, &mut all);
            all.into_iter().find(|d| tree.matches(*d, sel))?
        };
        Some(self.doc.handle(id))
    }

    pub fn select_all(&self, sel: &Selector) -> Vec<Element> {
        let ids: Vec<NodeId> = {
            let tree = self.doc.lock();
            let mut all = Vec::new();
            tree.descendants(self.id, &mut all);
            all.into_iter().filter(|d| tree.matches(*d, sel)).collect()
        };
        ids.into_iter().map(|id| self.doc.handle(id)).collect()
    }

    /// Parse-and-select convenience; an invalid selector matches nothing.
    pub fn query(&self, selector: &str) -> Option<Element> {
        match Selector::parse(selector) {
            Ok(sel) => self.select(&sel),
            Err(e) => {
                log::warn!("{e}");
                None
            }
        }
    }

    pub fn on_click<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Element) + Send + Sync + 'static,
    {
        let handler: ClickHandler = Arc::new(handler);
        let mut tree = self.doc.lock();
        let id = HandlerId(tree.next_handler);
        tree.next_handler += 1;
        tree.handlers.entry(self.id).or_default().push((id, handler));
        id
    }

    pub fn with_attr(self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_value(self, value: &str) -> Self {
        self.set_value(value);
        self
    }

    pub fn with_text(self, text: &str) -> Self {
        self.append_text(text);
        self
    }

    pub fn with_child(self, child: Element) -> Self {
        self.append(&child);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(s: &str) -> Selector {
        Selector::parse(s).unwrap()
    }

    fn compose_fixture(doc: &Document) -> Element {
        let dialog = doc
            .create_element("div")
            .with_attr("role", "dialog")
            .with_child(
                doc.create_element("div")
                    .with_attr("name", "to")
                    .with_child(doc.create_element("span").with_attr("email", "bob@x.com")),
            )
            .with_child(
                doc.create_element("input")
                    .with_attr("name", "subjectbox")
                    .with_value("Hello"),
            )
            .with_child(doc.create_element("div").with_attr("class", "footer"));
        doc.body().append(&dialog);
        dialog
    }

    #[test]
    fn selects_by_attribute_and_combinator() {
        let doc = Document::new();
        let dialog = compose_fixture(&doc);

        let chip = dialog.select(&sel(r#"[name="to"] [email]"#)).unwrap();
        assert_eq!(chip.attr("email").as_deref(), Some("bob@x.com"));

        let footer = doc.select(&sel(r#"[role="dialog"] > div:last-child"#)).unwrap();
        assert!(footer.has_class("footer"));

        assert!(dialog.select(&sel("[name=to] > input")).is_none());
    }

    #[test]
    fn serializes_markup_with_escaping() {
        let doc = Document::new();
        let p = doc
            .create_element("p")
            .with_attr("title", "a \"b\"")
            .with_text("1 < 2")
            .with_child(doc.create_element("img").with_attr("src", "x?id=1"));
        assert_eq!(
            p.outer_html(),
            r#"<p title="a &quot;b&quot;">1 &lt; 2<img src="x?id=1"></p>"#
        );
    }

    #[test]
    fn removal_disconnects_subtree() {
        let doc = Document::new();
        let dialog = compose_fixture(&doc);
        let chip = dialog.query("[email]").unwrap();
        assert!(chip.is_connected());
        dialog.remove();
        assert!(!chip.is_connected());
        assert!(doc.select(&sel("[email]")).is_none());
    }

    #[test]
    fn insert_after_places_next_sibling() {
        let doc = Document::new();
        let parent = doc.create_element("div");
        let a = doc.create_element("a");
        let c = doc.create_element("c");
        parent.append(&a);
        parent.append(&c);
        let b = doc.create_element("b");
        a.insert_after(&b);
        let tags: Vec<String> = parent.children().iter().map(Element::tag).collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn structural_changes_are_published() {
        let doc = Document::new();
        let mut rx = doc.subscribe();
        let div = doc.create_element("div");
        div.set_attr("role", "dialog");
        assert!(rx.try_recv().is_err(), "attribute writes are not structural");
        doc.body().append(&div);
        assert_eq!(rx.try_recv().unwrap(), Mutation::ChildList { target: doc.body().id() });
    }

    #[test]
    fn click_runs_handlers_that_mutate_the_tree() {
        let doc = Document::new();
        let button = doc.create_element("div").with_attr("role", "button");
        doc.body().append(&button);
        let d2 = doc.clone();
        button.on_click(move |_| d2.body().append(&d2.create_element("span")));
        doc.click(&button);
        assert!(doc.select(&sel("span")).is_some());
    }

    #[test]
    fn off_click_unbinds_only_that_handler() {
        let doc = Document::new();
        let button = doc.create_element("div");
        doc.body().append(&button);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (h1, h2) = (hits.clone(), hits.clone());
        let first = button.on_click(move |_| h1.lock().unwrap().push(1));
        button.on_click(move |_| h2.lock().unwrap().push(2));
        assert_eq!(doc.handler_count(), 2);

        assert!(doc.off_click(first));
        assert!(!doc.off_click(first));
        doc.click(&button);
        assert_eq!(*hits.lock().unwrap(), vec![2]);
        assert_eq!(doc.handler_count(), 1);
    }

    #[test]
    fn append_rejects_cycles() {
        let doc = Document::new();
        let outer = doc.create_element("div");
        let inner = doc.create_element("div");
        outer.append(&inner);
        inner.append(&outer);
        assert_eq!(inner.parent(), Some(outer.clone()));
        assert!(outer.parent().is_none());
    }
}
