use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    HtmlParse(String),
    SelectorNotFound(String),
    UnsupportedSelector(String),
    NotAnElement(String),
    AssertionFailed {
        selector: String,
        expected: String,
        actual: String,
        dom_snippet: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HtmlParse(msg) => write!(f, "html parse error: {msg}"),
            Self::SelectorNotFound(selector) => write!(f, "selector not found: {selector}"),
            Self::UnsupportedSelector(selector) => write!(f, "unsupported selector: {selector}"),
            Self::NotAnElement(msg) => write!(f, "target is not an element: {msg}"),
            Self::AssertionFailed {
                selector,
                expected,
                actual,
                dom_snippet,
            } => write!(
                f,
                "assertion failed for {selector}: expected {expected}, actual {actual}, snippet {dom_snippet}"
            ),
        }
    }
}

impl StdError for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum NodeType {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    node_type: NodeType,
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    attrs: HashMap<String, String>,
}

/// In-memory element tree. Nodes are arena-allocated and addressed by
/// [`NodeId`]; nothing is ever freed, matching the lifetime model of a page
/// that outlives the component operating on it.
#[derive(Debug, Clone)]
pub struct Dom {
    nodes: Vec<Node>,
    root: NodeId,
    id_index: HashMap<String, NodeId>,
}

impl Dom {
    fn new() -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            node_type: NodeType::Document,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
            id_index: HashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn create_node(&mut self, parent: Option<NodeId>, node_type: NodeType) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            node_type,
        });
        if let Some(parent_id) = parent {
            self.nodes[parent_id.0].children.push(id);
        }
        id
    }

    pub fn create_element(
        &mut self,
        parent: NodeId,
        tag_name: String,
        attrs: HashMap<String, String>,
    ) -> NodeId {
        let element = Element { tag_name, attrs };
        let id = self.create_node(Some(parent), NodeType::Element(element));
        if let Some(id_attr) = self
            .element(id)
            .and_then(|element| element.attrs.get("id").cloned())
        {
            if !id_attr.is_empty() {
                self.id_index.entry(id_attr).or_insert(id);
            }
        }
        id
    }

    pub fn create_text(&mut self, parent: NodeId, text: String) -> NodeId {
        self.create_node(Some(parent), NodeType::Text(text))
    }

    fn element(&self, node_id: NodeId) -> Option<&Element> {
        match &self.nodes[node_id.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    fn element_mut(&mut self, node_id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[node_id.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn tag_name(&self, node_id: NodeId) -> Option<&str> {
        self.element(node_id).map(|e| e.tag_name.as_str())
    }

    pub fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes[node_id.0].parent
    }

    pub fn children(&self, node_id: NodeId) -> &[NodeId] {
        &self.nodes[node_id.0].children
    }

    pub fn by_id(&self, id: &str) -> Option<NodeId> {
        self.id_index.get(id).copied()
    }

    pub fn attr(&self, node_id: NodeId, name: &str) -> Option<String> {
        self.element(node_id)
            .and_then(|e| e.attrs.get(name).cloned())
    }

    pub fn set_attr(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        let lowered = name.to_ascii_lowercase();
        let old_id = if lowered == "id" {
            self.element(node_id)
                .and_then(|element| element.attrs.get("id").cloned())
        } else {
            None
        };

        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::NotAnElement("set_attr".into()))?;
        element.attrs.insert(lowered.clone(), value.to_string());

        if lowered == "id" {
            if let Some(old) = old_id {
                if self.id_index.get(&old) == Some(&node_id) {
                    self.id_index.remove(&old);
                }
            }
            if !value.is_empty() {
                self.id_index.insert(value.to_string(), node_id);
            }
        }

        Ok(())
    }

    pub fn remove_attr(&mut self, node_id: NodeId, name: &str) -> Result<()> {
        let lowered = name.to_ascii_lowercase();
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::NotAnElement("remove_attr".into()))?;
        element.attrs.remove(&lowered);

        if lowered == "id" {
            self.id_index.retain(|_, id| *id != node_id);
        }

        Ok(())
    }

    pub fn text_content(&self, node_id: NodeId) -> String {
        match &self.nodes[node_id.0].node_type {
            NodeType::Document | NodeType::Element(_) => {
                let mut out = String::new();
                for child in &self.nodes[node_id.0].children {
                    out.push_str(&self.text_content(*child));
                }
                out
            }
            NodeType::Text(text) => text.clone(),
        }
    }

    pub fn has_class(&self, node_id: NodeId, class_name: &str) -> bool {
        self.element(node_id)
            .and_then(|element| element.attrs.get("class"))
            .map(|classes| classes.split_whitespace().any(|c| c == class_name))
            .unwrap_or(false)
    }

    pub fn class_list(&self, node_id: NodeId) -> Vec<String> {
        self.element(node_id)
            .and_then(|element| element.attrs.get("class"))
            .map(|classes| classes.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn add_class(&mut self, node_id: NodeId, class_name: &str) {
        if class_name.is_empty() || self.has_class(node_id, class_name) {
            return;
        }
        let Some(element) = self.element_mut(node_id) else {
            return;
        };
        let classes = element.attrs.entry("class".into()).or_default();
        if classes.trim().is_empty() {
            *classes = class_name.to_string();
        } else {
            classes.push(' ');
            classes.push_str(class_name);
        }
    }

    pub fn remove_class(&mut self, node_id: NodeId, class_name: &str) {
        if !self.has_class(node_id, class_name) {
            return;
        }
        let Some(element) = self.element_mut(node_id) else {
            return;
        };
        if let Some(classes) = element.attrs.get_mut("class") {
            *classes = classes
                .split_whitespace()
                .filter(|c| *c != class_name)
                .collect::<Vec<_>>()
                .join(" ");
        }
    }

    pub fn query_selector(&self, selector: &str) -> Result<Option<NodeId>> {
        let all = self.query_selector_all(selector)?;
        Ok(all.into_iter().next())
    }

    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let groups = parse_selector_groups(selector)?;

        if groups.len() == 1 && groups[0].len() == 1 {
            if let Some(id) = groups[0][0].step.id_only() {
                return Ok(self.by_id(id).into_iter().collect());
            }
        }

        Ok(self.query_matching(&groups))
    }

    pub(crate) fn query_matching(&self, groups: &[Vec<SelectorPart>]) -> Vec<NodeId> {
        let mut ids = Vec::new();
        self.collect_elements_dfs(self.root, &mut ids);

        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        for candidate in ids {
            if groups
                .iter()
                .any(|steps| self.matches_selector_chain(candidate, steps))
                && seen.insert(candidate)
            {
                matched.push(candidate);
            }
        }
        matched
    }

    pub fn matches_selector(&self, node_id: NodeId, selector: &str) -> Result<bool> {
        if self.element(node_id).is_none() {
            return Ok(false);
        }

        let groups = parse_selector_groups(selector)?;
        Ok(groups
            .iter()
            .any(|steps| self.matches_selector_chain(node_id, steps)))
    }

    fn collect_elements_dfs(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        stacker::maybe_grow(64 * 1024, 1024 * 1024, || {
            if matches!(self.nodes[node_id.0].node_type, NodeType::Element(_)) {
                out.push(node_id);
            }
            for child in &self.nodes[node_id.0].children {
                self.collect_elements_dfs(*child, out);
            }
        });
    }

    fn matches_selector_chain(&self, node_id: NodeId, steps: &[SelectorPart]) -> bool {
        if steps.is_empty() {
            return false;
        }
        if !self.matches_step(node_id, &steps[steps.len() - 1].step) {
            return false;
        }

        let mut current = node_id;
        for idx in (1..steps.len()).rev() {
            let prev_step = &steps[idx - 1].step;
            let combinator = steps[idx]
                .combinator
                .unwrap_or(SelectorCombinator::Descendant);

            let matched = match combinator {
                SelectorCombinator::Child => {
                    let Some(parent) = self.parent(current) else {
                        return false;
                    };
                    if self.matches_step(parent, prev_step) {
                        Some(parent)
                    } else {
                        None
                    }
                }
                SelectorCombinator::Descendant => {
                    let mut cursor = self.parent(current);
                    let mut found = None;
                    while let Some(parent) = cursor {
                        if self.matches_step(parent, prev_step) {
                            found = Some(parent);
                            break;
                        }
                        cursor = self.parent(parent);
                    }
                    found
                }
            };

            let Some(matched) = matched else {
                return false;
            };
            current = matched;
        }

        true
    }

    fn matches_step(&self, node_id: NodeId, step: &SelectorStep) -> bool {
        let Some(element) = self.element(node_id) else {
            return false;
        };

        if !step.universal {
            if let Some(tag) = &step.tag {
                if !element.tag_name.eq_ignore_ascii_case(tag) {
                    return false;
                }
            }
        }

        if let Some(id) = &step.id {
            if element.attrs.get("id") != Some(id) {
                return false;
            }
        }

        if step
            .classes
            .iter()
            .any(|class_name| !self.has_class(node_id, class_name))
        {
            return false;
        }

        true
    }

    pub(crate) fn dump_node(&self, node_id: NodeId) -> String {
        let mut out = String::new();
        self.serialize_node(node_id, &mut out);
        out
    }

    fn serialize_node(&self, node_id: NodeId, out: &mut String) {
        stacker::maybe_grow(64 * 1024, 1024 * 1024, || {
            match &self.nodes[node_id.0].node_type {
                NodeType::Document => {
                    for child in &self.nodes[node_id.0].children {
                        self.serialize_node(*child, out);
                    }
                }
                NodeType::Text(text) => out.push_str(&escape_html_text(text)),
                NodeType::Element(element) => {
                    out.push('<');
                    out.push_str(&element.tag_name);
                    let mut names = element.attrs.keys().collect::<Vec<_>>();
                    names.sort();
                    for name in names {
                        out.push(' ');
                        out.push_str(name);
                        out.push_str("=\"");
                        out.push_str(&escape_html_attr(&element.attrs[name]));
                        out.push('"');
                    }
                    out.push('>');
                    if is_void_tag(&element.tag_name) {
                        return;
                    }
                    for child in &self.nodes[node_id.0].children {
                        self.serialize_node(*child, out);
                    }
                    out.push_str("</");
                    out.push_str(&element.tag_name);
                    out.push('>');
                }
            }
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SelectorStep {
    pub(crate) tag: Option<String>,
    pub(crate) universal: bool,
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
}

impl SelectorStep {
    fn id_only(&self) -> Option<&str> {
        if !self.universal && self.tag.is_none() && self.classes.is_empty() {
            self.id.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelectorCombinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectorPart {
    pub(crate) step: SelectorStep,
    // Relation to previous (left) selector part.
    pub(crate) combinator: Option<SelectorCombinator>,
}

pub(crate) fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    let mut parsed = Vec::new();
    for group in selector.split(',') {
        parsed.push(parse_selector_chain(group)?);
    }
    Ok(parsed)
}

fn parse_selector_chain(selector: &str) -> Result<Vec<SelectorPart>> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }

    let tokens = tokenize_selector(selector);
    let mut steps = Vec::new();
    let mut pending_combinator: Option<SelectorCombinator> = None;

    for token in tokens {
        if token == ">" {
            if pending_combinator.is_some() || steps.is_empty() {
                return Err(Error::UnsupportedSelector(selector.into()));
            }
            pending_combinator = Some(SelectorCombinator::Child);
            continue;
        }

        let step = parse_selector_step(&token)?;
        let combinator = if steps.is_empty() {
            None
        } else {
            Some(
                pending_combinator
                    .take()
                    .unwrap_or(SelectorCombinator::Descendant),
            )
        };
        steps.push(SelectorPart { step, combinator });
    }

    if steps.is_empty() || pending_combinator.is_some() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }

    Ok(steps)
}

fn tokenize_selector(selector: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in selector.chars() {
        if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else if ch == '>' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(">".into());
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_selector_step(token: &str) -> Result<SelectorStep> {
    let mut step = SelectorStep::default();
    let chars = token.chars().collect::<Vec<_>>();
    let mut i = 0usize;

    while i < chars.len() {
        match chars[i] {
            '*' if i == 0 => {
                step.universal = true;
                i += 1;
            }
            '#' => {
                let (name, next) = read_selector_name(&chars, i + 1);
                if name.is_empty() || step.id.is_some() {
                    return Err(Error::UnsupportedSelector(token.into()));
                }
                step.id = Some(name);
                i = next;
            }
            '.' => {
                let (name, next) = read_selector_name(&chars, i + 1);
                if name.is_empty() {
                    return Err(Error::UnsupportedSelector(token.into()));
                }
                step.classes.push(name);
                i = next;
            }
            ch if i == 0 && is_selector_name_char(ch) => {
                let (name, next) = read_selector_name(&chars, i);
                step.tag = Some(name);
                i = next;
            }
            _ => return Err(Error::UnsupportedSelector(token.into())),
        }
    }

    Ok(step)
}

fn read_selector_name(chars: &[char], from: usize) -> (String, usize) {
    let mut i = from;
    let mut name = String::new();
    while i < chars.len() && is_selector_name_char(chars[i]) {
        name.push(chars[i]);
        i += 1;
    }
    (name, i)
}

fn is_selector_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'
}

/// Listener callback. Handlers receive the page's element tree and the live
/// event, and run to completion before the next dispatch begins; the tree is
/// the only mutable state they share.
pub type Handler = Rc<dyn Fn(&mut Dom, &mut EventState)>;

#[derive(Clone)]
struct Listener {
    key: String,
    capture: bool,
    handler: Handler,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("key", &self.key)
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone)]
struct ListenerStore {
    map: HashMap<NodeId, HashMap<String, Vec<Listener>>>,
}

impl ListenerStore {
    fn add(&mut self, node_id: NodeId, event: String, listener: Listener) -> bool {
        let listeners = self.map.entry(node_id).or_default().entry(event).or_default();
        if listeners
            .iter()
            .any(|existing| existing.key == listener.key && existing.capture == listener.capture)
        {
            return false;
        }
        listeners.push(listener);
        true
    }

    fn remove(&mut self, node_id: NodeId, event: &str, key: &str) -> bool {
        let Some(events) = self.map.get_mut(&node_id) else {
            return false;
        };
        let Some(listeners) = events.get_mut(event) else {
            return false;
        };

        if let Some(pos) = listeners.iter().position(|listener| listener.key == key) {
            listeners.remove(pos);
            if listeners.is_empty() {
                events.remove(event);
            }
            if events.is_empty() {
                self.map.remove(&node_id);
            }
            return true;
        }

        false
    }

    fn get(&self, node_id: NodeId, event: &str, capture: bool) -> Vec<Listener> {
        self.map
            .get(&node_id)
            .and_then(|events| events.get(event))
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|listener| listener.capture == capture)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct EventState {
    event_type: String,
    target: NodeId,
    current_target: NodeId,
    default_prevented: bool,
    propagation_stopped: bool,
    immediate_propagation_stopped: bool,
}

impl EventState {
    fn new(event_type: &str, target: NodeId) -> Self {
        Self {
            event_type: event_type.to_string(),
            target,
            current_target: target,
            default_prevented: false,
            propagation_stopped: false,
            immediate_propagation_stopped: false,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// The node whose listener is currently running, like the original
    /// handler's `this` binding.
    pub fn current_target(&self) -> NodeId {
        self.current_target
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }

    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn stop_immediate_propagation(&mut self) {
        self.propagation_stopped = true;
        self.immediate_propagation_stopped = true;
    }
}

/// A loaded document plus its registered listeners. Dispatch is synchronous
/// and serialized: one event runs to completion before the next is delivered,
/// so listeners never observe a half-applied mutation from another click.
#[derive(Debug)]
pub struct Page {
    dom: Dom,
    listeners: ListenerStore,
    next_listener_seq: u64,
    trace: bool,
    trace_logs: Vec<String>,
    trace_log_limit: usize,
    trace_to_stderr: bool,
}

impl Page {
    pub fn new() -> Self {
        Self::with_dom(Dom::new())
    }

    pub fn from_html(html: &str) -> Result<Self> {
        Ok(Self::with_dom(parse_html(html)?))
    }

    fn with_dom(dom: Dom) -> Self {
        Self {
            dom,
            listeners: ListenerStore::default(),
            next_listener_seq: 0,
            trace: false,
            trace_logs: Vec::new(),
            trace_log_limit: 10_000,
            trace_to_stderr: true,
        }
    }

    pub fn dom(&self) -> &Dom {
        &self.dom
    }

    pub fn dom_mut(&mut self) -> &mut Dom {
        &mut self.dom
    }

    /// Registers a bubble-phase listener and returns its auto-assigned key.
    pub fn add_listener(&mut self, node: NodeId, event_type: &str, handler: Handler) -> String {
        self.next_listener_seq += 1;
        let key = format!("listener-{}", self.next_listener_seq);
        self.listeners.add(
            node,
            event_type.to_string(),
            Listener {
                key: key.clone(),
                capture: false,
                handler,
            },
        );
        key
    }

    /// Registers a bubble-phase listener under a caller-chosen key. A second
    /// registration with the same key on the same node and event type is
    /// refused, so re-running an attachment pass cannot double-fire handlers.
    pub fn add_listener_keyed(
        &mut self,
        node: NodeId,
        event_type: &str,
        key: &str,
        handler: Handler,
    ) -> bool {
        self.listeners.add(
            node,
            event_type.to_string(),
            Listener {
                key: key.to_string(),
                capture: false,
                handler,
            },
        )
    }

    pub fn add_capture_listener(
        &mut self,
        node: NodeId,
        event_type: &str,
        handler: Handler,
    ) -> String {
        self.next_listener_seq += 1;
        let key = format!("listener-{}", self.next_listener_seq);
        self.listeners.add(
            node,
            event_type.to_string(),
            Listener {
                key: key.clone(),
                capture: true,
                handler,
            },
        );
        key
    }

    pub fn remove_listener(&mut self, node: NodeId, event_type: &str, key: &str) -> bool {
        self.listeners.remove(node, event_type, key)
    }

    pub fn click(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.click_node(target);
        Ok(())
    }

    pub fn click_node(&mut self, node: NodeId) {
        self.dispatch_event(node, "click");
    }

    pub fn dispatch(&mut self, selector: &str, event_type: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.dispatch_event(target, event_type);
        Ok(())
    }

    fn dispatch_event(&mut self, target: NodeId, event_type: &str) -> EventState {
        let mut event = EventState::new(event_type, target);

        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(node) = cursor {
            path.push(node);
            cursor = self.dom.parent(node);
        }
        path.reverse();

        // Capture phase.
        if path.len() >= 2 {
            for node in &path[..path.len() - 1] {
                event.current_target = *node;
                self.invoke_listeners(*node, &mut event, true);
                if event.propagation_stopped {
                    self.trace_event_done(&event, "propagation_stopped");
                    return event;
                }
            }
        }

        // Target phase: capture listeners first.
        event.current_target = target;
        self.invoke_listeners(target, &mut event, true);
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return event;
        }

        // Target phase: bubble listeners.
        self.invoke_listeners(target, &mut event, false);
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return event;
        }

        // Bubble phase.
        if path.len() >= 2 {
            for node in path[..path.len() - 1].iter().rev() {
                event.current_target = *node;
                self.invoke_listeners(*node, &mut event, false);
                if event.propagation_stopped {
                    self.trace_event_done(&event, "propagation_stopped");
                    return event;
                }
            }
        }

        self.trace_event_done(&event, "completed");
        event
    }

    fn invoke_listeners(&mut self, node_id: NodeId, event: &mut EventState, capture: bool) {
        let listeners = self.listeners.get(node_id, &event.event_type, capture);
        for listener in listeners {
            if self.trace {
                let phase = if capture { "capture" } else { "bubble" };
                let target_label = self.event_node_label(event.target);
                let current_label = self.event_node_label(event.current_target);
                self.trace_line(format!(
                    "[event] {} target={} current={} phase={} key={}",
                    event.event_type, target_label, current_label, phase, listener.key
                ));
            }
            (listener.handler)(&mut self.dom, event);
            if event.immediate_propagation_stopped {
                break;
            }
        }
    }

    pub fn query_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        self.dom.query_selector_all(selector)
    }

    pub fn assert_exists(&self, selector: &str) -> Result<()> {
        let _ = self.select_one(selector)?;
        Ok(())
    }

    pub fn assert_text(&self, selector: &str, expected: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        let actual = self.dom.text_content(target);
        if actual != expected {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: expected.to_string(),
                actual,
                dom_snippet: self.node_snippet(target),
            });
        }
        Ok(())
    }

    pub fn assert_has_class(&self, selector: &str, class_name: &str, expected: bool) -> Result<()> {
        let target = self.select_one(selector)?;
        let actual = self.dom.has_class(target, class_name);
        if actual != expected {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: format!("{class_name}={expected}"),
                actual: format!("{class_name}={actual}"),
                dom_snippet: self.node_snippet(target),
            });
        }
        Ok(())
    }

    fn select_one(&self, selector: &str) -> Result<NodeId> {
        self.dom
            .query_selector(selector)?
            .ok_or_else(|| Error::SelectorNotFound(selector.to_string()))
    }

    fn node_snippet(&self, node_id: NodeId) -> String {
        truncate_chars(&self.dom.dump_node(node_id), 200)
    }

    pub fn enable_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    pub fn set_trace_stderr(&mut self, enabled: bool) {
        self.trace_to_stderr = enabled;
    }

    pub fn take_trace_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.trace_logs)
    }

    fn trace_event_done(&mut self, event: &EventState, outcome: &str) {
        if !self.trace {
            return;
        }
        let target_label = self.event_node_label(event.target);
        let current_label = self.event_node_label(event.current_target);
        self.trace_line(format!(
            "[event] done {} target={} current={} outcome={} propagation_stopped={} immediate_stopped={}",
            event.event_type,
            target_label,
            current_label,
            outcome,
            event.propagation_stopped,
            event.immediate_propagation_stopped
        ));
    }

    fn trace_line(&mut self, line: String) {
        if !self.trace {
            return;
        }
        if self.trace_to_stderr {
            eprintln!("{line}");
        }
        self.trace_logs.push(line);
        while self.trace_logs.len() > self.trace_log_limit {
            self.trace_logs.remove(0);
        }
    }

    fn event_node_label(&self, node_id: NodeId) -> String {
        match self.dom.tag_name(node_id) {
            Some(tag) => match self.dom.attr(node_id, "id") {
                Some(id) if !id.is_empty() => format!("{tag}#{id}"),
                _ => tag.to_string(),
            },
            None => "document".to_string(),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-element marker state. An element carries at most one marker; clicking
/// it advances the state along the fixed cycle returned by [`next_marker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Unmarked,
    Topmost,
    Bottommost,
}

/// The click cycle: unmarked, then topmost, then bottommost, then unmarked
/// again. Bottommost does not wrap to topmost; it drops back to unmarked.
pub fn next_marker(current: Marker) -> Marker {
    match current {
        Marker::Unmarked => Marker::Topmost,
        Marker::Topmost => Marker::Bottommost,
        Marker::Bottommost => Marker::Unmarked,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TogglerConfig {
    pub selector: String,
    pub top_class: String,
    pub bottom_class: String,
}

impl Default for TogglerConfig {
    fn default() -> Self {
        Self {
            selector: ".event".into(),
            top_class: "topmost".into(),
            bottom_class: "bottommost".into(),
        }
    }
}

/// Binds a click listener to every element matching `selector` and keeps the
/// two marker classes mutually exclusive across the whole set: each click
/// first strips both markers from every member, then re-marks the clicked
/// element according to the marker it held before the click.
#[derive(Debug, Clone)]
pub struct ClassToggler {
    config: Rc<TogglerConfig>,
}

impl Default for ClassToggler {
    fn default() -> Self {
        Self::new(TogglerConfig::default())
    }
}

impl ClassToggler {
    pub fn new(config: TogglerConfig) -> Self {
        Self {
            config: Rc::new(config),
        }
    }

    pub fn config(&self) -> &TogglerConfig {
        &self.config
    }

    pub fn marker_of(&self, dom: &Dom, node: NodeId) -> Marker {
        marker_of(dom, &self.config, node)
    }

    /// Registers the click handler on every element currently matching the
    /// configured selector. Returns the number of elements newly bound; zero
    /// matches is not an error. Attaching the same configuration to the same
    /// page twice binds nothing new.
    pub fn attach(&self, page: &mut Page) -> Result<usize> {
        let groups = Rc::new(parse_selector_groups(&self.config.selector)?);
        let members = page.dom().query_matching(&groups);
        let key = format!(
            "toggler:{}:{}:{}",
            self.config.selector, self.config.top_class, self.config.bottom_class
        );

        let mut bound = 0;
        for node in members {
            let config = Rc::clone(&self.config);
            let groups = Rc::clone(&groups);
            let handler: Handler = Rc::new(move |dom, event| {
                toggle_markers(dom, &config, &groups, event.current_target());
            });
            if page.add_listener_keyed(node, "click", &key, handler) {
                bound += 1;
            }
        }
        Ok(bound)
    }
}

fn marker_of(dom: &Dom, config: &TogglerConfig, node: NodeId) -> Marker {
    if dom.has_class(node, &config.top_class) {
        Marker::Topmost
    } else if dom.has_class(node, &config.bottom_class) {
        Marker::Bottommost
    } else {
        Marker::Unmarked
    }
}

fn toggle_markers(
    dom: &mut Dom,
    config: &TogglerConfig,
    groups: &[Vec<SelectorPart>],
    clicked: NodeId,
) {
    // The previous marker must be read before anything is cleared.
    let previous = marker_of(dom, config, clicked);

    // The member set is re-queried on every click, as the original did; the
    // clicked element stays in it even if its classes changed since attach.
    let mut members = dom.query_matching(groups);
    if !members.contains(&clicked) {
        members.push(clicked);
    }
    for member in members {
        dom.remove_class(member, &config.top_class);
        dom.remove_class(member, &config.bottom_class);
    }

    match next_marker(previous) {
        Marker::Topmost => dom.add_class(clicked, &config.top_class),
        Marker::Bottommost => dom.add_class(clicked, &config.bottom_class),
        Marker::Unmarked => {}
    }
}

fn parse_html(html: &str) -> Result<Dom> {
    let mut dom = Dom::new();

    let mut stack = vec![dom.root];
    let bytes = html.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if starts_with_at(bytes, i, b"<!--") {
            if let Some(end) = find_subslice(bytes, i + 4, b"-->") {
                i = end + 3;
            } else {
                return Err(Error::HtmlParse("unclosed HTML comment".into()));
            }
            continue;
        }

        if bytes[i] == b'<' {
            if starts_with_at(bytes, i, b"</") {
                let (tag, next) = parse_end_tag(html, i)?;
                i = next;

                while stack.len() > 1 {
                    let top = *stack
                        .last()
                        .ok_or_else(|| Error::HtmlParse("invalid stack state".into()))?;
                    let top_tag = dom.tag_name(top).unwrap_or("");
                    stack.pop();
                    if top_tag.eq_ignore_ascii_case(&tag) {
                        break;
                    }
                }
                continue;
            }

            let (tag, attrs, self_closing, next) = parse_start_tag(html, i)?;
            i = next;

            let parent = *stack
                .last()
                .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
            let node = dom.create_element(parent, tag.clone(), attrs);

            // Raw-text elements: content is kept as text, never parsed as
            // markup and never executed.
            if is_raw_text_tag(&tag) {
                let close = find_case_insensitive_end_tag(bytes, i, tag.as_bytes())
                    .ok_or_else(|| Error::HtmlParse(format!("unclosed <{tag}>")))?;
                if let Some(body) = html.get(i..close) {
                    if !body.is_empty() {
                        dom.create_text(node, body.to_string());
                    }
                }
                i = close;
                let (_, after_end) = parse_end_tag(html, i)?;
                i = after_end;
                continue;
            }

            if !self_closing && !is_void_tag(&tag) {
                stack.push(node);
            }
            continue;
        }

        let text_start = i;
        while i < bytes.len() && bytes[i] != b'<' {
            i += 1;
        }

        if let Some(text) = html.get(text_start..i) {
            if !text.is_empty() {
                let parent = *stack
                    .last()
                    .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
                dom.create_text(parent, text.to_string());
            }
        }
    }

    Ok(dom)
}

fn parse_start_tag(
    html: &str,
    at: usize,
) -> Result<(String, HashMap<String, String>, bool, usize)> {
    let bytes = html.as_bytes();
    let mut i = at;
    if bytes.get(i) != Some(&b'<') {
        return Err(Error::HtmlParse("expected '<'".into()));
    }
    i += 1;

    skip_ws(bytes, &mut i);
    let tag_start = i;
    while i < bytes.len() && is_tag_char(bytes[i]) {
        i += 1;
    }

    let tag = html
        .get(tag_start..i)
        .ok_or_else(|| Error::HtmlParse("invalid tag name".into()))?
        .to_ascii_lowercase();

    if tag.is_empty() {
        return Err(Error::HtmlParse("empty tag name".into()));
    }

    let mut attrs = HashMap::new();
    let mut self_closing = false;

    loop {
        skip_ws(bytes, &mut i);
        if i >= bytes.len() {
            return Err(Error::HtmlParse("unclosed start tag".into()));
        }

        if bytes[i] == b'>' {
            i += 1;
            break;
        }

        if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'>' {
            self_closing = true;
            i += 2;
            break;
        }

        let name_start = i;
        while i < bytes.len() && is_attr_name_char(bytes[i]) {
            i += 1;
        }

        let name = html
            .get(name_start..i)
            .ok_or_else(|| Error::HtmlParse("invalid attribute name".into()))?
            .to_ascii_lowercase();

        if name.is_empty() {
            return Err(Error::HtmlParse("invalid attribute name".into()));
        }

        skip_ws(bytes, &mut i);

        let value = if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            skip_ws(bytes, &mut i);
            parse_attr_value(html, bytes, &mut i)?
        } else {
            "true".to_string()
        };

        attrs.insert(name, value);
    }

    Ok((tag, attrs, self_closing, i))
}

fn parse_end_tag(html: &str, at: usize) -> Result<(String, usize)> {
    let bytes = html.as_bytes();
    let mut i = at;

    if !(bytes.get(i) == Some(&b'<') && bytes.get(i + 1) == Some(&b'/')) {
        return Err(Error::HtmlParse("expected end tag".into()));
    }
    i += 2;
    skip_ws(bytes, &mut i);

    let tag_start = i;
    while i < bytes.len() && is_tag_char(bytes[i]) {
        i += 1;
    }

    let tag = html
        .get(tag_start..i)
        .ok_or_else(|| Error::HtmlParse("invalid end tag".into()))?
        .to_ascii_lowercase();

    while i < bytes.len() && bytes[i] != b'>' {
        i += 1;
    }
    if i >= bytes.len() {
        return Err(Error::HtmlParse("unclosed end tag".into()));
    }

    Ok((tag, i + 1))
}

fn parse_attr_value(html: &str, bytes: &[u8], i: &mut usize) -> Result<String> {
    if *i >= bytes.len() {
        return Err(Error::HtmlParse("missing attribute value".into()));
    }

    if bytes[*i] == b'\'' || bytes[*i] == b'"' {
        let quote = bytes[*i];
        *i += 1;
        let start = *i;
        while *i < bytes.len() && bytes[*i] != quote {
            *i += 1;
        }
        if *i >= bytes.len() {
            return Err(Error::HtmlParse("unclosed quoted attribute value".into()));
        }
        let value = html
            .get(start..*i)
            .ok_or_else(|| Error::HtmlParse("invalid attribute value".into()))?
            .to_string();
        *i += 1;
        return Ok(value);
    }

    let start = *i;
    while *i < bytes.len()
        && !bytes[*i].is_ascii_whitespace()
        && bytes[*i] != b'>'
        && !(bytes[*i] == b'/' && *i + 1 < bytes.len() && bytes[*i + 1] == b'>')
    {
        *i += 1;
    }

    let value = html
        .get(start..*i)
        .ok_or_else(|| Error::HtmlParse("invalid attribute value".into()))?
        .to_string();
    Ok(value)
}

fn skip_ws(bytes: &[u8], i: &mut usize) {
    while *i < bytes.len() && bytes[*i].is_ascii_whitespace() {
        *i += 1;
    }
}

fn is_tag_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

fn is_attr_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':'
}

fn is_void_tag(tag: &str) -> bool {
    matches!(
        tag.to_ascii_lowercase().as_str(),
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

fn is_raw_text_tag(tag: &str) -> bool {
    tag.eq_ignore_ascii_case("script") || tag.eq_ignore_ascii_case("style")
}

fn starts_with_at(bytes: &[u8], at: usize, needle: &[u8]) -> bool {
    bytes.len() >= at + needle.len() && &bytes[at..at + needle.len()] == needle
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || bytes.len() < needle.len() {
        return None;
    }
    (from..=bytes.len() - needle.len()).find(|&i| &bytes[i..i + needle.len()] == needle)
}

fn find_case_insensitive_end_tag(bytes: &[u8], from: usize, tag: &[u8]) -> Option<usize> {
    let mut i = from;
    while i + 1 < bytes.len() {
        if bytes[i] == b'<' && bytes[i + 1] == b'/' {
            let rest = &bytes[i + 2..];
            if rest.len() >= tag.len() && rest[..tag.len()].eq_ignore_ascii_case(tag) {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn escape_html_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_html_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        value.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests;
