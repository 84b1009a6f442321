use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    HtmlParse(String),
    Runtime(String),
    SelectorNotFound(String),
    UnsupportedSelector(String),
    TypeMismatch {
        selector: String,
        expected: String,
        actual: String,
    },
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
            Self::Runtime(msg) => write!(f, "runtime error: {msg}"),
            Self::SelectorNotFound(selector) => write!(f, "selector not found: {selector}"),
            Self::UnsupportedSelector(selector) => write!(f, "unsupported selector: {selector}"),
            Self::TypeMismatch {
                selector,
                expected,
                actual,
            } => write!(
                f,
                "type mismatch for {selector}: expected {expected}, actual {actual}"
            ),
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

pub const ALERT_DISMISS_MS: i64 = 5000;

const ALERT_SELECTOR: &str = ".alert";
const GUARD_SELECTOR: &str = ".needs-validation";
const BOOT_CONSOLE_LINE: &str = "page glue loaded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeId(usize);

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
    value: String,
    checked: bool,
    disabled: bool,
    readonly: bool,
    required: bool,
}

#[derive(Debug, Clone)]
struct Dom {
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

    fn create_element(
        &mut self,
        parent: NodeId,
        tag_name: String,
        attrs: HashMap<String, String>,
    ) -> NodeId {
        let value = attrs.get("value").cloned().unwrap_or_default();
        let checked = attrs.contains_key("checked");
        let disabled = attrs.contains_key("disabled");
        let readonly = attrs.contains_key("readonly");
        let required = attrs.contains_key("required");
        let element = Element {
            tag_name,
            attrs,
            value,
            checked,
            disabled,
            readonly,
            required,
        };
        let id = self.create_node(Some(parent), NodeType::Element(element));
        if let Some(id_attr) = self
            .element(id)
            .and_then(|element| element.attrs.get("id").cloned())
        {
            self.id_index.insert(id_attr, id);
        }
        id
    }

    fn create_text(&mut self, parent: NodeId, text: String) -> NodeId {
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

    fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes[node_id.0].parent
    }

    fn tag_name(&self, node_id: NodeId) -> Option<&str> {
        self.element(node_id).map(|element| element.tag_name.as_str())
    }

    fn attr(&self, node_id: NodeId, name: &str) -> Option<String> {
        self.element(node_id)
            .and_then(|element| element.attrs.get(name).cloned())
    }

    fn value(&self, node_id: NodeId) -> Result<String> {
        self.element(node_id)
            .map(|element| element.value.clone())
            .ok_or_else(|| Error::Runtime("value target is not an element".into()))
    }

    fn set_value(&mut self, node_id: NodeId, value: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("value target is not an element".into()))?;
        element.value = value.to_string();
        Ok(())
    }

    fn checked(&self, node_id: NodeId) -> bool {
        self.element(node_id).map(|e| e.checked).unwrap_or(false)
    }

    fn set_checked(&mut self, node_id: NodeId, checked: bool) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("checked target is not an element".into()))?;
        element.checked = checked;
        Ok(())
    }

    fn disabled(&self, node_id: NodeId) -> bool {
        self.element(node_id).map(|e| e.disabled).unwrap_or(false)
    }

    fn readonly(&self, node_id: NodeId) -> bool {
        self.element(node_id).map(|e| e.readonly).unwrap_or(false)
    }

    fn text_content(&self, node_id: NodeId) -> String {
        let mut out = String::new();
        let mut stack = vec![node_id];
        while let Some(current) = stack.pop() {
            match &self.nodes[current.0].node_type {
                NodeType::Text(text) => out.push_str(text),
                _ => {
                    for child in self.nodes[current.0].children.iter().rev() {
                        stack.push(*child);
                    }
                }
            }
        }
        out
    }

    fn find_ancestor_by_tag(&self, node_id: NodeId, tag: &str) -> Option<NodeId> {
        let mut cursor = self.parent(node_id);
        while let Some(current) = cursor {
            if self
                .tag_name(current)
                .map(|t| t.eq_ignore_ascii_case(tag))
                .unwrap_or(false)
            {
                return Some(current);
            }
            cursor = self.parent(current);
        }
        None
    }

    fn previous_element_sibling(&self, node_id: NodeId) -> Option<NodeId> {
        let parent = self.parent(node_id)?;
        let siblings = &self.nodes[parent.0].children;
        let position = siblings.iter().position(|child| *child == node_id)?;
        siblings[..position]
            .iter()
            .rev()
            .copied()
            .find(|sibling| self.element(*sibling).is_some())
    }

    fn collect_elements_dfs(&self, from: NodeId, out: &mut Vec<NodeId>) {
        if self.element(from).is_some() {
            out.push(from);
        }
        for child in &self.nodes[from.0].children {
            self.collect_elements_dfs(*child, out);
        }
    }

    fn by_id(&self, id: &str) -> Option<NodeId> {
        self.id_index.get(id).copied()
    }

    fn in_document(&self, node_id: NodeId) -> bool {
        let mut cursor = node_id;
        loop {
            if cursor == self.root {
                return true;
            }
            match self.parent(cursor) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    fn remove_subtree(&mut self, node_id: NodeId) -> Result<()> {
        if node_id == self.root {
            return Err(Error::Runtime("cannot remove the document root".into()));
        }
        let mut subtree = Vec::new();
        self.collect_elements_dfs(node_id, &mut subtree);
        for member in subtree {
            if let Some(id_attr) = self.attr(member, "id") {
                if self.id_index.get(&id_attr) == Some(&member) {
                    self.id_index.remove(&id_attr);
                }
            }
        }
        if let Some(parent) = self.nodes[node_id.0].parent.take() {
            self.nodes[parent.0].children.retain(|child| *child != node_id);
        }
        Ok(())
    }

    fn class_add(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("class target is not an element".into()))?;
        let mut classes = class_tokens(element.attrs.get("class").map(String::as_str));
        if !classes.iter().any(|name| name == class_name) {
            classes.push(class_name.to_string());
        }
        set_class_attr(element, &classes);
        Ok(())
    }

    fn class_remove(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("class target is not an element".into()))?;
        let mut classes = class_tokens(element.attrs.get("class").map(String::as_str));
        classes.retain(|name| name != class_name);
        set_class_attr(element, &classes);
        Ok(())
    }

    fn style_get(&self, node_id: NodeId, key: &str) -> Result<String> {
        let element = self
            .element(node_id)
            .ok_or_else(|| Error::Runtime("style target is not an element".into()))?;
        let decls = parse_style_declarations(element.attrs.get("style").map(String::as_str));
        Ok(decls
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
            .unwrap_or_default())
    }

    fn style_set(&mut self, node_id: NodeId, key: &str, value: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Runtime("style target is not an element".into()))?;
        let mut decls = parse_style_declarations(element.attrs.get("style").map(String::as_str));
        if value.is_empty() {
            decls.retain(|(name, _)| name != key);
        } else if let Some(entry) = decls.iter_mut().find(|(name, _)| name == key) {
            entry.1 = value.to_string();
        } else {
            decls.push((key.to_string(), value.to_string()));
        }
        if decls.is_empty() {
            element.attrs.remove("style");
        } else {
            element
                .attrs
                .insert("style".to_string(), serialize_style_declarations(&decls));
        }
        Ok(())
    }

    fn query_selector(&self, selector: &str) -> Result<Option<NodeId>> {
        let all = self.query_selector_all(selector)?;
        Ok(all.into_iter().next())
    }

    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let groups = parse_selector_groups(selector)?;

        if groups.len() == 1 && groups[0].len() == 1 {
            if let Some(id) = groups[0][0].step.id_only() {
                return Ok(self.by_id(id).into_iter().collect());
            }
        }

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
        Ok(matched)
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
                SelectorCombinator::AdjacentSibling => self
                    .previous_element_sibling(current)
                    .filter(|sibling| self.matches_step(*sibling, prev_step)),
                SelectorCombinator::GeneralSibling => {
                    let mut cursor = self.previous_element_sibling(current);
                    let mut found = None;
                    while let Some(sibling) = cursor {
                        if self.matches_step(sibling, prev_step) {
                            found = Some(sibling);
                            break;
                        }
                        cursor = self.previous_element_sibling(sibling);
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

        if let Some(tag) = &step.tag {
            if !element.tag_name.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &step.id {
            if element.attrs.get("id") != Some(id) {
                return false;
            }
        }
        for class in &step.classes {
            if !has_class(element, class) {
                return false;
            }
        }
        for condition in &step.attrs {
            match condition {
                SelectorAttrCondition::Exists(name) => {
                    if !element.attrs.contains_key(name) {
                        return false;
                    }
                }
                SelectorAttrCondition::Equals(name, value) => {
                    if element.attrs.get(name) != Some(value) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn initialize_form_control_values(&mut self) {
        let mut elements = Vec::new();
        self.collect_elements_dfs(self.root, &mut elements);

        let mut updates = Vec::new();
        for node_id in elements {
            match self.tag_name(node_id) {
                Some("textarea") => {
                    // A textarea's default value is its text content.
                    updates.push((node_id, self.text_content(node_id)));
                }
                Some("select") => {
                    let mut descendants = Vec::new();
                    self.collect_elements_dfs(node_id, &mut descendants);
                    let options: Vec<NodeId> = descendants
                        .into_iter()
                        .filter(|id| self.tag_name(*id) == Some("option"))
                        .collect();
                    // The last explicitly selected option wins, as in a single select.
                    let chosen = options
                        .iter()
                        .rev()
                        .find(|option| self.attr(**option, "selected").is_some())
                        .copied()
                        .or_else(|| options.first().copied());
                    let value = chosen
                        .map(|option| self.option_value(option))
                        .unwrap_or_default();
                    updates.push((node_id, value));
                }
                _ => {}
            }
        }

        for (node_id, value) in updates {
            if let Some(element) = self.element_mut(node_id) {
                element.value = value;
            }
        }
    }

    fn option_value(&self, option: NodeId) -> String {
        self.attr(option, "value")
            .unwrap_or_else(|| self.text_content(option).trim().to_string())
    }

    fn dump_node(&self, node_id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(node_id, &mut out);
        out
    }

    fn write_node(&self, node_id: NodeId, out: &mut String) {
        match &self.nodes[node_id.0].node_type {
            NodeType::Document => {
                for child in &self.nodes[node_id.0].children {
                    self.write_node(*child, out);
                }
            }
            NodeType::Text(text) => out.push_str(text),
            NodeType::Element(element) => {
                out.push('<');
                out.push_str(&element.tag_name);
                let mut names: Vec<&String> = element.attrs.keys().collect();
                names.sort();
                for name in names {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&element.attrs[name]);
                    out.push('"');
                }
                out.push('>');
                for child in &self.nodes[node_id.0].children {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
            }
        }
    }
}

fn has_class(element: &Element, class_name: &str) -> bool {
    element
        .attrs
        .get("class")
        .map(|classes| classes.split_whitespace().any(|c| c == class_name))
        .unwrap_or(false)
}

fn class_tokens(class_attr: Option<&str>) -> Vec<String> {
    class_attr
        .map(|value| {
            value
                .split_whitespace()
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn set_class_attr(element: &mut Element, classes: &[String]) {
    if classes.is_empty() {
        element.attrs.remove("class");
    } else {
        element.attrs.insert("class".to_string(), classes.join(" "));
    }
}

fn parse_style_declarations(style_attr: Option<&str>) -> Vec<(String, String)> {
    let mut decls = Vec::new();
    let Some(style_attr) = style_attr else {
        return decls;
    };
    for decl in style_attr.split(';') {
        let Some((name, value)) = decl.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        decls.push((name.to_string(), value.to_string()));
    }
    decls
}

fn serialize_style_declarations(decls: &[(String, String)]) -> String {
    decls
        .iter()
        .map(|(name, value)| format!("{name}: {value};"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SelectorStep {
    tag: Option<String>,
    universal: bool,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<SelectorAttrCondition>,
}

impl SelectorStep {
    fn id_only(&self) -> Option<&str> {
        if !self.universal && self.tag.is_none() && self.classes.is_empty() && self.attrs.is_empty()
        {
            self.id.as_deref()
        } else {
            None
        }
    }

    fn is_empty(&self) -> bool {
        !self.universal
            && self.tag.is_none()
            && self.id.is_none()
            && self.classes.is_empty()
            && self.attrs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SelectorAttrCondition {
    Exists(String),
    Equals(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectorCombinator {
    Descendant,
    Child,
    AdjacentSibling,
    GeneralSibling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectorPart {
    step: SelectorStep,
    // Relation to previous (left) selector part.
    combinator: Option<SelectorCombinator>,
}

fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    let groups = split_selector_groups(selector)?;
    let mut parsed = Vec::with_capacity(groups.len());
    for group in groups {
        parsed.push(parse_selector_chain(&group)?);
    }
    Ok(parsed)
}

fn split_selector_groups(selector: &str) -> Result<Vec<String>> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;

    for ch in selector.chars() {
        match ch {
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                if bracket_depth == 0 {
                    return Err(Error::UnsupportedSelector(selector.into()));
                }
                bracket_depth -= 1;
                current.push(ch);
            }
            ',' if bracket_depth == 0 => {
                let trimmed = current.trim();
                if trimmed.is_empty() {
                    return Err(Error::UnsupportedSelector(selector.into()));
                }
                groups.push(trimmed.to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if bracket_depth != 0 {
        return Err(Error::UnsupportedSelector(selector.into()));
    }
    let trimmed = current.trim();
    if trimmed.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }
    groups.push(trimmed.to_string());
    Ok(groups)
}

fn parse_selector_chain(selector: &str) -> Result<Vec<SelectorPart>> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }

    let tokens = tokenize_selector(selector)?;
    let mut steps = Vec::new();
    let mut pending_combinator: Option<SelectorCombinator> = None;

    for token in tokens {
        if token == ">" || token == "+" || token == "~" {
            if pending_combinator.is_some() || steps.is_empty() {
                return Err(Error::UnsupportedSelector(selector.into()));
            }
            pending_combinator = Some(match token.as_str() {
                ">" => SelectorCombinator::Child,
                "+" => SelectorCombinator::AdjacentSibling,
                "~" => SelectorCombinator::GeneralSibling,
                _ => unreachable!(),
            });
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

fn tokenize_selector(selector: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;

    for ch in selector.chars() {
        match ch {
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                if bracket_depth == 0 {
                    return Err(Error::UnsupportedSelector(selector.into()));
                }
                bracket_depth -= 1;
                current.push(ch);
            }
            '>' | '+' | '~' if bracket_depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(ch.to_string());
            }
            ch if ch.is_whitespace() && bracket_depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if bracket_depth != 0 {
        return Err(Error::UnsupportedSelector(selector.into()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_selector_step(token: &str) -> Result<SelectorStep> {
    let mut step = SelectorStep::default();
    let chars: Vec<char> = token.chars().collect();
    let mut i = 0usize;

    if i < chars.len() && chars[i] == '*' {
        step.universal = true;
        i += 1;
    } else {
        let start = i;
        while i < chars.len() && is_selector_name_char(chars[i]) {
            i += 1;
        }
        if i > start {
            let tag: String = chars[start..i].iter().collect();
            step.tag = Some(tag.to_ascii_lowercase());
        }
    }

    while i < chars.len() {
        match chars[i] {
            '#' => {
                i += 1;
                let name = read_selector_name(&chars, &mut i);
                if name.is_empty() || step.id.is_some() {
                    return Err(Error::UnsupportedSelector(token.into()));
                }
                step.id = Some(name);
            }
            '.' => {
                i += 1;
                let name = read_selector_name(&chars, &mut i);
                if name.is_empty() {
                    return Err(Error::UnsupportedSelector(token.into()));
                }
                step.classes.push(name);
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|ch| *ch == ']')
                    .map(|offset| i + offset)
                    .ok_or_else(|| Error::UnsupportedSelector(token.into()))?;
                let inner: String = chars[i + 1..close].iter().collect();
                step.attrs.push(parse_attr_condition(&inner, token)?);
                i = close + 1;
            }
            _ => return Err(Error::UnsupportedSelector(token.into())),
        }
    }

    if step.is_empty() {
        return Err(Error::UnsupportedSelector(token.into()));
    }
    Ok(step)
}

fn read_selector_name(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && is_selector_name_char(chars[*i]) {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

fn is_selector_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '-' || ch == '_'
}

fn parse_attr_condition(inner: &str, token: &str) -> Result<SelectorAttrCondition> {
    let inner = inner.trim();
    if inner.is_empty() {
        return Err(Error::UnsupportedSelector(token.into()));
    }
    match inner.split_once('=') {
        None => Ok(SelectorAttrCondition::Exists(inner.to_ascii_lowercase())),
        Some((name, raw_value)) => {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::UnsupportedSelector(token.into()));
            }
            let raw_value = raw_value.trim();
            let value = if raw_value.len() >= 2
                && ((raw_value.starts_with('"') && raw_value.ends_with('"'))
                    || (raw_value.starts_with('\'') && raw_value.ends_with('\'')))
            {
                &raw_value[1..raw_value.len() - 1]
            } else {
                raw_value
            };
            Ok(SelectorAttrCondition::Equals(
                name.to_ascii_lowercase(),
                value.to_string(),
            ))
        }
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

        if starts_with_at(bytes, i, b"<!") {
            // Doctype or other markup declaration.
            let mut j = i + 2;
            while j < bytes.len() && bytes[j] != b'>' {
                j += 1;
            }
            if j >= bytes.len() {
                return Err(Error::HtmlParse("unclosed markup declaration".into()));
            }
            i = j + 1;
            continue;
        }

        if bytes[i] == b'<' {
            if starts_with_at(bytes, i, b"</") {
                let (tag, next) = parse_end_tag(html, i)?;
                i = next;

                let open = stack.iter().skip(1).any(|node| {
                    dom.tag_name(*node)
                        .map(|t| t.eq_ignore_ascii_case(&tag))
                        .unwrap_or(false)
                });
                if !open {
                    // Stray end tag with no matching open element.
                    continue;
                }
                while stack.len() > 1 {
                    let top = *stack
                        .last()
                        .ok_or_else(|| Error::HtmlParse("invalid stack state".into()))?;
                    let top_tag = dom.tag_name(top).unwrap_or("");
                    let matched = top_tag.eq_ignore_ascii_case(&tag);
                    stack.pop();
                    if matched {
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

    dom.initialize_form_control_values();
    Ok(dom)
}

fn parse_start_tag(html: &str, at: usize) -> Result<(String, HashMap<String, String>, bool, usize)> {
    let bytes = html.as_bytes();
    let mut i = at + 1;
    let name_start = i;
    while i < bytes.len() && is_tag_name_byte(bytes[i]) {
        i += 1;
    }
    if i == name_start {
        return Err(Error::HtmlParse(format!("malformed start tag at byte {at}")));
    }
    let tag = html[name_start..i].to_ascii_lowercase();

    let mut attrs: HashMap<String, String> = HashMap::new();
    let mut self_closing = false;

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            return Err(Error::HtmlParse(format!("unclosed <{tag}> start tag")));
        }
        match bytes[i] {
            b'>' => {
                i += 1;
                break;
            }
            b'/' => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'>' {
                    self_closing = true;
                    i += 1;
                    break;
                }
                return Err(Error::HtmlParse(format!("stray '/' in <{tag}> start tag")));
            }
            _ => {
                let attr_start = i;
                while i < bytes.len()
                    && !bytes[i].is_ascii_whitespace()
                    && bytes[i] != b'='
                    && bytes[i] != b'>'
                    && bytes[i] != b'/'
                {
                    i += 1;
                }
                if i == attr_start {
                    return Err(Error::HtmlParse(format!(
                        "malformed attribute in <{tag}> start tag"
                    )));
                }
                let name = html[attr_start..i].to_ascii_lowercase();

                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                let mut value = String::new();
                if i < bytes.len() && bytes[i] == b'=' {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                        i += 1;
                    }
                    if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
                        let quote = bytes[i];
                        i += 1;
                        let value_start = i;
                        while i < bytes.len() && bytes[i] != quote {
                            i += 1;
                        }
                        if i >= bytes.len() {
                            return Err(Error::HtmlParse(format!(
                                "unclosed attribute value in <{tag}> start tag"
                            )));
                        }
                        value = html[value_start..i].to_string();
                        i += 1;
                    } else {
                        let value_start = i;
                        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>'
                        {
                            i += 1;
                        }
                        value = html[value_start..i].to_string();
                    }
                }
                // First occurrence of an attribute wins.
                attrs.entry(name).or_insert(value);
            }
        }
    }

    Ok((tag, attrs, self_closing, i))
}

fn parse_end_tag(html: &str, at: usize) -> Result<(String, usize)> {
    let bytes = html.as_bytes();
    let mut i = at + 2;
    let name_start = i;
    while i < bytes.len() && is_tag_name_byte(bytes[i]) {
        i += 1;
    }
    if i == name_start {
        return Err(Error::HtmlParse(format!("malformed end tag at byte {at}")));
    }
    let tag = html[name_start..i].to_ascii_lowercase();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'>' {
        return Err(Error::HtmlParse(format!("unclosed </{tag}> end tag")));
    }
    Ok((tag, i + 1))
}

fn is_tag_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-'
}

fn is_void_tag(tag: &str) -> bool {
    matches!(
        tag,
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
    // Script bodies are kept as inert text; nothing in this runtime executes them.
    matches!(tag, "script" | "style")
}

fn starts_with_at(bytes: &[u8], at: usize, needle: &[u8]) -> bool {
    if at + needle.len() > bytes.len() {
        return false;
    }
    &bytes[at..at + needle.len()] == needle
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || from > bytes.len() {
        return None;
    }
    let mut i = from;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn find_case_insensitive_end_tag(bytes: &[u8], from: usize, tag: &[u8]) -> Option<usize> {
    let mut i = from;
    while i + 2 + tag.len() <= bytes.len() {
        if bytes[i] == b'<' && bytes[i + 1] == b'/' {
            let candidate = &bytes[i + 2..i + 2 + tag.len()];
            if candidate.eq_ignore_ascii_case(tag) {
                let after = i + 2 + tag.len();
                if after >= bytes.len() || bytes[after] == b'>' || bytes[after].is_ascii_whitespace()
                {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn control_is_valid(dom: &Dom, control: NodeId) -> bool {
    let Some(element) = dom.element(control) else {
        return true;
    };
    // Disabled and readonly controls are barred from constraint validation.
    if element.disabled || element.readonly {
        return true;
    }
    match element.tag_name.as_str() {
        "input" => {
            let kind = input_kind(element);
            match kind.as_str() {
                "hidden" | "button" | "submit" | "reset" | "image" => true,
                "checkbox" => !element.required || element.checked,
                "radio" => !element.required || radio_group_has_checked(dom, control),
                _ => text_control_is_valid(element, &kind),
            }
        }
        "textarea" => text_control_is_valid(element, "textarea"),
        "select" => !element.required || !element.value.is_empty(),
        _ => true,
    }
}

fn form_is_valid(dom: &Dom, form: NodeId) -> bool {
    let mut controls = Vec::new();
    dom.collect_elements_dfs(form, &mut controls);
    controls.into_iter().all(|control| {
        match dom.tag_name(control) {
            Some("input") | Some("textarea") | Some("select") => control_is_valid(dom, control),
            _ => true,
        }
    })
}

fn input_kind(element: &Element) -> String {
    element
        .attrs
        .get("type")
        .map(|kind| kind.to_ascii_lowercase())
        .unwrap_or_else(|| "text".to_string())
}

fn text_control_is_valid(element: &Element, kind: &str) -> bool {
    let value = element.value.as_str();
    if element.required && value.is_empty() {
        return false;
    }
    if value.is_empty() {
        return true;
    }

    let length = value.chars().count();
    if let Some(min) = attr_usize(element, "minlength") {
        if length < min {
            return false;
        }
    }
    if let Some(max) = attr_usize(element, "maxlength") {
        if length > max {
            return false;
        }
    }
    if kind != "textarea" {
        if let Some(pattern) = element.attrs.get("pattern") {
            if !pattern_allows(pattern, value) {
                return false;
            }
        }
    }
    match kind {
        "email" => looks_like_email(value),
        "number" => number_in_range(element, value),
        _ => true,
    }
}

fn attr_usize(element: &Element, name: &str) -> Option<usize> {
    element
        .attrs
        .get(name)
        .and_then(|raw| raw.trim().parse::<usize>().ok())
}

fn attr_f64(element: &Element, name: &str) -> Option<f64> {
    element
        .attrs
        .get(name)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
}

fn pattern_allows(pattern: &str, value: &str) -> bool {
    // A pattern that fails to compile is ignored rather than failing the
    // control, matching browser handling of the pattern attribute.
    let anchored = format!("^(?:{pattern})$");
    match fancy_regex::Regex::new(&anchored) {
        Ok(regex) => regex.is_match(value).unwrap_or(true),
        Err(_) => true,
    }
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if local.chars().any(char::is_whitespace) || domain.chars().any(char::is_whitespace) {
        return false;
    }
    if domain.contains('@') || domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }
    true
}

fn number_in_range(element: &Element, value: &str) -> bool {
    let Ok(number) = value.trim().parse::<f64>() else {
        return false;
    };
    if let Some(min) = attr_f64(element, "min") {
        if number < min {
            return false;
        }
    }
    if let Some(max) = attr_f64(element, "max") {
        if number > max {
            return false;
        }
    }
    true
}

fn radio_group_has_checked(dom: &Dom, control: NodeId) -> bool {
    let Some(name) = dom.attr(control, "name") else {
        return dom.checked(control);
    };
    let scope = dom.find_ancestor_by_tag(control, "form").unwrap_or(dom.root);
    let mut members = Vec::new();
    dom.collect_elements_dfs(scope, &mut members);
    members.into_iter().any(|member| {
        dom.tag_name(member) == Some("input")
            && dom
                .element(member)
                .map(|element| input_kind(element) == "radio")
                .unwrap_or(false)
            && dom.attr(member, "name").as_deref() == Some(name.as_str())
            && dom.checked(member)
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerAction {
    BlockInvalidSubmit,
    PreventDefault,
    StopPropagation,
    StopImmediatePropagation,
    AddClass(String),
    RemoveClass(String),
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Listener {
    capture: bool,
    action: HandlerAction,
}

#[derive(Debug, Default, Clone)]
struct ListenerStore {
    map: HashMap<NodeId, HashMap<String, Vec<Listener>>>,
}

impl ListenerStore {
    fn add(&mut self, node_id: NodeId, event: String, listener: Listener) {
        self.map
            .entry(node_id)
            .or_default()
            .entry(event)
            .or_default()
            .push(listener);
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

    fn count(&self, node_id: NodeId, event: &str) -> usize {
        self.map
            .get(&node_id)
            .and_then(|events| events.get(event))
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct EventState {
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
}

#[derive(Debug, Clone)]
enum TimerAction {
    Hide(NodeId),
    Dispatch(NodeId, String),
}

#[derive(Debug, Clone)]
struct ScheduledTask {
    id: i64,
    due_at: i64,
    order: i64,
    action: TimerAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub id: i64,
    pub due_at: i64,
    pub order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub action: String,
    pub method: String,
    pub entries: Vec<(String, String)>,
}

pub struct Page {
    dom: Dom,
    listeners: ListenerStore,
    task_queue: Vec<ScheduledTask>,
    submissions: Vec<Submission>,
    console: Vec<String>,
    now_ms: i64,
    next_timer_id: i64,
    next_task_order: i64,
    ready_fired: bool,
    trace: bool,
    trace_events: bool,
    trace_timers: bool,
    trace_logs: Vec<String>,
    trace_log_limit: usize,
    trace_to_stderr: bool,
}

impl Page {
    pub fn from_html(html: &str) -> Result<Self> {
        let mut page = Self::from_html_loading(html)?;
        page.fire_ready()?;
        Ok(page)
    }

    pub fn from_html_loading(html: &str) -> Result<Self> {
        let dom = parse_html(html)?;
        let mut page = Self {
            dom,
            listeners: ListenerStore::default(),
            task_queue: Vec::new(),
            submissions: Vec::new(),
            console: Vec::new(),
            now_ms: 0,
            next_timer_id: 1,
            next_task_order: 0,
            ready_fired: false,
            trace: false,
            trace_events: true,
            trace_timers: true,
            trace_logs: Vec::new(),
            trace_log_limit: 10_000,
            trace_to_stderr: true,
        };
        page.boot()?;
        Ok(page)
    }

    // Module-load wiring: the diagnostic console line and the submit guards.
    // Runs before the page-ready signal, so guards are live on a loading page.
    fn boot(&mut self) -> Result<()> {
        self.console.push(BOOT_CONSOLE_LINE.to_string());
        let guarded = self.dom.query_selector_all(GUARD_SELECTOR)?;
        for form in guarded {
            self.listeners.add(
                form,
                "submit".to_string(),
                Listener {
                    capture: false,
                    action: HandlerAction::BlockInvalidSubmit,
                },
            );
        }
        Ok(())
    }

    pub fn fire_ready(&mut self) -> Result<()> {
        if self.ready_fired {
            return Err(Error::Runtime("page-ready signal already fired".into()));
        }
        self.ready_fired = true;
        let alerts = self.dom.query_selector_all(ALERT_SELECTOR)?;
        for alert in alerts {
            self.schedule_task(ALERT_DISMISS_MS, TimerAction::Hide(alert));
        }
        Ok(())
    }

    pub fn enable_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    pub fn take_trace_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.trace_logs)
    }

    pub fn set_trace_stderr(&mut self, enabled: bool) {
        self.trace_to_stderr = enabled;
    }

    pub fn set_trace_events(&mut self, enabled: bool) {
        self.trace_events = enabled;
    }

    pub fn set_trace_timers(&mut self, enabled: bool) {
        self.trace_timers = enabled;
    }

    pub fn set_trace_log_limit(&mut self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::Runtime(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        self.trace_log_limit = max_entries;
        while self.trace_logs.len() > self.trace_log_limit {
            self.trace_logs.remove(0);
        }
        Ok(())
    }

    pub fn console_lines(&self) -> &[String] {
        &self.console
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn type_text(&mut self, selector: &str, text: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }
        if self.dom.readonly(target) {
            return Ok(());
        }

        let tag = self
            .dom
            .tag_name(target)
            .ok_or_else(|| Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input or textarea".into(),
                actual: "non-element".into(),
            })?
            .to_ascii_lowercase();

        if tag != "input" && tag != "textarea" {
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input or textarea".into(),
                actual: tag,
            });
        }

        self.dom.set_value(target, text)?;
        self.dispatch_event(target, "input")?;
        Ok(())
    }

    pub fn set_checked(&mut self, selector: &str, checked: bool) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }
        let kind = self
            .dom
            .element(target)
            .filter(|element| element.tag_name == "input")
            .map(input_kind)
            .unwrap_or_default();
        if kind != "checkbox" && kind != "radio" {
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "checkbox or radio input".into(),
                actual: self
                    .dom
                    .tag_name(target)
                    .unwrap_or("non-element")
                    .to_string(),
            });
        }
        if self.dom.checked(target) == checked {
            return Ok(());
        }
        if kind == "radio" && checked {
            self.uncheck_other_radios_in_group(target)?;
        }
        self.dom.set_checked(target, checked)?;
        self.dispatch_event(target, "input")?;
        self.dispatch_event(target, "change")?;
        Ok(())
    }

    pub fn select_option(&mut self, selector: &str, value: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }
        if self.dom.tag_name(target) != Some("select") {
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "select".into(),
                actual: self
                    .dom
                    .tag_name(target)
                    .unwrap_or("non-element")
                    .to_string(),
            });
        }

        let mut descendants = Vec::new();
        self.dom.collect_elements_dfs(target, &mut descendants);
        let matched = descendants.into_iter().any(|id| {
            self.dom.tag_name(id) == Some("option") && self.dom.option_value(id) == value
        });
        if !matched {
            return Err(Error::Runtime(format!(
                "select {selector} has no option with value {value:?}"
            )));
        }

        if self.dom.value(target)? == value {
            return Ok(());
        }
        self.dom.set_value(target, value)?;
        self.dispatch_event(target, "input")?;
        self.dispatch_event(target, "change")?;
        Ok(())
    }

    pub fn click(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }

        let click_outcome = self.dispatch_event(target, "click")?;
        if click_outcome.default_prevented {
            return Ok(());
        }

        if is_checkbox_input(&self.dom, target) {
            let current = self.dom.checked(target);
            self.dom.set_checked(target, !current)?;
            self.dispatch_event(target, "input")?;
            self.dispatch_event(target, "change")?;
        }

        if is_radio_input(&self.dom, target) && !self.dom.checked(target) {
            self.uncheck_other_radios_in_group(target)?;
            self.dom.set_checked(target, true)?;
            self.dispatch_event(target, "input")?;
            self.dispatch_event(target, "change")?;
        }

        if is_submit_control(&self.dom, target) {
            if let Some(form) = self.dom.find_ancestor_by_tag(target, "form") {
                self.submit_form(form)?;
            }
        }

        Ok(())
    }

    pub fn submit(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;

        let form = if self.dom.tag_name(target) == Some("form") {
            Some(target)
        } else {
            self.dom.find_ancestor_by_tag(target, "form")
        };

        if let Some(form) = form {
            self.submit_form(form)?;
        }
        Ok(())
    }

    pub fn dispatch(&mut self, selector: &str, event: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.dispatch_event(target, event)?;
        Ok(())
    }

    pub fn add_listener(&mut self, selector: &str, event: &str, action: HandlerAction) -> Result<()> {
        self.add_listener_inner(selector, event, action, false)
    }

    pub fn add_capture_listener(
        &mut self,
        selector: &str,
        event: &str,
        action: HandlerAction,
    ) -> Result<()> {
        self.add_listener_inner(selector, event, action, true)
    }

    fn add_listener_inner(
        &mut self,
        selector: &str,
        event: &str,
        action: HandlerAction,
        capture: bool,
    ) -> Result<()> {
        let target = self.select_one(selector)?;
        self.listeners
            .add(target, event.to_string(), Listener { capture, action });
        Ok(())
    }

    pub fn listener_count(&self, selector: &str, event: &str) -> Result<usize> {
        let target = self.select_one(selector)?;
        Ok(self.listeners.count(target, event))
    }

    pub fn check_validity(&self, selector: &str) -> Result<bool> {
        let target = self.select_one(selector)?;
        match self.dom.tag_name(target) {
            Some("form") => Ok(form_is_valid(&self.dom, target)),
            Some("input") | Some("textarea") | Some("select") => {
                Ok(control_is_valid(&self.dom, target))
            }
            other => Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "form or form control".into(),
                actual: other.unwrap_or("non-element").to_string(),
            }),
        }
    }

    pub fn visible(&self, selector: &str) -> Result<bool> {
        let target = self.select_one(selector)?;
        Ok(self.dom.style_get(target, "display")? != "none")
    }

    pub fn value(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        self.dom.value(target)
    }

    pub fn text(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        Ok(self.dom.text_content(target))
    }

    pub fn remove_element(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.dom.remove_subtree(target)
    }

    pub fn schedule_hide(&mut self, selector: &str, delay_ms: i64) -> Result<i64> {
        let target = self.select_one(selector)?;
        Ok(self.schedule_task(delay_ms, TimerAction::Hide(target)))
    }

    pub fn schedule_dispatch(&mut self, selector: &str, event: &str, delay_ms: i64) -> Result<i64> {
        let target = self.select_one(selector)?;
        Ok(self.schedule_task(delay_ms, TimerAction::Dispatch(target, event.to_string())))
    }

    pub fn assert_exists(&self, selector: &str) -> Result<()> {
        let _ = self.select_one(selector)?;
        Ok(())
    }

    pub fn count(&self, selector: &str) -> Result<usize> {
        Ok(self.dom.query_selector_all(selector)?.len())
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

    pub fn assert_value(&self, selector: &str, expected: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        let actual = self.dom.value(target)?;
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

    pub fn assert_visible(&self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        let display = self.dom.style_get(target, "display")?;
        if display == "none" {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: "visible element".into(),
                actual: "display: none".into(),
                dom_snippet: self.node_snippet(target),
            });
        }
        Ok(())
    }

    pub fn assert_hidden(&self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        let display = self.dom.style_get(target, "display")?;
        if display != "none" {
            let actual = if display.is_empty() {
                "default display".to_string()
            } else {
                format!("display: {display}")
            };
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: "display: none".into(),
                actual,
                dom_snippet: self.node_snippet(target),
            });
        }
        Ok(())
    }

    pub fn dump_dom(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        Ok(self.dom.dump_node(target))
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn pending_timers(&self) -> Vec<PendingTimer> {
        let mut timers = self
            .task_queue
            .iter()
            .map(|task| PendingTimer {
                id: task.id,
                due_at: task.due_at,
                order: task.order,
            })
            .collect::<Vec<_>>();
        timers.sort_by_key(|timer| (timer.due_at, timer.order));
        timers
    }

    pub fn clear_timer(&mut self, timer_id: i64) -> bool {
        let before = self.task_queue.len();
        self.task_queue.retain(|task| task.id != timer_id);
        let removed = before.saturating_sub(self.task_queue.len());
        self.trace_timer_line(format!("[timer] clear id={timer_id} removed={removed}"));
        removed > 0
    }

    pub fn clear_all_timers(&mut self) -> usize {
        let cleared = self.task_queue.len();
        self.task_queue.clear();
        self.trace_timer_line(format!("[timer] clear_all cleared={cleared}"));
        cleared
    }

    pub fn advance_time(&mut self, delta_ms: i64) -> Result<()> {
        if delta_ms < 0 {
            return Err(Error::Runtime(
                "advance_time requires non-negative milliseconds".into(),
            ));
        }
        let from = self.now_ms;
        self.now_ms = self.now_ms.saturating_add(delta_ms);
        let ran = self.run_timer_queue(Some(self.now_ms), false)?;
        self.trace_timer_line(format!(
            "[timer] advance delta_ms={} from={} to={} ran_due={}",
            delta_ms, from, self.now_ms, ran
        ));
        Ok(())
    }

    pub fn advance_time_to(&mut self, target_ms: i64) -> Result<()> {
        if target_ms < self.now_ms {
            return Err(Error::Runtime(format!(
                "advance_time_to requires target >= now_ms (target={target_ms}, now_ms={})",
                self.now_ms
            )));
        }
        let from = self.now_ms;
        self.now_ms = target_ms;
        let ran = self.run_timer_queue(Some(self.now_ms), false)?;
        self.trace_timer_line(format!(
            "[timer] advance_to from={} to={} ran_due={}",
            from, self.now_ms, ran
        ));
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let from = self.now_ms;
        let ran = self.run_timer_queue(None, true)?;
        self.trace_timer_line(format!(
            "[timer] flush from={} to={} ran={}",
            from, self.now_ms, ran
        ));
        Ok(())
    }

    pub fn run_next_timer(&mut self) -> Result<bool> {
        let Some(next_idx) = self.next_task_index(None) else {
            self.trace_timer_line("[timer] run_next none".into());
            return Ok(false);
        };

        let task = self.task_queue.remove(next_idx);
        if task.due_at > self.now_ms {
            self.now_ms = task.due_at;
        }
        self.execute_timer_task(task)?;
        Ok(true)
    }

    pub fn run_due_timers(&mut self) -> Result<usize> {
        let ran = self.run_timer_queue(Some(self.now_ms), false)?;
        self.trace_timer_line(format!(
            "[timer] run_due now_ms={} ran={}",
            self.now_ms, ran
        ));
        Ok(ran)
    }

    fn run_timer_queue(&mut self, due_limit: Option<i64>, advance_clock: bool) -> Result<usize> {
        let mut steps = 0usize;
        while let Some(next_idx) = self.next_task_index(due_limit) {
            steps += 1;
            let task = self.task_queue.remove(next_idx);
            if advance_clock && task.due_at > self.now_ms {
                self.now_ms = task.due_at;
            }
            self.execute_timer_task(task)?;
        }
        Ok(steps)
    }

    fn next_task_index(&self, due_limit: Option<i64>) -> Option<usize> {
        self.task_queue
            .iter()
            .enumerate()
            .filter(|(_, task)| due_limit.map(|limit| task.due_at <= limit).unwrap_or(true))
            .min_by_key(|(_, task)| (task.due_at, task.order))
            .map(|(idx, _)| idx)
    }

    fn schedule_task(&mut self, delay_ms: i64, action: TimerAction) -> i64 {
        let delay_ms = delay_ms.max(0);
        let due_at = self.now_ms + delay_ms;
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let order = self.next_task_order;
        self.next_task_order += 1;
        let label = self.timer_action_label(&action);
        self.task_queue.push(ScheduledTask {
            id,
            due_at,
            order,
            action,
        });
        self.trace_timer_line(format!(
            "[timer] schedule id={id} due_at={due_at} action={label}"
        ));
        id
    }

    fn execute_timer_task(&mut self, task: ScheduledTask) -> Result<()> {
        let label = self.timer_action_label(&task.action);
        self.trace_timer_line(format!(
            "[timer] run id={} due_at={} now_ms={} action={}",
            task.id, task.due_at, self.now_ms, label
        ));

        match task.action {
            TimerAction::Hide(node) => {
                // A timer may outlive its element; firing then is a no-op.
                if !self.dom.in_document(node) {
                    self.trace_timer_line(format!("[timer] skip id={} reason=detached", task.id));
                    return Ok(());
                }
                self.dom.style_set(node, "display", "none")?;
            }
            TimerAction::Dispatch(node, event_type) => {
                if !self.dom.in_document(node) {
                    self.trace_timer_line(format!("[timer] skip id={} reason=detached", task.id));
                    return Ok(());
                }
                self.dispatch_event(node, &event_type)?;
            }
        }
        Ok(())
    }

    fn timer_action_label(&self, action: &TimerAction) -> String {
        match action {
            TimerAction::Hide(node) => format!("hide {}", self.node_label(*node)),
            TimerAction::Dispatch(node, event_type) => {
                format!("dispatch {} {}", event_type, self.node_label(*node))
            }
        }
    }

    fn submit_form(&mut self, form: NodeId) -> Result<()> {
        let outcome = self.dispatch_event(form, "submit")?;
        if outcome.default_prevented {
            return Ok(());
        }

        let submission = Submission {
            action: self.dom.attr(form, "action").unwrap_or_default(),
            method: self
                .dom
                .attr(form, "method")
                .map(|method| method.to_ascii_lowercase())
                .unwrap_or_else(|| "get".to_string()),
            entries: self.form_data_entries(form),
        };
        let label = self.node_label(form);
        self.trace_event_line(format!(
            "[event] submit accepted target={label} entries={}",
            submission.entries.len()
        ));
        self.submissions.push(submission);
        Ok(())
    }

    fn form_data_entries(&self, form: NodeId) -> Vec<(String, String)> {
        let mut controls = Vec::new();
        self.dom.collect_elements_dfs(form, &mut controls);

        let mut entries = Vec::new();
        for control in controls {
            let Some(element) = self.dom.element(control) else {
                continue;
            };
            if element.disabled {
                continue;
            }
            let name = element.attrs.get("name").cloned().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            match element.tag_name.as_str() {
                "textarea" | "select" => entries.push((name, element.value.clone())),
                "input" => {
                    let kind = input_kind(element);
                    match kind.as_str() {
                        "button" | "submit" | "reset" | "file" | "image" => {}
                        "checkbox" | "radio" => {
                            if element.checked {
                                let value = if element.value.is_empty() {
                                    "on".to_string()
                                } else {
                                    element.value.clone()
                                };
                                entries.push((name, value));
                            }
                        }
                        _ => entries.push((name, element.value.clone())),
                    }
                }
                _ => {}
            }
        }
        entries
    }

    fn uncheck_other_radios_in_group(&mut self, radio: NodeId) -> Result<()> {
        let Some(name) = self.dom.attr(radio, "name") else {
            return Ok(());
        };
        let scope = self
            .dom
            .find_ancestor_by_tag(radio, "form")
            .unwrap_or(self.dom.root);
        let mut members = Vec::new();
        self.dom.collect_elements_dfs(scope, &mut members);
        for member in members {
            if member != radio
                && is_radio_input(&self.dom, member)
                && self.dom.attr(member, "name").as_deref() == Some(name.as_str())
            {
                self.dom.set_checked(member, false)?;
            }
        }
        Ok(())
    }

    fn dispatch_event(&mut self, target: NodeId, event_type: &str) -> Result<EventState> {
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
                self.invoke_listeners(*node, &mut event, true)?;
                if event.propagation_stopped {
                    self.trace_event_done(&event, "propagation_stopped");
                    return Ok(event);
                }
            }
        }

        // Target phase: capture listeners first.
        event.current_target = target;
        self.invoke_listeners(target, &mut event, true)?;
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return Ok(event);
        }

        // Target phase: bubble listeners.
        self.invoke_listeners(target, &mut event, false)?;
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return Ok(event);
        }

        // Bubble phase.
        if path.len() >= 2 {
            for node in path[..path.len() - 1].iter().rev() {
                event.current_target = *node;
                self.invoke_listeners(*node, &mut event, false)?;
                if event.propagation_stopped {
                    self.trace_event_done(&event, "propagation_stopped");
                    return Ok(event);
                }
            }
        }

        self.trace_event_done(&event, "completed");
        Ok(event)
    }

    fn invoke_listeners(
        &mut self,
        node_id: NodeId,
        event: &mut EventState,
        capture: bool,
    ) -> Result<()> {
        let listeners = self.listeners.get(node_id, &event.event_type, capture);
        for listener in listeners {
            if self.trace {
                let phase = if capture { "capture" } else { "bubble" };
                let target_label = self.node_label(event.target);
                let current_label = self.node_label(event.current_target);
                self.trace_event_line(format!(
                    "[event] {} target={} current={} phase={} default_prevented={}",
                    event.event_type, target_label, current_label, phase, event.default_prevented
                ));
            }
            self.run_action(listener.action, event)?;
            if event.immediate_propagation_stopped {
                break;
            }
        }
        Ok(())
    }

    fn run_action(&mut self, action: HandlerAction, event: &mut EventState) -> Result<()> {
        match action {
            HandlerAction::PreventDefault => event.default_prevented = true,
            HandlerAction::StopPropagation => event.propagation_stopped = true,
            HandlerAction::StopImmediatePropagation => {
                event.propagation_stopped = true;
                event.immediate_propagation_stopped = true;
            }
            HandlerAction::AddClass(name) => self.dom.class_add(event.current_target, &name)?,
            HandlerAction::RemoveClass(name) => {
                self.dom.class_remove(event.current_target, &name)?
            }
            HandlerAction::Log(line) => self.console.push(line),
            HandlerAction::BlockInvalidSubmit => {
                if event.event_type == "submit" && !form_is_valid(&self.dom, event.current_target) {
                    event.default_prevented = true;
                    let label = self.node_label(event.current_target);
                    self.trace_event_line(format!(
                        "[event] submit blocked target={label} reason=invalid"
                    ));
                }
            }
        }
        Ok(())
    }

    fn trace_event_done(&mut self, event: &EventState, outcome: &str) {
        let target_label = self.node_label(event.target);
        let current_label = self.node_label(event.current_target);
        self.trace_event_line(format!(
            "[event] done {} target={} current={} outcome={} default_prevented={} propagation_stopped={}",
            event.event_type,
            target_label,
            current_label,
            outcome,
            event.default_prevented,
            event.propagation_stopped
        ));
    }

    fn trace_event_line(&mut self, line: String) {
        if self.trace && self.trace_events {
            self.trace_line(line);
        }
    }

    fn trace_timer_line(&mut self, line: String) {
        if self.trace && self.trace_timers {
            self.trace_line(line);
        }
    }

    fn trace_line(&mut self, line: String) {
        if self.trace {
            if self.trace_to_stderr {
                eprintln!("{line}");
            }
            if self.trace_logs.len() >= self.trace_log_limit {
                self.trace_logs.remove(0);
            }
            self.trace_logs.push(line);
        }
    }

    fn node_label(&self, node_id: NodeId) -> String {
        let Some(element) = self.dom.element(node_id) else {
            return "#document".to_string();
        };
        let mut label = element.tag_name.clone();
        if let Some(id) = element.attrs.get("id") {
            label.push('#');
            label.push_str(id);
        }
        for class in class_tokens(element.attrs.get("class").map(String::as_str)) {
            label.push('.');
            label.push_str(&class);
        }
        label
    }

    fn node_snippet(&self, node_id: NodeId) -> String {
        truncate_chars(&self.dom.dump_node(node_id), 200)
    }

    fn select_one(&self, selector: &str) -> Result<NodeId> {
        self.dom
            .query_selector(selector)?
            .ok_or_else(|| Error::SelectorNotFound(selector.to_string()))
    }
}

fn is_checkbox_input(dom: &Dom, node_id: NodeId) -> bool {
    dom.element(node_id)
        .map(|element| element.tag_name == "input" && input_kind(element) == "checkbox")
        .unwrap_or(false)
}

fn is_radio_input(dom: &Dom, node_id: NodeId) -> bool {
    dom.element(node_id)
        .map(|element| element.tag_name == "input" && input_kind(element) == "radio")
        .unwrap_or(false)
}

fn is_submit_control(dom: &Dom, node_id: NodeId) -> bool {
    let Some(element) = dom.element(node_id) else {
        return false;
    };
    match element.tag_name.as_str() {
        "button" => element
            .attrs
            .get("type")
            .map(|kind| kind.eq_ignore_ascii_case("submit"))
            .unwrap_or(true),
        "input" => {
            let kind = input_kind(element);
            kind == "submit" || kind == "image"
        }
        _ => false,
    }
}
