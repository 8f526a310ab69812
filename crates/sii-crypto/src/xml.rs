//! # Minimal XML Tree
//!
//! Just enough of a document model to canonicalize, sign and inspect the
//! authority's payloads: elements, attributes in document order, and text.
//! Comments and processing instructions are dropped on parse. Documents
//! carrying a `DOCTYPE` are refused so no entity is ever resolved beyond the
//! five predefined ones and character references.
//!
//! Input may be UTF-8 or ISO-8859-1 (the authority's default encoding).

use std::borrow::Cow;

use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::CryptoError;

/// Prefix-to-URI bindings in scope, innermost last.
pub type NamespaceBindings = Vec<(String, String)>;

/// A parsed XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    root: Element,
}

/// Element attribute in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Qualified name (`prefix:local` or `local`).
    pub name: String,
    /// Unescaped value.
    pub value: String,
}

/// Child of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Nested element.
    Element(Element),
    /// Character data, unescaped.
    Text(String),
}

/// An XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<Attribute>,
    children: Vec<Node>,
}

/// Output encoding for [`XmlDocument::to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XmlEncoding {
    /// UTF-8.
    #[default]
    Utf8,
    /// ISO-8859-1; characters above U+00FF become character references.
    Latin1,
}

impl XmlEncoding {
    fn label(&self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Latin1 => "ISO-8859-1",
        }
    }
}

/// Decode raw bytes as UTF-8, falling back to ISO-8859-1.
pub fn decode(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

impl XmlDocument {
    /// Parse a document from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, CryptoError> {
        Self::parse_str(&decode(bytes))
    }

    /// Parse a document from text.
    pub fn parse_str(text: &str) -> Result<Self, CryptoError> {
        let text = normalize_line_endings(text);
        let mut reader = Reader::from_str(&text);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                CryptoError::xml(format!("at byte {}: {e}", reader.buffer_position()))
            })?;
            match event {
                Event::Start(start) => {
                    if root.is_some() && stack.is_empty() {
                        return Err(CryptoError::xml("content after the root element"));
                    }
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    if root.is_some() && stack.is_empty() {
                        return Err(CryptoError::xml("content after the root element"));
                    }
                    let element = element_from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => root = Some(element),
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| CryptoError::xml("unbalanced end tag"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => root = Some(element),
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(CryptoError::xml)?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_text(&text),
                        None if text.trim().is_empty() => {}
                        None => return Err(CryptoError::xml("text outside the root element")),
                    }
                }
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())
                        .map_err(CryptoError::xml)?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_text(&text),
                        None => return Err(CryptoError::xml("CDATA outside the root element")),
                    }
                }
                Event::DocType(_) => {
                    return Err(CryptoError::xml("DOCTYPE declarations are not accepted"));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(CryptoError::xml("unexpected end of document"));
        }
        root.map(|root| Self { root }).ok_or(CryptoError::NoRoot)
    }

    /// Wrap an element as a document.
    pub fn new(root: Element) -> Self {
        Self { root }
    }

    /// The root element.
    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Mutable root element.
    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    /// Consume the document, returning its root.
    pub fn into_root(self) -> Element {
        self.root
    }

    /// Serialize with an XML declaration.
    pub fn to_bytes(&self, encoding: XmlEncoding) -> Vec<u8> {
        let mut out = format!("<?xml version=\"1.0\" encoding=\"{}\"?>\n", encoding.label());
        self.root.write(&mut out);
        match encoding {
            XmlEncoding::Utf8 => out.into_bytes(),
            XmlEncoding::Latin1 => encode_latin1(&out),
        }
    }

    /// Serialize as UTF-8 text with an XML declaration.
    pub fn to_xml_string(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        self.root.write(&mut out);
        out
    }
}

/// Encode text as ISO-8859-1, writing characters above U+00FF as character references.
pub fn encode_latin1(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match u8::try_from(u32::from(c)) {
            Ok(byte) => out.push(byte),
            Err(_) => out.extend_from_slice(format!("&#{};", u32::from(c)).as_bytes()),
        }
    }
    out
}

/// End-of-line handling: `\r\n` and lone `\r` become `\n`.
fn normalize_line_endings(text: &str) -> Cow<'_, str> {
    if !text.contains('\r') {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
}

/// Attribute-value normalization for CDATA attributes: literal tab and
/// newline become spaces. Character references are expanded afterwards and
/// keep their characters.
fn normalize_attr_whitespace(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\t', '\n', '\r']) {
        return Cow::Borrowed(raw);
    }
    Cow::Owned(raw.replace(['\t', '\n', '\r'], " "))
}

fn element_from_start(start: &quick_xml::events::BytesStart<'_>) -> Result<Element, CryptoError> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(CryptoError::xml)?
        .to_string();
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(CryptoError::xml)?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(CryptoError::xml)?
            .to_string();
        let raw = std::str::from_utf8(&attr.value).map_err(CryptoError::xml)?;
        let value = unescape(&normalize_attr_whitespace(raw))
            .map_err(CryptoError::xml)?
            .into_owned();
        if element.attr(&key).is_some() {
            return Err(CryptoError::xml(format!("duplicate attribute {key}")));
        }
        element.attributes.push(Attribute {
            name: key,
            value,
        });
    }
    Ok(element)
}

/// Part of a qualified name after the colon.
pub fn local_name(qualified: &str) -> &str {
    qualified.rsplit_once(':').map_or(qualified, |(_, local)| local)
}

/// Part of a qualified name before the colon, `""` when unprefixed.
pub fn prefix(qualified: &str) -> &str {
    qualified.split_once(':').map_or("", |(prefix, _)| prefix)
}

impl Element {
    /// Empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: add an attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder: add a child element.
    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    /// Builder: add a text node.
    pub fn with_text(mut self, text: impl AsRef<str>) -> Self {
        self.push_text(text.as_ref());
        self
    }

    /// Builder: add `<name>text</name>`.
    pub fn with_text_child(self, name: impl Into<String>, text: impl AsRef<str>) -> Self {
        self.with_child(Element::new(name).with_text(text))
    }

    /// Qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without prefix.
    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }

    /// Attributes in document order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Attribute value by qualified name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Set or replace an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute { name, value }),
        }
    }

    /// The `ID`/`Id`/`id` attribute, in that order of preference.
    pub fn id(&self) -> Option<&str> {
        self.attr("ID").or_else(|| self.attr("Id")).or_else(|| self.attr("id"))
    }

    /// All child nodes.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Child elements only.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Mutable child elements.
    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Append a child element.
    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Append text, merging with a preceding text node.
    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_string()));
        }
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![Node::Text(text.into())];
    }

    /// Remove child elements matching `pred`. Returns how many were removed.
    pub fn remove_elements(&mut self, pred: impl Fn(&Element) -> bool) -> usize {
        let before = self.children.len();
        self.children
            .retain(|node| !matches!(node, Node::Element(e) if pred(e)));
        before - self.children.len()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// First child element with this local name.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local)
    }

    /// Mutable first child element with this local name.
    pub fn child_mut(&mut self, local: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.local_name() == local)
    }

    /// Follow a path of local names through child elements.
    pub fn path(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |current, local| current.child(local))
    }

    /// Trimmed text of the element at `path`, `None` when absent or empty.
    pub fn path_text(&self, path: &[&str]) -> Option<String> {
        self.path(path)
            .map(|e| e.text().trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Trimmed text of the first child with this local name.
    pub fn child_text(&self, local: &str) -> Option<String> {
        self.path_text(&[local])
    }

    /// First descendant (depth-first, self included) with this local name.
    pub fn descendant(&self, local: &str) -> Option<&Element> {
        if self.local_name() == local {
            return Some(self);
        }
        self.elements().find_map(|e| e.descendant(local))
    }

    /// Every descendant (self included) with this local name, in document order.
    pub fn descendants<'a>(&'a self, local: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect_descendants(local, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, local: &str, found: &mut Vec<&'a Element>) {
        if self.local_name() == local {
            found.push(self);
        }
        for child in self.elements() {
            child.collect_descendants(local, found);
        }
    }

    /// Namespace declarations made on this element, `""` for the default one.
    pub fn namespace_declarations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|a| {
            if a.name == "xmlns" {
                Some(("", a.value.as_str()))
            } else {
                a.name
                    .strip_prefix("xmlns:")
                    .map(|prefix| (prefix, a.value.as_str()))
            }
        })
    }

    /// Locate the first element (self included) matching `pred`, together
    /// with the namespace bindings inherited from its ancestors.
    pub fn locate(&self, pred: &dyn Fn(&Element) -> bool) -> Option<(&Element, NamespaceBindings)> {
        let mut inherited = NamespaceBindings::new();
        self.locate_inner(pred, &mut inherited)
    }

    fn locate_inner<'a>(
        &'a self,
        pred: &dyn Fn(&Element) -> bool,
        inherited: &mut NamespaceBindings,
    ) -> Option<(&'a Element, NamespaceBindings)> {
        if pred(self) {
            return Some((self, inherited.clone()));
        }
        let mark = inherited.len();
        inherited.extend(
            self.namespace_declarations()
                .map(|(p, u)| (p.to_string(), u.to_string())),
        );
        let found = self.elements().find_map(|e| e.locate_inner(pred, inherited));
        inherited.truncate(mark);
        found
    }

    /// Element carrying `id`, with its inherited namespace bindings.
    pub fn find_by_id(&self, id: &str) -> Option<(&Element, NamespaceBindings)> {
        self.locate(&|e: &Element| e.id() == Some(id))
    }

    /// Copy without whitespace-only text nodes, as signed by the authority.
    pub fn without_whitespace(&self) -> Element {
        Element {
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            children: self
                .children
                .iter()
                .filter_map(|node| match node {
                    Node::Element(e) => Some(Node::Element(e.without_whitespace())),
                    Node::Text(t) if t.trim().is_empty() => None,
                    Node::Text(t) => Some(Node::Text(t.clone())),
                })
                .collect(),
        }
    }

    /// Compact serialization (no declaration, no added whitespace).
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for attr in &self.attributes {
            out.push(' ');
            out.push_str(&attr.name);
            out.push_str("=\"");
            escape_attr_into(&attr.value, out);
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write(out),
                Node::Text(t) => escape_text_into(t, out),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

pub(crate) fn escape_text_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

pub(crate) fn escape_attr_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_text() {
        let doc = XmlDocument::parse_str(
            r#"<?xml version="1.0"?><a x="1"><b>hi &amp; bye</b><c/></a>"#,
        )
        .unwrap();
        let root = doc.root();
        assert_eq!(root.name(), "a");
        assert_eq!(root.attr("x"), Some("1"));
        assert_eq!(root.child_text("b").as_deref(), Some("hi & bye"));
        assert!(root.child("c").is_some());
    }

    #[test]
    fn latin1_input_is_decoded() {
        let bytes = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><RS>Compa\xF1\xEDa</RS>";
        let doc = XmlDocument::parse(bytes).unwrap();
        assert_eq!(doc.root().text(), "Compañía");
    }

    #[test]
    fn latin1_output_round_trips() {
        let doc = XmlDocument::new(Element::new("RS").with_text("Compañía €"));
        let bytes = doc.to_bytes(XmlEncoding::Latin1);
        let text = decode(&bytes);
        assert!(text.contains("Compañía &#8364;"));
        let back = XmlDocument::parse(&bytes).unwrap();
        assert_eq!(back.root().text(), "Compañía €");
    }

    #[test]
    fn rejects_empty_and_unbalanced_input() {
        assert!(matches!(XmlDocument::parse_str(""), Err(CryptoError::NoRoot)));
        assert!(XmlDocument::parse_str("<a><b></a>").is_err());
        assert!(XmlDocument::parse_str("<a></a><b></b>").is_err());
        assert!(XmlDocument::parse_str("just text").is_err());
    }

    #[test]
    fn rejects_doctype() {
        let err = XmlDocument::parse_str(
            r#"<!DOCTYPE a [<!ENTITY x SYSTEM "file:///etc/passwd">]><a>&x;</a>"#,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::Xml(_)));
    }

    #[test]
    fn finds_elements_by_path_and_id() {
        let doc = XmlDocument::parse_str(
            r#"<DTE xmlns="http://www.sii.cl/SiiDte"><Documento ID="F1T33"><Encabezado><IdDoc><Folio>1</Folio></IdDoc></Encabezado></Documento></DTE>"#,
        )
        .unwrap();
        let root = doc.root();
        assert_eq!(
            root.path_text(&["Documento", "Encabezado", "IdDoc", "Folio"]).as_deref(),
            Some("1")
        );
        let (doc_el, inherited) = root.find_by_id("F1T33").unwrap();
        assert_eq!(doc_el.local_name(), "Documento");
        assert_eq!(
            inherited,
            vec![(String::new(), "http://www.sii.cl/SiiDte".to_string())]
        );
    }

    #[test]
    fn compact_serialization_escapes() {
        let el = Element::new("a")
            .with_attr("v", "x\"<y")
            .with_text_child("b", "1 < 2 & 3");
        assert_eq!(
            el.to_xml(),
            r#"<a v="x&quot;&lt;y"><b>1 &lt; 2 &amp; 3</b></a>"#
        );
    }

    #[test]
    fn local_names_ignore_prefix() {
        let doc = XmlDocument::parse_str(
            r#"<soapenv:Envelope xmlns:soapenv="urn:x"><soapenv:Body/></soapenv:Envelope>"#,
        )
        .unwrap();
        assert_eq!(doc.root().local_name(), "Envelope");
        assert!(doc.root().child("Body").is_some());
        assert_eq!(prefix(doc.root().name()), "soapenv");
    }
}
