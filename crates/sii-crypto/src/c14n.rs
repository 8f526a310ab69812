//! # Canonical XML
//!
//! Inclusive Canonical XML 1.0 without comments, over the tree in
//! [`crate::xml`]. Output is UTF-8 and byte-for-byte deterministic:
//!
//! - empty elements are written as start/end pairs;
//! - namespace declarations come first (default, then by prefix), followed
//!   by attributes ordered by namespace URI then local name;
//! - the apex element renders every namespace binding in scope, descendants
//!   render only bindings that change;
//! - text and attribute values use the canonical escapes.
//!
//! The enveloped-signature transform is applied by skipping `Signature`
//! elements in the XML-DSig namespace that are direct children of the apex.

use std::collections::BTreeMap;

use sii_core::algorithm::XMLDSIG_NS;

use crate::xml::{escape_attr_into, escape_text_into, local_name, prefix, Element, Node};

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Canonicalization options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct C14nOptions {
    /// Skip XML-DSig `Signature` children of the apex.
    pub enveloped_signature: bool,
}

impl C14nOptions {
    /// Options for a reference carrying the enveloped-signature transform.
    pub fn enveloped() -> Self {
        Self {
            enveloped_signature: true,
        }
    }
}

/// Canonical bytes of a subtree. The sole construction path is [`canonicalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalXml(Vec<u8>);

impl CanonicalXml {
    /// The canonical bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Canonicalize `apex`, given the namespace bindings inherited from its
/// ancestors (outermost first).
pub fn canonicalize(
    apex: &Element,
    inherited: &[(String, String)],
    options: C14nOptions,
) -> CanonicalXml {
    let mut scope: BTreeMap<String, String> = BTreeMap::new();
    for (p, uri) in inherited {
        scope.insert(p.clone(), uri.clone());
    }
    let mut out = String::new();
    write_element(apex, &scope, &BTreeMap::new(), true, options, &mut out);
    CanonicalXml(out.into_bytes())
}

fn is_enveloped_signature(element: &Element, scope: &BTreeMap<String, String>) -> bool {
    if element.local_name() != "Signature" {
        return false;
    }
    let p = prefix(element.name());
    let own = element
        .namespace_declarations()
        .find(|(decl, _)| *decl == p)
        .map(|(_, uri)| uri);
    let uri = own.or_else(|| scope.get(p).map(String::as_str));
    uri == Some(XMLDSIG_NS)
}

fn write_element(
    element: &Element,
    parent_scope: &BTreeMap<String, String>,
    parent_rendered: &BTreeMap<String, String>,
    is_apex: bool,
    options: C14nOptions,
    out: &mut String,
) {
    let mut scope = parent_scope.clone();
    for (p, uri) in element.namespace_declarations() {
        scope.insert(p.to_string(), uri.to_string());
    }

    // Namespace nodes to render on this element.
    let mut rendered = parent_rendered.clone();
    let mut ns_out: Vec<(&str, &str)> = Vec::new();
    for (p, uri) in &scope {
        let changed = parent_rendered.get(p) != Some(uri);
        if !changed {
            continue;
        }
        if p.is_empty() && uri.is_empty() && parent_rendered.get(p).map_or(true, String::is_empty)
        {
            continue;
        }
        if is_apex || element.namespace_declarations().any(|(d, _)| d == p) {
            ns_out.push((p.as_str(), uri.as_str()));
            rendered.insert(p.clone(), uri.clone());
        }
    }

    // Plain attributes keyed by (namespace URI, local name).
    let mut attrs: Vec<(&str, &str, &str, &str)> = element
        .attributes()
        .iter()
        .filter(|a| a.name != "xmlns" && !a.name.starts_with("xmlns:"))
        .map(|a| {
            let p = prefix(&a.name);
            let uri = match p {
                "" => "",
                "xml" => XML_NS,
                p => scope.get(p).map_or("", String::as_str),
            };
            (uri, local_name(&a.name), a.name.as_str(), a.value.as_str())
        })
        .collect();
    attrs.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    out.push('<');
    out.push_str(element.name());
    for (p, uri) in ns_out {
        if p.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(p);
            out.push_str("=\"");
        }
        escape_attr_into(uri, out);
        out.push('"');
    }
    for (_, _, name, value) in attrs {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_attr_into(value, out);
        out.push('"');
    }
    out.push('>');

    for child in element.children() {
        match child {
            Node::Text(text) => escape_text_into(text, out),
            Node::Element(e) => {
                if is_apex && options.enveloped_signature && is_enveloped_signature(e, &scope) {
                    continue;
                }
                write_element(e, &scope, &rendered, false, options, out);
            }
        }
    }

    out.push_str("</");
    out.push_str(element.name());
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{XmlDocument, XmlEncoding};
    use proptest::prelude::*;

    fn c14n(xml: &str) -> String {
        let doc = XmlDocument::parse_str(xml).unwrap();
        let bytes = canonicalize(doc.root(), &[], C14nOptions::default()).into_bytes();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn expands_empty_elements_and_drops_declaration() {
        assert_eq!(c14n(r#"<?xml version="1.0"?><a><b/></a>"#), "<a><b></b></a>");
    }

    #[test]
    fn sorts_attributes_and_namespaces() {
        let out = c14n(r#"<a z="1" xmlns:b="urn:b" a="2" xmlns="urn:d" b:c="3"></a>"#);
        assert_eq!(
            out,
            r#"<a xmlns="urn:d" xmlns:b="urn:b" a="2" z="1" b:c="3"></a>"#
        );
    }

    #[test]
    fn descendants_do_not_repeat_inherited_namespaces() {
        let out = c14n(r#"<a xmlns="urn:x"><b xmlns="urn:x"><c xmlns="urn:y"/></b></a>"#);
        assert_eq!(
            out,
            r#"<a xmlns="urn:x"><b><c xmlns="urn:y"></c></b></a>"#
        );
    }

    #[test]
    fn escapes_text_and_attributes() {
        let out = c14n("<a v=\"&quot;&#9;\">x &gt; y &amp; &lt;z&gt;</a>");
        assert_eq!(out, "<a v=\"&quot;&#x9;\">x &gt; y &amp; &lt;z&gt;</a>");
    }

    #[test]
    fn line_endings_and_attribute_whitespace_are_normalized() {
        assert_eq!(c14n("<a t=\"x\ty\">l1\r\nl2</a>"), "<a t=\"x y\">l1\nl2</a>");
        assert_eq!(c14n("<a>l1\rl2\r\n</a>"), "<a>l1\nl2\n</a>");
        assert_eq!(c14n("<a t=\"x\r\ny\"></a>"), "<a t=\"x y\"></a>");
    }

    #[test]
    fn character_references_escape_normalization() {
        assert_eq!(
            c14n("<a t=\"x&#9;y&#10;\">l1&#13;</a>"),
            "<a t=\"x&#x9;y&#xA;\">l1&#xD;</a>"
        );
    }

    #[test]
    fn whitespace_in_content_is_preserved() {
        assert_eq!(c14n("<a>\n  <b> x </b>\n</a>"), "<a>\n  <b> x </b>\n</a>");
    }

    #[test]
    fn subtree_renders_inherited_namespaces_on_apex() {
        let doc = XmlDocument::parse_str(
            r#"<DTE xmlns="http://www.sii.cl/SiiDte" version="1.0"><Documento ID="F1T33"><Folio>1</Folio></Documento></DTE>"#,
        )
        .unwrap();
        let (apex, inherited) = doc.root().find_by_id("F1T33").unwrap();
        let out = String::from_utf8(
            canonicalize(apex, &inherited, C14nOptions::default()).into_bytes(),
        )
        .unwrap();
        assert_eq!(
            out,
            r#"<Documento xmlns="http://www.sii.cl/SiiDte" ID="F1T33"><Folio>1</Folio></Documento>"#
        );
    }

    #[test]
    fn enveloped_transform_skips_only_direct_signature_children() {
        let xml = r#"<a><b><Signature xmlns="http://www.w3.org/2000/09/xmldsig#"/></b><Signature xmlns="http://www.w3.org/2000/09/xmldsig#"><x/></Signature></a>"#;
        let doc = XmlDocument::parse_str(xml).unwrap();
        let out = String::from_utf8(
            canonicalize(doc.root(), &[], C14nOptions::enveloped()).into_bytes(),
        )
        .unwrap();
        assert_eq!(
            out,
            r#"<a><b><Signature xmlns="http://www.w3.org/2000/09/xmldsig#"></Signature></b></a>"#
        );
    }

    #[test]
    fn foreign_signature_elements_are_kept() {
        let out = {
            let doc = XmlDocument::parse_str(r#"<a><Signature>x</Signature></a>"#).unwrap();
            canonicalize(doc.root(), &[], C14nOptions::enveloped()).into_bytes()
        };
        assert_eq!(out, b"<a><Signature>x</Signature></a>".to_vec());
    }

    #[test]
    fn output_is_deterministic() {
        let xml = r#"<r b="2" a="1"><x>1</x></r>"#;
        assert_eq!(c14n(xml), c14n(xml));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // a document written as Latin-1 and read back canonicalizes identically
        #[test]
        fn canonical_form_survives_latin1_serialization(
            text in "[ -~áéíóúñÑ€\n]{0,40}",
            glosa in "[ -~áéñ€]{0,20}",
        ) {
            let root = Element::new("Documento")
                .with_attr("ID", "F1T33")
                .with_attr("Glosa", glosa.as_str())
                .with_text_child("NmbItem", &text);
            let built = XmlDocument::new(root);
            let reparsed = XmlDocument::parse(&built.to_bytes(XmlEncoding::Latin1)).unwrap();
            prop_assert_eq!(
                canonicalize(built.root(), &[], C14nOptions::default()),
                canonicalize(reparsed.root(), &[], C14nOptions::default())
            );
        }
    }
}
