//! # Structural Validation
//!
//! Required-path rules checked before anything reaches the transport. Rules
//! are keyed by root element local name; each rule is a `/`-separated path
//! of local names, optionally ending in `@attribute`:
//!
//! ```yaml
//! DTE:
//!   - Documento/@ID
//!   - Documento/Encabezado/IdDoc/Folio
//! ```
//!
//! Built-in rules cover `DTE` and `EnvioDTE`; a YAML file extends or
//! overrides them per root.

use std::collections::BTreeMap;
use std::path::Path;

use sii_core::{ErrorKind, SiiError};
use sii_crypto::Element;

const DTE_RULES: &[&str] = &[
    "@version",
    "Documento/@ID",
    "Documento/Encabezado/IdDoc/TipoDTE",
    "Documento/Encabezado/IdDoc/Folio",
    "Documento/Encabezado/IdDoc/FchEmis",
    "Documento/Encabezado/Emisor/RUTEmisor",
    "Documento/Encabezado/Emisor/RznSoc",
    "Documento/Encabezado/Receptor/RUTRecep",
    "Documento/Encabezado/Receptor/RznSocRecep",
    "Documento/Encabezado/Totales/MntTotal",
    "Documento/Detalle/NmbItem",
    "Documento/Detalle/MontoItem",
    "Documento/TED/DD",
    "Documento/TED/FRMT",
    "Signature/SignedInfo",
    "Signature/SignatureValue",
];

const ENVIO_RULES: &[&str] = &[
    "@version",
    "SetDTE/@ID",
    "SetDTE/Caratula/RutEmisor",
    "SetDTE/Caratula/RutEnvia",
    "SetDTE/Caratula/RutReceptor",
    "SetDTE/Caratula/FchResol",
    "SetDTE/Caratula/NroResol",
    "SetDTE/Caratula/TmstFirmaEnv",
    "SetDTE/Caratula/SubTotDTE",
    "SetDTE/DTE",
    "Signature/SignedInfo",
    "Signature/SignatureValue",
];

/// Required-path rules per root element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRules {
    rules: BTreeMap<String, Vec<String>>,
}

impl Default for SchemaRules {
    fn default() -> Self {
        Self::builtin()
    }
}

fn owned(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|p| p.to_string()).collect()
}

impl SchemaRules {
    /// Rules for `DTE` and `EnvioDTE`.
    pub fn builtin() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert("DTE".to_string(), owned(DTE_RULES));
        rules.insert("EnvioDTE".to_string(), owned(ENVIO_RULES));
        Self { rules }
    }

    /// No rules; everything passes.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Rules parsed from YAML.
    pub fn from_yaml_str(text: &str) -> Result<Self, SiiError> {
        let rules: BTreeMap<String, Vec<String>> = serde_yaml::from_str(text)
            .map_err(|e| SiiError::wrap(ErrorKind::Procesamiento, "invalid schema rules", e))?;
        Ok(Self { rules })
    }

    /// Built-in rules, with roots named in the file at `path` replaced.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SiiError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SiiError::wrap(
                ErrorKind::Procesamiento,
                format!("cannot read schema rules {}", path.display()),
                e,
            )
        })?;
        let mut rules = Self::builtin();
        rules.rules.extend(Self::from_yaml_str(&text)?.rules);
        Ok(rules)
    }

    /// Roots with rules.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Paths missing under `root`. Roots without rules are unconstrained.
    pub fn missing(&self, root: &Element) -> Vec<String> {
        let Some(paths) = self.rules.get(root.local_name()) else {
            return Vec::new();
        };
        paths
            .iter()
            .filter(|path| !present(root, path))
            .cloned()
            .collect()
    }

    /// Fail `Schema` listing every missing path.
    pub fn validate(&self, root: &Element) -> Result<(), SiiError> {
        let missing = self.missing(root);
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(root = root.local_name(), ?missing, "structural validation failed");
        Err(SiiError::new(
            ErrorKind::Schema,
            format!("{} is missing {}", root.local_name(), missing.join(", ")),
        ))
    }
}

fn present(root: &Element, path: &str) -> bool {
    let (elements, attribute) = match path.rsplit_once('@') {
        Some((head, attr)) => (head.trim_end_matches('/'), Some(attr)),
        None => (path, None),
    };
    let steps: Vec<&str> = elements.split('/').filter(|s| !s.is_empty()).collect();
    let Some(target) = root.path(&steps) else {
        return false;
    };
    match attribute {
        Some(attr) => target.attr(attr).is_some_and(|v| !v.trim().is_empty()),
        None => target.elements().next().is_some() || !target.text().trim().is_empty(),
    }
}
