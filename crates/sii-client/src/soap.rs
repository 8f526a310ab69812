//! # SOAP Payloads
//!
//! Request envelopes and the authority's reply formats:
//!
//! - SOAP 1.1 envelopes whose body holds one operation element with one
//!   child per parameter.
//! - Replies whose operation element wraps a single return value. The value
//!   is either a plain string or an escaped `RESPUESTA` document with
//!   `RESP_HDR` (`ESTADO`, `GLOSA`) and `RESP_BODY`.
//! - SOAP faults (`faultcode`, `faultstring`).
//! - The `RECEPCIONDTE` acknowledgment of the multipart upload.

use sii_core::{ErrorKind, SiiError};
use sii_crypto::{Element, XmlDocument};

/// SOAP 1.1 envelope namespace.
pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

fn malformed(message: impl Into<String>) -> SiiError {
    SiiError::new(ErrorKind::Procesamiento, message)
}

/// Build a request envelope for `operation`.
pub fn build_envelope(operation: &str, params: &[(String, String)]) -> String {
    let mut call = Element::new(operation);
    for (name, value) in params {
        call.push_child(Element::new(name.as_str()).with_text(value));
    }
    let envelope = Element::new("soapenv:Envelope")
        .with_attr("xmlns:soapenv", SOAP_ENV_NS)
        .with_child(Element::new("soapenv:Body").with_child(call));
    XmlDocument::new(envelope).to_xml_string()
}

/// Text of the return value inside a SOAP reply. Faults become errors:
/// server faults are `Servidor` (retryable), all others `Procesamiento`.
pub fn parse_envelope(body: &[u8]) -> Result<String, SiiError> {
    let document = XmlDocument::parse(body)
        .map_err(|e| SiiError::wrap(ErrorKind::Procesamiento, "reply is not XML", e))?;
    let root = document.root();
    if root.local_name() != "Envelope" {
        return Err(malformed(format!("reply root is {}, not Envelope", root.name())));
    }
    let soap_body = root
        .child("Body")
        .ok_or_else(|| malformed("SOAP reply has no Body"))?;
    if let Some(fault) = soap_body.child("Fault") {
        return Err(fault_error(fault));
    }
    let response = soap_body
        .elements()
        .next()
        .ok_or_else(|| malformed("SOAP Body is empty"))?;
    let value = match response.elements().next() {
        Some(ret) => ret.text(),
        None => response.text(),
    };
    Ok(value.trim().to_string())
}

fn fault_error(fault: &Element) -> SiiError {
    let code = fault.child_text("faultcode").unwrap_or_default();
    let message = fault.child_text("faultstring").unwrap_or_default();
    let kind = if code.trim().ends_with("Server") {
        ErrorKind::Servidor
    } else {
        ErrorKind::Procesamiento
    };
    SiiError::rejected(kind, code.trim(), message.trim())
}

/// A `RESPUESTA` document.
#[derive(Debug, Clone)]
pub struct Respuesta {
    root: Element,
}

impl Respuesta {
    /// Parse the (already unescaped) return value.
    pub fn parse(text: &str) -> Result<Self, SiiError> {
        let document = XmlDocument::parse_str(text)
            .map_err(|e| SiiError::wrap(ErrorKind::Procesamiento, "RESPUESTA is not XML", e))?;
        let root = document.into_root();
        if root.local_name() != "RESPUESTA" {
            return Err(malformed(format!("expected RESPUESTA, got {}", root.name())));
        }
        Ok(Self { root })
    }

    /// `RESP_HDR/ESTADO`, empty when absent.
    pub fn estado(&self) -> String {
        self.header_text("ESTADO").unwrap_or_default()
    }

    /// `RESP_HDR/GLOSA`, or `GLOSA_ESTADO` for document queries.
    pub fn glosa(&self) -> Option<String> {
        self.header_text("GLOSA")
            .or_else(|| self.header_text("GLOSA_ESTADO"))
    }

    /// Trimmed, non-empty text of a `RESP_HDR` child.
    pub fn header_text(&self, name: &str) -> Option<String> {
        non_empty(self.root.path_text(&["RESP_HDR", name]))
    }

    /// Trimmed, non-empty text of a `RESP_BODY` child.
    pub fn body_text(&self, name: &str) -> Option<String> {
        non_empty(self.root.path_text(&["RESP_BODY", name]))
    }

    /// Numeric `RESP_BODY` child.
    pub fn body_number(&self, name: &str) -> Option<u32> {
        self.body_text(name).and_then(|t| t.parse().ok())
    }

    /// Whether `ESTADO` is `00`/`0`.
    pub fn is_ok(&self) -> bool {
        matches!(self.estado().as_str(), "00" | "0")
    }

    /// The whole document.
    pub fn element(&self) -> &Element {
        &self.root
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

/// `RECEPCIONDTE` acknowledgment of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAck {
    /// Upload status; 0 is success.
    pub status: i32,
    /// Tracking id, on success.
    pub track_id: Option<String>,
    /// Authority timestamp.
    pub timestamp: Option<String>,
    /// File name echoed back.
    pub file: Option<String>,
    /// Error detail lines, if any.
    pub detail: Vec<String>,
}

impl UploadAck {
    /// Parse the acknowledgment.
    pub fn parse(body: &[u8]) -> Result<Self, SiiError> {
        let document = XmlDocument::parse(body)
            .map_err(|e| SiiError::wrap(ErrorKind::Procesamiento, "upload reply is not XML", e))?;
        let root = document.root();
        if root.local_name() != "RECEPCIONDTE" {
            return Err(malformed(format!("expected RECEPCIONDTE, got {}", root.name())));
        }
        let status_text = non_empty(root.child_text("STATUS"))
            .ok_or_else(|| malformed("RECEPCIONDTE has no STATUS"))?;
        let status = status_text
            .parse()
            .map_err(|_| malformed(format!("STATUS {status_text:?} is not a number")))?;
        let detail = root
            .child("DETAIL")
            .map(|d| d.elements().map(|e| e.text().trim().to_string()).collect())
            .unwrap_or_default();
        Ok(Self {
            status,
            track_id: non_empty(root.child_text("TRACKID")),
            timestamp: non_empty(root.child_text("TIMESTAMP")),
            file: non_empty(root.child_text("FILE")),
            detail,
        })
    }

    /// Error for a non-zero status; the status is kept as rejection code.
    pub fn error(&self) -> Option<SiiError> {
        let kind = match self.status {
            0 => return None,
            1 | 5 | 6 => ErrorKind::AuthInvalid,
            7 => ErrorKind::Schema,
            8 => ErrorKind::Firma,
            _ => ErrorKind::Procesamiento,
        };
        let glosa = match self.status {
            1 => "sender lacks permission to submit",
            2 => "error in file size",
            3 => "incomplete file",
            5 => "not authenticated",
            6 => "company not authorized to submit",
            7 => "schema validation failed",
            8 => "signature verification failed",
            9 => "system locked",
            _ => "upload refused",
        };
        let glosa = if self.detail.is_empty() {
            glosa.to_string()
        } else {
            format!("{glosa}: {}", self.detail.join("; "))
        };
        Some(SiiError::rejected(kind, self.status.to_string(), glosa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(inner: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>{inner}</soapenv:Body>
</soapenv:Envelope>"#
        )
    }

    #[test]
    fn builds_operation_envelope() {
        let xml = build_envelope("getToken", &[("pszXml".into(), "<getToken/>".into())]);
        let doc = XmlDocument::parse_str(&xml).unwrap();
        let call = doc.root().path(&["Body", "getToken"]).unwrap();
        assert_eq!(call.child_text("pszXml").as_deref(), Some("<getToken/>"));
        assert!(xml.contains("&lt;getToken/&gt;"));
    }

    #[test]
    fn extracts_plain_return() {
        let body = envelope(
            r#"<ns1:getSeedResponse xmlns:ns1="http://DefaultNamespace"><return>SEMILLA-1</return></ns1:getSeedResponse>"#,
        );
        assert_eq!(parse_envelope(body.as_bytes()).unwrap(), "SEMILLA-1");
    }

    #[test]
    fn extracts_escaped_respuesta() {
        let body = envelope(
            r#"<ns1:getSeedResponse><ns1:getSeedReturn>&lt;?xml version="1.0" encoding="UTF-8"?&gt;&lt;SII:RESPUESTA xmlns:SII="http://www.sii.cl/XMLSchema"&gt;&lt;SII:RESP_BODY&gt;&lt;SEMILLA&gt;012345678901&lt;/SEMILLA&gt;&lt;/SII:RESP_BODY&gt;&lt;SII:RESP_HDR&gt;&lt;ESTADO&gt;00&lt;/ESTADO&gt;&lt;/SII:RESP_HDR&gt;&lt;/SII:RESPUESTA&gt;</ns1:getSeedReturn></ns1:getSeedResponse>"#,
        );
        let ret = parse_envelope(body.as_bytes()).unwrap();
        let respuesta = Respuesta::parse(&ret).unwrap();
        assert!(respuesta.is_ok());
        assert_eq!(respuesta.body_text("SEMILLA").as_deref(), Some("012345678901"));
        assert_eq!(respuesta.glosa(), None);
    }

    #[test]
    fn client_fault_is_not_retryable() {
        let body = envelope(
            "<soapenv:Fault><faultcode>soapenv:Client</faultcode><faultstring>Semilla inválida</faultstring></soapenv:Fault>",
        );
        let err = parse_envelope(body.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Procesamiento);
        assert_eq!(err.rejection().unwrap().glosa, "Semilla inválida");
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_fault_is_retryable() {
        let body = envelope(
            "<soapenv:Fault><faultcode>soapenv:Server</faultcode><faultstring>busy</faultstring></soapenv:Fault>",
        );
        assert!(parse_envelope(body.as_bytes()).unwrap_err().is_retryable());
    }

    #[test]
    fn non_envelope_is_processing_error() {
        let err = parse_envelope(b"<html><body>Bad gateway</body></html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Procesamiento);
    }

    #[test]
    fn upload_ack_success() {
        let ack = UploadAck::parse(
            br#"<?xml version="1.0"?><RECEPCIONDTE><RUTSENDER>11111111-1</RUTSENDER><RUTCOMPANY>76192083-9</RUTCOMPANY><FILE>envio.xml</FILE><TIMESTAMP>2024-03-01 10:00:00</TIMESTAMP><STATUS>0</STATUS><TRACKID>0123456789</TRACKID></RECEPCIONDTE>"#,
        )
        .unwrap();
        assert_eq!(ack.status, 0);
        assert_eq!(ack.track_id.as_deref(), Some("0123456789"));
        assert!(ack.error().is_none());
    }

    #[test]
    fn upload_status_codes_map_to_kinds() {
        let cases = [
            (1, ErrorKind::AuthInvalid),
            (5, ErrorKind::AuthInvalid),
            (6, ErrorKind::AuthInvalid),
            (7, ErrorKind::Schema),
            (8, ErrorKind::Firma),
            (2, ErrorKind::Procesamiento),
            (99, ErrorKind::Procesamiento),
        ];
        for (status, kind) in cases {
            let ack = UploadAck {
                status,
                track_id: None,
                timestamp: None,
                file: None,
                detail: vec![],
            };
            let err = ack.error().unwrap();
            assert_eq!(err.kind(), kind, "status {status}");
            assert_eq!(err.rejection().unwrap().code, status.to_string());
        }
    }
}
