//! Mock authority and wiring shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use sii_cache::{KeySpace, MemoryStore};
use sii_client::{
    Detalle, Documento, Emisor, HttpTransport, IdDoc, Receptor, RetryConfig, Sender,
    SessionManager, SubmissionClient, TokenCache, Totales, Transport,
};
use sii_core::{Ambiente, Rut, TipoDte};
use sii_crypto::testing::{TestCertificate, TestCertificateSpec};
use sii_crypto::SignatureEngine;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SEED_PATH: &str = "/DTEWS/CrSeed.jws";
pub const TOKEN_PATH: &str = "/DTEWS/GetTokenFromSeed.jws";
pub const UPLOAD_PATH: &str = "/cgi_dte/UPL/DTEUpload";
pub const STATUS_PATH: &str = "/DTEWS/QueryEstUp.jws";
pub const DOCUMENT_PATH: &str = "/DTEWS/QueryEstDte.jws";

pub const TOKEN: &str = "TKN8XQ3L2M";
pub const EMPRESA: &str = "76192083-9";
pub const ENVIA: &str = "11111111-1";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// SOAP reply whose return value is the escaped `inner` document.
pub fn soap_return(operation: &str, inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>
    <ns1:{operation}Response xmlns:ns1="http://DefaultNamespace">
      <ns1:{operation}Return>{}</ns1:{operation}Return>
    </ns1:{operation}Response>
  </soapenv:Body>
</soapenv:Envelope>"#,
        escape(inner)
    )
}

/// SOAP fault reply.
pub fn soap_fault(code: &str, message: &str) -> String {
    format!(
        r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"><soapenv:Body><soapenv:Fault><faultcode>soapenv:{code}</faultcode><faultstring>{message}</faultstring></soapenv:Fault></soapenv:Body></soapenv:Envelope>"#
    )
}

pub fn respuesta(estado: &str, glosa: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><SII:RESPUESTA xmlns:SII="http://www.sii.cl/XMLSchema"><SII:RESP_BODY>{body}</SII:RESP_BODY><SII:RESP_HDR><ESTADO>{estado}</ESTADO><GLOSA>{glosa}</GLOSA></SII:RESP_HDR></SII:RESPUESTA>"#
    )
}

pub fn xml(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/xml; charset=utf-8")
}

pub fn seed_reply() -> ResponseTemplate {
    xml(soap_return("getSeed", &respuesta("00", "", "<SEMILLA>000012345678</SEMILLA>")))
}

pub fn token_reply() -> ResponseTemplate {
    xml(soap_return(
        "getToken",
        &respuesta("00", "Token Creado", &format!("<TOKEN>{TOKEN}</TOKEN>")),
    ))
}

pub fn status_reply(estado: &str, glosa: &str) -> ResponseTemplate {
    xml(soap_return(
        "getEstUp",
        &respuesta(
            estado,
            glosa,
            "<INFORMADOS>1</INFORMADOS><ACEPTADOS>1</ACEPTADOS><RECHAZADOS>0</RECHAZADOS><REPAROS>0</REPAROS>",
        ),
    ))
}

pub fn upload_reply(status: u32, track_id: Option<&str>) -> ResponseTemplate {
    let track = track_id
        .map(|t| format!("<TRACKID>{t}</TRACKID>"))
        .unwrap_or_default();
    ResponseTemplate::new(200).set_body_raw(
        format!(
            "<?xml version=\"1.0\"?><RECEPCIONDTE><RUTSENDER>{ENVIA}</RUTSENDER><RUTCOMPANY>{EMPRESA}</RUTCOMPANY><FILE>envio.xml</FILE><TIMESTAMP>2024-03-01 10:00:00</TIMESTAMP><STATUS>{status}</STATUS>{track}</RECEPCIONDTE>"
        ),
        "text/html",
    )
}

/// Seed and token endpoints, each expected exactly `times` times.
pub async fn mount_auth(server: &MockServer, times: u64) {
    Mock::given(method("POST"))
        .and(path(SEED_PATH))
        .respond_with(seed_reply())
        .expect(times)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(token_reply())
        .expect(times)
        .mount(server)
        .await;
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_wait: Duration::from_millis(10),
        max_wait: Duration::from_millis(50),
        multiplier: 2.0,
    }
}

pub fn transport(server: &MockServer) -> Arc<HttpTransport> {
    Arc::new(HttpTransport::with_client(
        reqwest::Client::new(),
        Url::parse(&server.uri()).unwrap(),
        fast_retry(),
        Duration::from_secs(5),
    ))
}

pub struct Harness {
    pub transport: Arc<HttpTransport>,
    pub engine: Arc<SignatureEngine>,
    pub session: Arc<SessionManager>,
    pub client: SubmissionClient,
}

pub fn harness(server: &MockServer) -> Harness {
    let transport = transport(server);
    let cert = TestCertificate::generate(&TestCertificateSpec::default()).certificate();
    let engine = Arc::new(SignatureEngine::new(Arc::new(cert)));
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let session = Arc::new(SessionManager::new(
        dyn_transport.clone(),
        engine.clone(),
        TokenCache::new(Arc::new(MemoryStore::new()), KeySpace::default()),
        Rut::parse(ENVIA).unwrap(),
        Ambiente::Certificacion,
    ));
    let sender = Sender {
        rut_empresa: Rut::parse(EMPRESA).unwrap(),
        rut_envia: Rut::parse(ENVIA).unwrap(),
        fecha_resolucion: NaiveDate::from_ymd_opt(2014, 8, 22).unwrap(),
        numero_resolucion: 0,
    };
    let client = SubmissionClient::new(dyn_transport, session.clone(), engine.clone(), sender);
    Harness {
        transport,
        engine,
        session,
        client,
    }
}

pub fn factura(folio: u64) -> Documento {
    Documento {
        id_doc: IdDoc {
            tipo: TipoDte::FacturaElectronica,
            folio,
            fecha_emision: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            forma_pago: Some(1),
        },
        emisor: Emisor {
            rut: Rut::parse(EMPRESA).unwrap(),
            razon_social: "EMPRESA DE PRUEBA SPA".into(),
            giro: "Desarrollo de software".into(),
            acteco: Some(620_200),
            direccion: None,
            comuna: None,
            ciudad: None,
        },
        receptor: Receptor {
            rut: Rut::parse("60803000-K").unwrap(),
            razon_social: "Servicio de Impuestos Internos".into(),
            giro: None,
            direccion: None,
            comuna: None,
            ciudad: None,
        },
        totales: Totales {
            monto_neto: Some(10_000),
            monto_exento: None,
            tasa_iva: Some(19),
            iva: Some(1_900),
            monto_total: 11_900,
        },
        detalle: vec![Detalle {
            nombre: "Licencia anual".into(),
            cantidad: Some(1.0),
            precio: Some(10_000.0),
            monto: 10_000,
            exento: false,
        }],
    }
}
