//! # Auth/Session Manager
//!
//! Obtains session tokens through the seed exchange:
//!
//! ```text
//! NoToken -> SeedRequested -> SeedSigned -> TokenRequested -> TokenCached(expires_at)
//! ```
//!
//! A valid cached token short-circuits the chain. On a miss, callers queue
//! on one refresh lock; the first performs the exchange and the rest re-read
//! the cache once they get the lock, so concurrent misses cost one seed and
//! one token round trip. A failed exchange caches nothing and resets the
//! phase to `NoToken`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sii_core::{Ambiente, DigestAlgorithm, Endpoint, ErrorKind, Rut, SiiError};
use sii_crypto::{Element, SignOptions, XmlDocument, XmlSigner};
use tokio::sync::Mutex;

use crate::context::CallContext;
use crate::soap::Respuesta;
use crate::token_cache::{TokenCache, TokenData};
use crate::transport::{SoapRequest, Transport};

/// Where the manager is in the seed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No token held.
    NoToken,
    /// Waiting for the seed.
    SeedRequested,
    /// Seed signed, token not yet requested.
    SeedSigned,
    /// Waiting for the token.
    TokenRequested,
    /// Token cached until the given instant.
    TokenCached(DateTime<Utc>),
}

/// Issues and caches session tokens for one taxpayer in one environment.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn XmlSigner>,
    cache: TokenCache,
    rut: Rut,
    ambiente: Ambiente,
    seed_algorithm: DigestAlgorithm,
    token_ttl: Duration,
    refresh: Mutex<()>,
    phase: RwLock<SessionPhase>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("rut", &self.rut)
            .field("ambiente", &self.ambiente)
            .field("seed_algorithm", &self.seed_algorithm)
            .field("token_ttl", &self.token_ttl)
            .field("phase", &*self.phase.read())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Manager for `rut` in `ambiente`. Seeds are signed with SHA-1 and
    /// tokens live one hour unless the authority says otherwise.
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn XmlSigner>,
        cache: TokenCache,
        rut: Rut,
        ambiente: Ambiente,
    ) -> Self {
        Self {
            transport,
            signer,
            cache,
            rut,
            ambiente,
            seed_algorithm: DigestAlgorithm::Sha1,
            token_ttl: sii_cache::TOKEN_TTL,
            refresh: Mutex::new(()),
            phase: RwLock::new(SessionPhase::NoToken),
        }
    }

    /// Algorithm used to sign seeds.
    pub fn with_seed_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.seed_algorithm = algorithm;
        self
    }

    /// Token lifetime when the authority does not report one.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Taxpayer the tokens are issued for.
    pub fn rut(&self) -> &Rut {
        &self.rut
    }

    /// Target environment.
    pub fn ambiente(&self) -> Ambiente {
        self.ambiente
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write() = phase;
    }

    /// A valid token, running the seed exchange if none is cached.
    pub async fn token(&self, ctx: &CallContext) -> Result<String, SiiError> {
        ctx.check()?;
        if let Some(data) = self.cached().await? {
            return Ok(data.token);
        }

        let _guard = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            guard = self.refresh.lock() => guard,
        };
        if let Some(data) = self.cached().await? {
            return Ok(data.token);
        }

        match self.exchange(ctx).await {
            Ok(data) => {
                self.cache.put(&data).await?;
                self.set_phase(SessionPhase::TokenCached(data.expires_at));
                tracing::info!(
                    rut = %self.rut,
                    ambiente = %self.ambiente,
                    expires_at = %data.expires_at,
                    "session token issued"
                );
                Ok(data.token)
            }
            Err(err) => {
                self.set_phase(SessionPhase::NoToken);
                tracing::error!(rut = %self.rut, ambiente = %self.ambiente, error = %err, "session refresh failed");
                Err(err)
            }
        }
    }

    /// Context carrying a valid token, derived from `ctx`.
    pub async fn authorize(&self, ctx: &CallContext) -> Result<CallContext, SiiError> {
        let token = self.token(ctx).await?;
        Ok(ctx.clone().with_token(token))
    }

    /// Drop the cached token so the next call re-authenticates.
    pub async fn invalidate(&self) -> Result<(), SiiError> {
        self.cache.invalidate(&self.rut, self.ambiente).await?;
        self.set_phase(SessionPhase::NoToken);
        Ok(())
    }

    async fn cached(&self) -> Result<Option<TokenData>, SiiError> {
        let cached = self.cache.get(&self.rut, self.ambiente).await?;
        match &cached {
            Some(data) => self.set_phase(SessionPhase::TokenCached(data.expires_at)),
            None => {
                let mut phase = self.phase.write();
                if matches!(*phase, SessionPhase::TokenCached(_)) {
                    *phase = SessionPhase::NoToken;
                }
            }
        }
        Ok(cached)
    }

    async fn exchange(&self, ctx: &CallContext) -> Result<TokenData, SiiError> {
        self.set_phase(SessionPhase::SeedRequested);
        let seed = self.fetch_seed(ctx).await?;

        let signed = self.sign_seed(&seed)?;
        self.set_phase(SessionPhase::SeedSigned);

        self.set_phase(SessionPhase::TokenRequested);
        let request = SoapRequest::new(Endpoint::Token).param("pszXml", signed);
        let reply = self.transport.call(ctx, &request).await?;
        let (token, ttl) = parse_token(&reply)?;
        Ok(TokenData::issued(
            token,
            self.rut.clone(),
            self.ambiente,
            ttl.unwrap_or(self.token_ttl),
        ))
    }

    async fn fetch_seed(&self, ctx: &CallContext) -> Result<String, SiiError> {
        let reply = self
            .transport
            .call(ctx, &SoapRequest::new(Endpoint::Seed))
            .await?;
        let seed = if reply.starts_with('<') {
            let respuesta = Respuesta::parse(&reply)?;
            ensure_ok(&respuesta, "seed")?;
            respuesta.body_text("SEMILLA").unwrap_or_default()
        } else {
            reply
        };
        if seed.is_empty() {
            return Err(SiiError::new(ErrorKind::AuthInvalid, "authority returned an empty seed"));
        }
        tracing::debug!(rut = %self.rut, "seed received");
        Ok(seed)
    }

    fn sign_seed(&self, seed: &str) -> Result<String, SiiError> {
        let request = Element::new("getToken")
            .with_child(Element::new("item").with_text_child("Semilla", seed));
        let signed = self
            .signer
            .sign_document(
                XmlDocument::new(request),
                &SignOptions::new(self.seed_algorithm),
            )?;
        Ok(signed.document.to_xml_string())
    }
}

fn ensure_ok(respuesta: &Respuesta, what: &str) -> Result<(), SiiError> {
    if respuesta.is_ok() {
        return Ok(());
    }
    let glosa = respuesta
        .glosa()
        .unwrap_or_else(|| format!("{what} request refused"));
    Err(SiiError::rejected(ErrorKind::AuthInvalid, respuesta.estado(), glosa))
}

/// Token and optional lifetime (`RESP_BODY/EXPIRACION`, seconds) from a
/// token reply.
fn parse_token(reply: &str) -> Result<(String, Option<Duration>), SiiError> {
    if !reply.starts_with('<') {
        if reply.is_empty() {
            return Err(SiiError::new(ErrorKind::AuthInvalid, "authority returned no token"));
        }
        return Ok((reply.to_string(), None));
    }
    let respuesta = Respuesta::parse(reply)?;
    ensure_ok(&respuesta, "token")?;
    let token = respuesta
        .body_text("TOKEN")
        .ok_or_else(|| SiiError::new(ErrorKind::AuthInvalid, "authority returned no token"))?;
    let ttl = respuesta
        .body_text("EXPIRACION")
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    Ok((token, ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use sii_cache::{KeySpace, MemoryStore};
    use sii_crypto::testing::{TestCertificate, TestCertificateSpec};
    use sii_crypto::SignatureEngine;

    use crate::soap::UploadAck;
    use crate::transport::UploadRequest;

    const SEED_OK: &str = "<SII:RESPUESTA xmlns:SII=\"http://www.sii.cl/XMLSchema\"><SII:RESP_BODY><SEMILLA>042</SEMILLA></SII:RESP_BODY><SII:RESP_HDR><ESTADO>00</ESTADO></SII:RESP_HDR></SII:RESPUESTA>";
    const TOKEN_OK: &str = "<SII:RESPUESTA xmlns:SII=\"http://www.sii.cl/XMLSchema\"><SII:RESP_BODY><TOKEN>TKN123</TOKEN></SII:RESP_BODY><SII:RESP_HDR><ESTADO>00</ESTADO><GLOSA>Token Creado</GLOSA></SII:RESP_HDR></SII:RESPUESTA>";

    /// Scripted transport counting calls per endpoint.
    #[derive(Debug, Default)]
    struct Scripted {
        seeds: AtomicU32,
        tokens: AtomicU32,
        token_reply: Option<&'static str>,
        seen_xml: parking_lot::Mutex<Option<String>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn call(&self, _ctx: &CallContext, request: &SoapRequest) -> Result<String, SiiError> {
            match request.endpoint {
                Endpoint::Seed => {
                    self.seeds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(SEED_OK.to_string())
                }
                Endpoint::Token => {
                    self.tokens.fetch_add(1, Ordering::SeqCst);
                    *self.seen_xml.lock() = request.params.first().map(|(_, v)| v.clone());
                    Ok(self.token_reply.unwrap_or(TOKEN_OK).to_string())
                }
                other => Err(SiiError::new(ErrorKind::Procesamiento, format!("unexpected {other}"))),
            }
        }

        async fn upload(&self, _ctx: &CallContext, _request: &UploadRequest) -> Result<UploadAck, SiiError> {
            Err(SiiError::new(ErrorKind::Procesamiento, "unexpected upload"))
        }
    }

    fn manager(transport: Arc<Scripted>) -> SessionManager {
        let cert = TestCertificate::generate(&TestCertificateSpec::default()).certificate();
        let signer = Arc::new(SignatureEngine::new(Arc::new(cert)));
        let cache = TokenCache::new(Arc::new(MemoryStore::new()), KeySpace::default());
        SessionManager::new(
            transport,
            signer,
            cache,
            Rut::parse("76192083-9").unwrap(),
            Ambiente::Certificacion,
        )
    }

    #[tokio::test]
    async fn exchange_signs_seed_and_caches() {
        let transport = Arc::new(Scripted::default());
        let manager = manager(transport.clone());
        assert_eq!(manager.phase(), SessionPhase::NoToken);

        let token = manager.token(&CallContext::new()).await.unwrap();
        assert_eq!(token, "TKN123");
        assert!(matches!(manager.phase(), SessionPhase::TokenCached(_)));

        let sent = transport.seen_xml.lock().clone().unwrap();
        let doc = XmlDocument::parse_str(&sent).unwrap();
        assert_eq!(doc.root().path_text(&["item", "Semilla"]).as_deref(), Some("042"));
        sii_crypto::verify_document(&doc).unwrap();

        manager.token(&CallContext::new()).await.unwrap();
        assert_eq!(transport.seeds.load(Ordering::SeqCst), 1);
        assert_eq!(transport.tokens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_collapse() {
        let transport = Arc::new(Scripted::default());
        let manager = Arc::new(manager(transport.clone()));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.token(&CallContext::new()).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "TKN123");
        }
        assert_eq!(transport.seeds.load(Ordering::SeqCst), 1);
        assert_eq!(transport.tokens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_token_caches_nothing() {
        let transport = Arc::new(Scripted {
            token_reply: Some("<RESPUESTA><RESP_HDR><ESTADO>-07</ESTADO><GLOSA>Firma invalida</GLOSA></RESP_HDR></RESPUESTA>"),
            ..Scripted::default()
        });
        let manager = manager(transport.clone());
        let err = manager.token(&CallContext::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthInvalid);
        assert_eq!(err.rejection().unwrap().code, "-07");
        assert_eq!(manager.phase(), SessionPhase::NoToken);

        manager.token(&CallContext::new()).await.unwrap_err();
        assert_eq!(transport.seeds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_new_exchange() {
        let transport = Arc::new(Scripted::default());
        let manager = manager(transport.clone());
        manager.token(&CallContext::new()).await.unwrap();
        manager.invalidate().await.unwrap();
        assert_eq!(manager.phase(), SessionPhase::NoToken);
        manager.token(&CallContext::new()).await.unwrap();
        assert_eq!(transport.tokens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_context_never_calls_out() {
        let transport = Arc::new(Scripted::default());
        let manager = manager(transport.clone());
        let ctx = CallContext::new();
        ctx.cancel();
        let err = manager.token(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(transport.seeds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn token_reply_forms() {
        assert_eq!(parse_token("PLAIN").unwrap(), ("PLAIN".to_string(), None));
        let (token, ttl) = parse_token(
            "<RESPUESTA><RESP_BODY><TOKEN>T</TOKEN><EXPIRACION>600</EXPIRACION></RESP_BODY><RESP_HDR><ESTADO>00</ESTADO></RESP_HDR></RESPUESTA>",
        )
        .unwrap();
        assert_eq!(token, "T");
        assert_eq!(ttl, Some(Duration::from_secs(600)));
        assert_eq!(parse_token("").unwrap_err().kind(), ErrorKind::AuthInvalid);
    }
}
