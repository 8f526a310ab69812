//! # Client Assembly
//!
//! Wires the components from one [`SiiConfig`]: certificate, key-value
//! store, transport, session manager, submission client and CAF manager.
//! Nothing here is global; every part can also be built by hand.

use std::sync::Arc;

use sii_caf::{AuthorityKeyring, CafManager, CafValidator, FsCafStore, TracingAlertSink};
use sii_cache::{KeySpace, KeyValueStore, MemoryStore};
use sii_core::SiiError;
use sii_crypto::{Certificate, CertificateCache, SignatureEngine, XmlSigner};

use crate::config::{ConfigError, SiiConfig};
use crate::dte::DteBuilder;
use crate::schema::SchemaRules;
use crate::session::SessionManager;
use crate::submission::{Sender, SubmissionClient};
use crate::token_cache::TokenCache;
use crate::transport::{HttpTransport, Transport};

/// Days before expiry at which the certificate is reported.
pub const CERT_EXPIRY_WARNING_DAYS: i64 = 30;

/// Fully wired client.
#[derive(Debug)]
pub struct SiiClient {
    config: SiiConfig,
    certificate: Arc<Certificate>,
    signer: Arc<SignatureEngine>,
    store: Arc<dyn KeyValueStore>,
    session: Arc<SessionManager>,
    submissions: SubmissionClient,
}

impl SiiClient {
    /// Load the certificate, open the store and build every component.
    pub async fn connect(config: SiiConfig) -> Result<Self, SiiError> {
        config.validate()?;
        let certificate = Arc::new(config.load_certificate()?);
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config, Some(&certificate))?);
        let store = open_store(&config).await?;
        Self::from_parts(config, certificate, store, transport).await
    }

    /// Build from already constructed parts.
    pub async fn from_parts(
        config: SiiConfig,
        certificate: Arc<Certificate>,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SiiError> {
        certificate.validate()?;
        if certificate.is_expiring_soon(CERT_EXPIRY_WARNING_DAYS) {
            tracing::warn!(
                days_left = certificate.days_until_expiry(),
                "signing certificate expires soon"
            );
        }
        let holder = certificate.signer_info()?;
        CertificateCache::new(store.clone(), KeySpace::default())
            .with_ttl(config.cache_ttl())
            .put(&certificate)
            .await?;

        let signer = Arc::new(SignatureEngine::new(certificate.clone()));
        let session = Arc::new(
            SessionManager::new(
                transport.clone(),
                signer.clone(),
                TokenCache::new(store.clone(), KeySpace::default()),
                holder.rut.clone(),
                config.ambiente,
            )
            .with_seed_algorithm(config.seed_algorithm)
            .with_token_ttl(config.token_ttl()),
        );

        let rut_empresa = config
            .rut_empresa
            .clone()
            .ok_or_else(|| ConfigError::Invalid("rut_empresa is required".into()))?;
        let fecha_resolucion = config
            .fecha_resolucion
            .ok_or_else(|| ConfigError::Invalid("fecha_resolucion is required".into()))?;
        let sender = Sender {
            rut_empresa,
            rut_envia: config.rut_envia.clone().unwrap_or(holder.rut),
            fecha_resolucion,
            numero_resolucion: config.numero_resolucion.unwrap_or(0),
        };
        let schema = match &config.schema_path {
            Some(path) => SchemaRules::load(path)?,
            None => SchemaRules::builtin(),
        };
        let signer_dyn: Arc<dyn XmlSigner> = signer.clone();
        let submissions = SubmissionClient::new(transport, session.clone(), signer_dyn, sender)
            .with_algorithm(config.document_algorithm)
            .with_schema(schema);

        tracing::info!(ambiente = %config.ambiente, "client ready");
        Ok(Self {
            config,
            certificate,
            signer,
            store,
            session,
            submissions,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &SiiConfig {
        &self.config
    }

    /// Signing certificate.
    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }

    /// Shared key-value store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Session manager.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Submission client.
    pub fn submissions(&self) -> &SubmissionClient {
        &self.submissions
    }

    /// Document builder signing with the configured certificate.
    pub fn document_builder(&self) -> DteBuilder<'_> {
        DteBuilder::new(self.signer.as_ref(), self.config.document_algorithm)
    }

    /// CAF manager over the configured directory.
    pub fn caf_manager(&self) -> Result<CafManager, SiiError> {
        caf_manager(&self.config)
    }
}

/// CAF manager from configuration alone; needs no certificate.
pub fn caf_manager(config: &SiiConfig) -> Result<CafManager, SiiError> {
    let keyring = match &config.authority_keys_dir {
        Some(dir) => AuthorityKeyring::load_dir(dir)?,
        None => {
            tracing::warn!("no authority keys configured; every CAF will fail verification");
            AuthorityKeyring::new()
        }
    };
    Ok(CafManager::new(
        Arc::new(FsCafStore::new(config.caf_dir.clone())),
        CafValidator::new(Arc::new(keyring)),
        Arc::new(TracingAlertSink),
    )
    .with_low_stock_threshold(config.caf_low_stock_threshold)
    .with_expiry_warning_days(config.caf_expiry_warning_days))
}

/// Redis when a URL is configured and the feature is on, memory otherwise.
pub async fn open_store(config: &SiiConfig) -> Result<Arc<dyn KeyValueStore>, SiiError> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = sii_cache::RedisStore::connect(url.expose()).await?;
            tracing::info!("using redis cache");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(SiiError::new(
            sii_core::ErrorKind::Procesamiento,
            "redis_url is set but the redis feature is disabled",
        )),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
