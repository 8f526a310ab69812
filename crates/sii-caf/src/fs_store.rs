//! # File-System CAF Store
//!
//! One directory per authorization:
//!
//! ```text
//! {base}/{id}/metadata.json   record without the raw payloads
//! {base}/{id}/caf.xml         authorization XML as received
//! {base}/{id}/firma_sii.bin   raw authority signature
//! ```
//!
//! Writers within one store instance are serialized; readers run
//! concurrently. File access runs on the blocking thread pool. Files are
//! written to a temporary name and renamed into place. On Unix, directories
//! are created `0750` and files `0600`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sii_core::{Rut, TipoDte};

use crate::error::CafError;
use crate::model::{Caf, CafState};
use crate::store::{sort_by_range, CafRepository};

const METADATA_FILE: &str = "metadata.json";
const XML_FILE: &str = "caf.xml";
const SIGNATURE_FILE: &str = "firma_sii.bin";

/// Record fields persisted in `metadata.json`.
#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    id: String,
    tipo: TipoDte,
    rut_emisor: Rut,
    razon_social: String,
    folio_inicial: u64,
    folio_final: u64,
    folio_ultimo: u64,
    fecha_autorizacion: NaiveDate,
    fecha_vencimiento: DateTime<Utc>,
    idk: u32,
    estado: CafState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Metadata {
    fn from_caf(caf: &Caf) -> Self {
        Self {
            id: caf.id.clone(),
            tipo: caf.tipo,
            rut_emisor: caf.rut_emisor.clone(),
            razon_social: caf.razon_social.clone(),
            folio_inicial: caf.folio_inicial,
            folio_final: caf.folio_final,
            folio_ultimo: caf.folio_ultimo,
            fecha_autorizacion: caf.fecha_autorizacion,
            fecha_vencimiento: caf.fecha_vencimiento,
            idk: caf.idk,
            estado: caf.estado,
            created_at: caf.created_at,
            updated_at: caf.updated_at,
        }
    }

    fn into_caf(self, xml: Vec<u8>, firma_sii: Vec<u8>) -> Caf {
        Caf {
            id: self.id,
            tipo: self.tipo,
            rut_emisor: self.rut_emisor,
            razon_social: self.razon_social,
            folio_inicial: self.folio_inicial,
            folio_final: self.folio_final,
            folio_ultimo: self.folio_ultimo,
            fecha_autorizacion: self.fecha_autorizacion,
            fecha_vencimiento: self.fecha_vencimiento,
            idk: self.idk,
            estado: self.estado,
            xml,
            firma_sii,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Ids become directory names: ASCII alphanumerics and `-`, `_`, `.` only,
/// never a dot-only name.
fn validate_id(id: &str) -> Result<(), CafError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.chars().all(|c| c == '.');
    if ok {
        Ok(())
    } else {
        Err(CafError::InvalidId(id.to_string()))
    }
}

/// [`CafRepository`] over a directory tree.
#[derive(Debug, Clone)]
pub struct FsCafStore {
    base_dir: PathBuf,
    write_lock: Arc<RwLock<()>>,
}

impl FsCafStore {
    /// Store rooted at `base_dir`, created on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Arc::new(RwLock::new(())),
        }
    }

    /// Root directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Run `op` on the blocking pool with a handle to this store.
    async fn blocking<T, F>(&self, op: F) -> Result<T, CafError>
    where
        T: Send + 'static,
        F: FnOnce(&FsCafStore) -> Result<T, CafError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| CafError::Task(e.to_string()))?
    }

    fn record_dir(&self, id: &str) -> Result<PathBuf, CafError> {
        validate_id(id)?;
        Ok(self.base_dir.join(id))
    }

    fn write_record(&self, caf: &Caf) -> Result<(), CafError> {
        let dir = self.record_dir(&caf.id)?;
        create_dir(&self.base_dir)?;
        create_dir(&dir)?;
        let metadata = serde_json::to_vec_pretty(&Metadata::from_caf(caf)).map_err(|e| {
            CafError::Corrupt {
                id: caf.id.clone(),
                reason: e.to_string(),
            }
        })?;
        write_file(&dir.join(XML_FILE), &caf.xml)?;
        write_file(&dir.join(SIGNATURE_FILE), &caf.firma_sii)?;
        // Metadata last: a record is visible once its metadata exists.
        write_file(&dir.join(METADATA_FILE), &metadata)
    }

    fn read_record(&self, dir: &Path) -> Result<Option<Caf>, CafError> {
        let metadata_path = dir.join(METADATA_FILE);
        let metadata = match fs::read(&metadata_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CafError::io(&metadata_path, e)),
        };
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata: Metadata =
            serde_json::from_slice(&metadata).map_err(|e| CafError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        let xml = read_file(&dir.join(XML_FILE))?;
        let firma = read_file(&dir.join(SIGNATURE_FILE))?;
        Ok(Some(metadata.into_caf(xml, firma)))
    }

    fn load(&self, id: &str) -> Result<Option<Caf>, CafError> {
        let dir = self.record_dir(id)?;
        self.read_record(&dir)
    }

    fn scan(&self, tipo: TipoDte) -> Result<Vec<Caf>, CafError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CafError::io(&self.base_dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CafError::io(&self.base_dir, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match self.read_record(&path) {
                Ok(Some(caf)) if caf.tipo == tipo => out.push(caf),
                Ok(_) => {}
                Err(CafError::Corrupt { id, reason }) => {
                    tracing::warn!(%id, %reason, "skipping unreadable CAF record");
                }
                Err(e) => return Err(e),
            }
        }
        sort_by_range(&mut out);
        Ok(out)
    }
}

#[async_trait]
impl CafRepository for FsCafStore {
    async fn save(&self, caf: &Caf) -> Result<(), CafError> {
        let record = caf.clone();
        self.blocking(move |store| {
            let _guard = store.write_lock.write();
            store.write_record(&record)
        })
        .await?;
        tracing::debug!(id = %caf.id, estado = %caf.estado, "stored CAF");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Caf>, CafError> {
        let id = id.to_string();
        self.blocking(move |store| {
            let _guard = store.write_lock.read();
            store.load(&id)
        })
        .await
    }

    async fn list_by_type(&self, tipo: TipoDte) -> Result<Vec<Caf>, CafError> {
        self.blocking(move |store| {
            let _guard = store.write_lock.read();
            store.scan(tipo)
        })
        .await
    }

    async fn update_state(&self, id: &str, estado: CafState) -> Result<(), CafError> {
        let id = id.to_string();
        self.blocking(move |store| {
            let _guard = store.write_lock.write();
            let mut caf = store
                .load(&id)?
                .ok_or_else(|| CafError::NotFound(id.clone()))?;
            caf.estado = estado;
            caf.updated_at = Utc::now();
            store.write_record(&caf)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, CafError> {
        let id = id.to_string();
        self.blocking(move |store| {
            let _guard = store.write_lock.write();
            let dir = store.record_dir(&id)?;
            match fs::remove_dir_all(&dir) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(CafError::io(&dir, e)),
            }
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn create_dir(dir: &Path) -> Result<(), CafError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }
    builder.create(dir).map_err(|e| CafError::io(dir, e))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CafError> {
    let tmp = path.with_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp).map_err(|e| CafError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| CafError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CafError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CafError::io(path, e))
}

fn read_file(path: &Path) -> Result<Vec<u8>, CafError> {
    fs::read(path).map_err(|e| CafError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::caf;

    #[tokio::test]
    async fn save_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path().join("cafs"));
        let record = caf(1, 100, 0);
        store.save(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        let record_dir = store.base_dir().join(&record.id);
        assert!(record_dir.join("metadata.json").is_file());
        assert_eq!(fs::read(record_dir.join("caf.xml")).unwrap(), record.xml);
        assert_eq!(fs::read(record_dir.join("firma_sii.bin")).unwrap(), record.firma_sii);
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(store.list_by_type(TipoDte::FacturaElectronica).await.unwrap().is_empty());
        assert!(!store.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_type_and_orders_by_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        let later = caf(101, 200, 0);
        let earlier = caf(1, 100, 0);
        let mut other_type = caf(1, 50, 0);
        other_type.tipo = TipoDte::NotaCredito;
        other_type.id = "other".into();
        for record in [&later, &earlier, &other_type] {
            store.save(record).await.unwrap();
        }

        let listed = store.list_by_type(TipoDte::FacturaElectronica).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![earlier.id.as_str(), later.id.as_str()]);
    }

    #[tokio::test]
    async fn update_state_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        let record = caf(1, 10, 0);
        store.save(&record).await.unwrap();
        store.update_state(&record.id, CafState::Vencido).await.unwrap();
        assert_eq!(store.get(&record.id).await.unwrap().unwrap().estado, CafState::Vencido);

        let err = store.update_state("missing", CafState::Vencido).await.unwrap_err();
        assert!(matches!(err, CafError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        let record = caf(1, 10, 0);
        store.save(&record).await.unwrap();
        assert!(store.delete(&record.id).await.unwrap());
        assert!(!dir.path().join(&record.id).exists());
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        for id in ["../escape", "a/b", "..", ""] {
            assert!(matches!(store.get(id).await, Err(CafError::InvalidId(_))), "{id}");
        }
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped_in_listings() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        store.save(&caf(1, 10, 0)).await.unwrap();
        let broken = dir.path().join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("metadata.json"), b"{not json").unwrap();
        assert_eq!(store.list_by_type(TipoDte::FacturaElectronica).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_saves_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        let mut tasks = Vec::new();
        for n in 0..16u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.save(&caf(n * 10 + 1, n * 10 + 10, 0)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.list_by_type(TipoDte::FacturaElectronica).await.unwrap().len(), 16);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FsCafStore::new(dir.path());
        let record = caf(1, 10, 0);
        store.save(&record).await.unwrap();
        let mode = fs::metadata(dir.path().join(&record.id).join("caf.xml"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
