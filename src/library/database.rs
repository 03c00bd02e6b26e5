use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use deadpool_sqlite::{Config as PoolConfig, Pool, Runtime};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::{
    LibraryError, MetadataProvider, PlaylistMetadata, Recording, RecordingMetadata,
    normalize_recording_id,
};
use crate::protocol::RecordingUpload;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS recordings (
        id       TEXT PRIMARY KEY,
        metadata TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS playlists (
        id       TEXT PRIMARY KEY,
        metadata TEXT NOT NULL
    );
";

const POOL_SIZE: usize = 4;

/// Cloneable handle to the on-disk library.
///
/// Queries run on pooled connections through [`Library::interact`], which
/// moves them onto tokio's blocking threads.
#[derive(Clone)]
pub struct Library {
    root: PathBuf,
    pool: Pool,
    provider: Arc<dyn MetadataProvider>,
}

impl Library {
    pub fn open(root: &Path, provider: Arc<dyn MetadataProvider>) -> Result<Library, LibraryError> {
        let audio_dir = root.join("audio");
        fs::create_dir_all(&audio_dir)
            .map_err(|e| LibraryError::io(format!("creating {}", audio_dir.display()), e))?;

        let db_path = root.join("library.db");
        Connection::open(&db_path)?.execute_batch(SCHEMA)?;

        let pool = PoolConfig::new(&db_path)
            .builder(Runtime::Tokio1)
            .map_err(|e| LibraryError::Background(format!("pool config: {}", e)))?
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| LibraryError::Background(format!("building pool: {}", e)))?;

        log::info!(
            "Library opened at {} (metadata provider: {})",
            root.display(),
            provider.name()
        );

        Ok(Library {
            root: root.to_path_buf(),
            pool,
            provider,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    fn audio_path(&self, hash: &str) -> PathBuf {
        self.audio_dir().join(hash)
    }

    /// Run `f` on a pooled connection.
    async fn interact<F, R>(&self, f: F) -> Result<R, LibraryError>
    where
        F: FnOnce(&Connection) -> Result<R, LibraryError> + Send + 'static,
        R: Send + 'static,
    {
        let connection = self
            .pool
            .get()
            .await
            .map_err(|e| LibraryError::Background(format!("database connection: {}", e)))?;

        connection
            .interact(move |connection| f(connection))
            .await
            .map_err(|e| LibraryError::Background(format!("database task: {}", e)))?
    }

    async fn load_metadata(&self, id: &str) -> Result<Option<RecordingMetadata>, LibraryError> {
        let id = id.to_string();
        self.interact(move |connection| {
            let row: Option<String> = connection
                .query_row(
                    "SELECT metadata FROM recordings WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            match row {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn store_metadata(
        &self,
        id: &str,
        metadata: &RecordingMetadata,
    ) -> Result<(), LibraryError> {
        let id = id.to_string();
        let text = serde_json::to_string(metadata)?;
        self.interact(move |connection| {
            connection.execute(
                "INSERT OR REPLACE INTO recordings (id, metadata) VALUES (?1, ?2)",
                params![id, text],
            )?;
            Ok(())
        })
        .await
    }

    /// Metadata for `id`, fetched from the provider and cached on first use.
    pub async fn recording_metadata(&self, id: &str) -> Result<RecordingMetadata, LibraryError> {
        let id = normalize_recording_id(id)?;

        if let Some(metadata) = self.load_metadata(&id).await? {
            return Ok(metadata);
        }

        let recording = self.provider.fetch_recording(&id).await?;
        let metadata = RecordingMetadata {
            audio_file_hash: None,
            recording,
        };
        self.store_metadata(&id, &metadata).await?;
        log::debug!("Cached metadata for recording {}", id);

        Ok(metadata)
    }

    /// Path of the stored audio file for `id`.
    ///
    /// A hash whose file has disappeared is cleared before reporting the
    /// recording as missing.
    pub async fn recording_file(&self, id: &str) -> Result<PathBuf, LibraryError> {
        let id = normalize_recording_id(id)?;

        let Some(mut metadata) = self.load_metadata(&id).await? else {
            return Err(LibraryError::RecordingFileNotFound(id));
        };

        let Some(hash) = metadata.audio_file_hash.clone() else {
            return Err(LibraryError::RecordingFileNotFound(id));
        };

        let path = self.audio_path(&hash);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            log::warn!(
                "Audio file {} for recording {} is gone, clearing hash",
                hash,
                id
            );
            metadata.audio_file_hash = None;
            self.store_metadata(&id, &metadata).await?;
            return Err(LibraryError::RecordingFileNotFound(id));
        }

        Ok(path)
    }

    pub async fn read_recording_file(&self, id: &str) -> Result<Vec<u8>, LibraryError> {
        let path = self.recording_file(id).await?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| LibraryError::io(format!("reading {}", path.display()), e))
    }

    /// Store `contents` as the audio file of `id`, or forget the file when
    /// `None`. Returns the content hash.
    pub async fn set_recording_file(
        &self,
        id: &str,
        contents: Option<Vec<u8>>,
    ) -> Result<Option<String>, LibraryError> {
        let mut metadata = self.recording_metadata(id).await?;
        let id = normalize_recording_id(id)?;

        let hash = match contents {
            Some(contents) => Some(self.write_audio(contents).await?),
            None => None,
        };

        metadata.audio_file_hash = hash.clone();
        self.store_metadata(&id, &metadata).await?;
        Ok(hash)
    }

    /// Store an uploaded recording. Supplied metadata replaces whatever the
    /// library had, otherwise it is looked up as usual.
    pub async fn import_recording(
        &self,
        upload: RecordingUpload,
    ) -> Result<RecordingMetadata, LibraryError> {
        let id = normalize_recording_id(&upload.id)?;

        let recording: Recording = match upload.recording {
            Some(recording) => recording,
            None => self.recording_metadata(&id).await?.recording,
        };

        let hash = self.write_audio(upload.contents).await?;
        let metadata = RecordingMetadata {
            audio_file_hash: Some(hash),
            recording,
        };
        self.store_metadata(&id, &metadata).await?;
        log::info!("Imported recording {} ({})", id, metadata.recording.title);

        Ok(metadata)
    }

    async fn write_audio(&self, contents: Vec<u8>) -> Result<String, LibraryError> {
        let audio_dir = self.audio_dir();
        tokio::task::spawn_blocking(move || store_audio(&audio_dir, &contents))
            .await
            .map_err(|e| LibraryError::Background(format!("storing audio: {}", e)))?
    }

    pub async fn playlist(&self, id: Uuid) -> Result<PlaylistMetadata, LibraryError> {
        self.interact(move |connection| {
            let row: Option<String> = connection
                .query_row(
                    "SELECT metadata FROM playlists WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(text) = row else {
                return Err(LibraryError::PlaylistNotFound(id));
            };
            Ok(serde_json::from_str(&text)?)
        })
        .await
    }

    pub async fn set_playlist(&self, metadata: &PlaylistMetadata) -> Result<(), LibraryError> {
        let id = metadata.id.to_string();
        let text = serde_json::to_string(metadata)?;
        self.interact(move |connection| {
            connection.execute(
                "INSERT OR REPLACE INTO playlists (id, metadata) VALUES (?1, ?2)",
                params![id, text],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_playlist(&self, id: Uuid) -> Result<(), LibraryError> {
        let removed = self
            .interact(move |connection| {
                let removed = connection
                    .execute("DELETE FROM playlists WHERE id = ?1", params![id.to_string()])?;
                Ok(removed)
            })
            .await?;
        if removed == 0 {
            return Err(LibraryError::PlaylistNotFound(id));
        }
        Ok(())
    }

    pub async fn playlists(&self) -> Result<Vec<PlaylistMetadata>, LibraryError> {
        let rows: Vec<String> = self
            .interact(|connection| {
                let mut statement = connection.prepare("SELECT metadata FROM playlists")?;
                let rows = statement
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut playlists = rows
            .iter()
            .map(|text| serde_json::from_str::<PlaylistMetadata>(text))
            .collect::<Result<Vec<_>, _>>()?;
        playlists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playlists)
    }
}

/// Write `contents` under its SHA-256 in `audio_dir`. Each writer gets its
/// own temp file, so concurrent stores of the same bytes both succeed.
fn store_audio(audio_dir: &Path, contents: &[u8]) -> Result<String, LibraryError> {
    let hash = format!("{:x}", Sha256::digest(contents));
    let path = audio_dir.join(&hash);

    if path.is_file() {
        return Ok(hash);
    }

    let mut partial = NamedTempFile::new_in(audio_dir)
        .map_err(|e| LibraryError::io(format!("creating temp file in {}", audio_dir.display()), e))?;
    partial
        .write_all(contents)
        .map_err(|e| LibraryError::io(format!("writing {}", partial.path().display()), e))?;
    partial
        .persist(&path)
        .map_err(|e| LibraryError::io(format!("storing {}", path.display()), e.error))?;

    log::debug!("Stored {} bytes as {}", contents.len(), hash);
    Ok(hash)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::library::ArtistCredit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const RECORDING_A: &str = "0a4c3f2e-1111-4c4c-8b8b-000000000001";
    pub(crate) const RECORDING_B: &str = "0a4c3f2e-1111-4c4c-8b8b-000000000002";

    /// Resolves any id to a synthetic recording and counts lookups.
    #[derive(Default)]
    pub(crate) struct StubProvider {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn fetch_recording(&self, id: &str) -> Result<Recording, LibraryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Recording {
                id: id.to_string(),
                title: format!("Recording {}", &id[id.len() - 4..]),
                length: Some(1000),
                artist_credit: vec![ArtistCredit {
                    name: "Stub".into(),
                    joinphrase: String::new(),
                }],
                first_release_date: None,
                disambiguation: None,
            })
        }
    }

    pub(crate) fn open_library(dir: &Path) -> (Library, Arc<StubProvider>) {
        let provider = Arc::new(StubProvider::default());
        let library = Library::open(dir, provider.clone()).unwrap();
        (library, provider)
    }

    #[tokio::test]
    async fn caches_fetched_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (library, provider) = open_library(dir.path());

        let first = library.recording_metadata(RECORDING_A).await.unwrap();
        let second = library
            .recording_metadata(&RECORDING_A.to_uppercase())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.audio_file_hash, None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_malformed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (library, provider) = open_library(dir.path());

        let err = library.recording_metadata("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, LibraryError::InvalidRecordingId(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stores_files_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (library, _) = open_library(dir.path());

        let hash = library
            .set_recording_file(RECORDING_A, Some(b"abc".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let path = library.recording_file(RECORDING_A).await.unwrap();
        assert_eq!(path, dir.path().join("audio").join(&hash));
        assert_eq!(library.read_recording_file(RECORDING_A).await.unwrap(), b"abc");

        // same bytes for another recording share the file
        let other = library
            .set_recording_file(RECORDING_B, Some(b"abc".to_vec()))
            .await
            .unwrap();
        assert_eq!(other.as_deref(), Some(hash.as_str()));

        library.set_recording_file(RECORDING_A, None).await.unwrap();
        assert!(matches!(
            library.recording_file(RECORDING_A).await,
            Err(LibraryError::RecordingFileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_imports_of_the_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (library, _) = open_library(dir.path());
        let contents = vec![5u8; 64 * 1024];

        let (first, second) = tokio::join!(
            library.set_recording_file(RECORDING_A, Some(contents.clone())),
            library.set_recording_file(RECORDING_B, Some(contents.clone())),
        );
        assert_eq!(first.unwrap(), second.unwrap());

        let stored: Vec<_> = fs::read_dir(dir.path().join("audio"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(library.read_recording_file(RECORDING_B).await.unwrap(), contents);
    }

    #[tokio::test]
    async fn clears_hash_of_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let (library, _) = open_library(dir.path());

        let path = {
            library
                .set_recording_file(RECORDING_A, Some(vec![1, 2, 3]))
                .await
                .unwrap();
            library.recording_file(RECORDING_A).await.unwrap()
        };
        fs::remove_file(path).unwrap();

        assert!(matches!(
            library.recording_file(RECORDING_A).await,
            Err(LibraryError::RecordingFileNotFound(_))
        ));
        let metadata = library.recording_metadata(RECORDING_A).await.unwrap();
        assert_eq!(metadata.audio_file_hash, None);
    }

    #[tokio::test]
    async fn import_uses_supplied_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (library, provider) = open_library(dir.path());

        let recording = Recording {
            id: RECORDING_B.into(),
            title: "Uploaded".into(),
            length: None,
            artist_credit: vec![],
            first_release_date: None,
            disambiguation: None,
        };
        let metadata = library
            .import_recording(RecordingUpload {
                id: RECORDING_B.into(),
                recording: Some(recording),
                contents: vec![9; 16],
            })
            .await
            .unwrap();

        assert_eq!(metadata.recording.title, "Uploaded");
        assert!(metadata.audio_file_hash.is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(library.recording_file(RECORDING_B).await.is_ok());
    }

    #[tokio::test]
    async fn playlists_round_trip_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let (library, _) = open_library(dir.path());
            assert!(matches!(
                library.playlist(id).await,
                Err(LibraryError::PlaylistNotFound(_))
            ));

            library
                .set_playlist(&PlaylistMetadata {
                    id,
                    name: "Morning".into(),
                    recordings: vec![RECORDING_A.into()],
                })
                .await
                .unwrap();
            library
                .set_playlist(&PlaylistMetadata {
                    id: Uuid::new_v4(),
                    name: "Evening".into(),
                    recordings: vec![],
                })
                .await
                .unwrap();
        }

        let (library, _) = open_library(dir.path());
        let playlist = library.playlist(id).await.unwrap();
        assert_eq!(playlist.name, "Morning");

        let names: Vec<String> = library
            .playlists()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Evening", "Morning"]);

        library.delete_playlist(id).await.unwrap();
        assert!(library.delete_playlist(id).await.is_err());
    }
}
