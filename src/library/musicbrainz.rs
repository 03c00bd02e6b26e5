use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::Url;

use super::{LibraryError, Recording};
use crate::config::MetadataSettings;

/// Source of metadata for recordings the library has not stored yet.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_recording(&self, id: &str) -> Result<Recording, LibraryError>;
}

/// Looks recordings up through the MusicBrainz web service.
pub struct MusicBrainzClient {
    client: Client,
    base_url: Url,
}

impl MusicBrainzClient {
    pub fn new(settings: &MetadataSettings) -> Result<Self, LibraryError> {
        let base_url = Url::parse(&settings.musicbrainz_url).map_err(|e| {
            LibraryError::MetadataUnavailable(format!(
                "bad MusicBrainz url {}: {}",
                settings.musicbrainz_url, e
            ))
        })?;

        // MusicBrainz rejects requests without a meaningful user agent.
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout())
            .build()
            .map_err(|e| LibraryError::MetadataUnavailable(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    pub fn recording_url(&self, id: &str) -> Result<Url, LibraryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                LibraryError::MetadataUnavailable(format!("{} cannot be a base url", self.base_url))
            })?
            .pop_if_empty()
            .push("recording")
            .push(id);
        url.query_pairs_mut()
            .append_pair("inc", "artist-credits")
            .append_pair("fmt", "json");
        Ok(url)
    }
}

#[async_trait]
impl MetadataProvider for MusicBrainzClient {
    fn name(&self) -> &str {
        "musicbrainz"
    }

    async fn fetch_recording(&self, id: &str) -> Result<Recording, LibraryError> {
        let url = self.recording_url(id)?;
        log::info!("Fetching recording metadata: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LibraryError::MetadataUnavailable(format!("request failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => response
                .json::<Recording>()
                .await
                .map_err(|e| LibraryError::MetadataUnavailable(format!("bad response: {}", e))),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                Err(LibraryError::RecordingMetadataNotFound(id.to_string()))
            }
            status => Err(LibraryError::MetadataUnavailable(format!(
                "MusicBrainz returned {}",
                status
            ))),
        }
    }
}

/// Provider used when metadata lookups are disabled.
pub struct OfflineProvider;

#[async_trait]
impl MetadataProvider for OfflineProvider {
    fn name(&self) -> &str {
        "offline"
    }

    async fn fetch_recording(&self, id: &str) -> Result<Recording, LibraryError> {
        Err(LibraryError::MetadataUnavailable(format!(
            "metadata lookups are disabled, cannot resolve {}",
            id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> MetadataSettings {
        MetadataSettings {
            enabled: true,
            musicbrainz_url: url.into(),
            user_agent: "playit-tests/0".into(),
            timeout_ms: 1000,
        }
    }

    #[test]
    fn builds_recording_url() {
        let client = MusicBrainzClient::new(&settings("https://musicbrainz.org/ws/2/")).unwrap();
        let url = client
            .recording_url("5b11f4ce-a62d-471e-81fc-a69a8278c7da")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://musicbrainz.org/ws/2/recording/5b11f4ce-a62d-471e-81fc-a69a8278c7da?inc=artist-credits&fmt=json"
        );
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(MusicBrainzClient::new(&settings("not a url")).is_err());
    }

    #[test]
    fn parses_musicbrainz_payload() {
        let body = r#"{
            "id": "5b11f4ce-a62d-471e-81fc-a69a8278c7da",
            "title": "Smells Like Teen Spirit",
            "length": 301000,
            "video": false,
            "disambiguation": "",
            "first-release-date": "1991-09-10",
            "artist-credit": [
                {"name": "Nirvana", "joinphrase": "", "artist": {"id": "5b11f4ce-a62d-471e-81fc-a69a8278c7da", "name": "Nirvana"}}
            ]
        }"#;
        let recording: Recording = serde_json::from_str(body).unwrap();
        assert_eq!(recording.title, "Smells Like Teen Spirit");
        assert_eq!(recording.length, Some(301000));
        assert_eq!(recording.artist_line(), "Nirvana");
        assert_eq!(recording.first_release_date.as_deref(), Some("1991-09-10"));
    }

    #[tokio::test]
    async fn offline_provider_never_resolves() {
        let err = OfflineProvider.fetch_recording("x").await.unwrap_err();
        assert!(matches!(err, LibraryError::MetadataUnavailable(_)));
    }
}
