// Playlist model and the media playlist parser feeding the batch downloader.

use m3u8_rs::{KeyMethod, MediaPlaylist, parse_playlist_res};
use tracing::debug;
use url::Url;

use crate::DownloadError;
use crate::crypto::BLOCK_SIZE;
use crate::transport::SegmentFetch;

/// Extension used for per-segment cache files.
pub const SEGMENT_FILE_EXTENSION: &str = "ts";

/// Width of the zero-padded ordinal in segment file names.
pub const SEGMENT_NAME_WIDTH: usize = 6;

/// One entry of the playlist, addressed by its ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub index: usize,
    pub url: Url,
}

impl SegmentDescriptor {
    pub fn new(index: usize, url: Url) -> Self {
        Self { index, url }
    }

    /// Cache file name, e.g. `000007.ts`.
    pub fn file_name(&self) -> String {
        segment_file_name(self.index)
    }
}

pub fn segment_file_name(index: usize) -> String {
    format!(
        "{index:0width$}.{SEGMENT_FILE_EXTENSION}",
        width = SEGMENT_NAME_WIDTH
    )
}

/// Parses the ordinal back out of a cache file name.
pub fn parse_segment_index(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(SEGMENT_FILE_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[derive(Debug, Clone)]
pub struct Playlist {
    pub base_url: Url,
    pub key_url: Option<Url>,
    pub iv: Option<[u8; BLOCK_SIZE]>,
    pub encrypted: bool,
    pub segments: Vec<SegmentDescriptor>,
}

impl Playlist {
    /// Unencrypted playlist over already resolved segment URLs, indexed from 1.
    pub fn from_urls(base_url: Url, urls: impl IntoIterator<Item = Url>) -> Self {
        let segments = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| SegmentDescriptor::new(i + 1, url))
            .collect();
        Self {
            base_url,
            key_url: None,
            iv: None,
            encrypted: false,
            segments,
        }
    }

    /// Marks the playlist as AES-128 encrypted with the given key location.
    pub fn with_key(mut self, key_url: Url, iv: Option<[u8; BLOCK_SIZE]>) -> Self {
        self.key_url = Some(key_url);
        self.iv = iv;
        self.encrypted = true;
        self
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.segments.is_empty() {
            return Err(DownloadError::Playlist(
                "no TS files found in playlist".to_string(),
            ));
        }
        if self.encrypted && self.key_url.is_none() {
            return Err(DownloadError::Playlist(
                "playlist is encrypted but has no key URI".to_string(),
            ));
        }
        Ok(())
    }
}

/// Directory of the playlist URL; relative URIs are resolved against it.
pub fn base_url_of(playlist_url: &Url) -> Url {
    let mut base = playlist_url.clone();
    base.set_query(None);
    base.set_fragment(None);
    // `join` keeps everything up to the last '/', which is the directory.
    base.join("./").unwrap_or(base)
}

fn resolve(base: &Url, uri: &str) -> Result<Url, DownloadError> {
    base.join(uri.trim()).map_err(|e| {
        DownloadError::UrlError(format!("Could not join base URL {base} with URI {uri}: {e}"))
    })
}

fn parse_iv(iv_hex: &str) -> Result<[u8; BLOCK_SIZE], DownloadError> {
    let digits = iv_hex
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv = [0u8; BLOCK_SIZE];
    hex::decode_to_slice(digits, &mut iv)
        .map_err(|e| DownloadError::Playlist(format!("Failed to parse IV '{iv_hex}': {e}")))?;
    Ok(iv)
}

/// Parses media playlist text fetched from `playlist_url`.
///
/// Segment indices start at 1 in playlist order. The first `#EXT-X-KEY` with
/// `METHOD=AES-128` supplies the key URL and IV for the whole batch.
pub fn parse_playlist(content: &[u8], playlist_url: &Url) -> Result<Playlist, DownloadError> {
    let media = match parse_playlist_res(content) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => pl,
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
            return Err(DownloadError::Playlist(
                "master playlists are not supported, pass a media playlist URL".to_string(),
            ));
        }
        Err(e) => {
            return Err(DownloadError::Playlist(format!(
                "Failed to parse playlist {playlist_url}: {e}"
            )));
        }
    };

    from_media_playlist(&media, playlist_url)
}

fn from_media_playlist(
    media: &MediaPlaylist,
    playlist_url: &Url,
) -> Result<Playlist, DownloadError> {
    let base_url = base_url_of(playlist_url);

    let segments = media
        .segments
        .iter()
        .filter(|segment| !segment.uri.trim().is_empty())
        .enumerate()
        .map(|(i, segment)| Ok(SegmentDescriptor::new(i + 1, resolve(&base_url, &segment.uri)?)))
        .collect::<Result<Vec<_>, DownloadError>>()?;

    let mut playlist = Playlist {
        base_url,
        key_url: None,
        iv: None,
        encrypted: false,
        segments,
    };

    let key = media
        .segments
        .iter()
        .filter_map(|segment| segment.key.as_ref())
        .find(|key| key.method != KeyMethod::None);

    if let Some(key) = key {
        if key.method != KeyMethod::AES128 {
            return Err(DownloadError::Playlist(format!(
                "Unsupported encryption method: {:?}",
                key.method
            )));
        }
        let uri = key.uri.as_deref().ok_or_else(|| {
            DownloadError::Playlist("#EXT-X-KEY without URI".to_string())
        })?;
        let key_url = resolve(&playlist.base_url, uri)?;
        let iv = key.iv.as_deref().map(parse_iv).transpose()?;
        debug!(key_url = %key_url, has_iv = iv.is_some(), "Playlist is encrypted");
        playlist = playlist.with_key(key_url, iv);
    }

    playlist.validate()?;
    Ok(playlist)
}

/// Downloads and parses the media playlist at `url`.
pub async fn fetch_playlist(
    fetcher: &dyn SegmentFetch,
    url: &Url,
) -> Result<Playlist, DownloadError> {
    let content = fetcher.fetch(url).await?;
    parse_playlist(&content, url)
}
