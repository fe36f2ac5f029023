//! src/services/object_gateway.rs
//!
//! ObjectStoreGateway — the capability the URL lifecycle manager consumes to
//! mint and revoke download links. `LocalObjectStore` is the production
//! implementation: payloads live on local disk sharded beneath
//! `base_path/{shard}/{shard}/{key}` and links are HMAC-signed query strings
//! served back by `GET /files/{*key}`.

use crate::models::resource::SignedUrl;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use hmac::{Hmac, Mac};
use md5::Context;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Characters left untouched when a key segment is placed in a URL path.
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("signing `{key}` failed: {reason}")]
    Signing { key: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Sign and revoke links for objects held by an external store.
#[async_trait]
pub trait ObjectStoreGateway: Send + Sync {
    /// Mint a link for `key` valid for `ttl` from now.
    async fn sign(&self, key: &str, ttl: Duration) -> GatewayResult<SignedUrl>;

    /// Remove the object behind `key`. Outstanding links stop resolving.
    async fn delete(&self, key: &str) -> GatewayResult<()>;
}

/// Why a presented link was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("signature does not match")]
    BadSignature,
    #[error("link expired")]
    Expired,
}

/// An upload written next to its final location but not yet visible under
/// its key. Publish it with [`LocalObjectStore::commit`] or drop it with
/// [`LocalObjectStore::discard`].
#[derive(Debug)]
pub struct StagedObject {
    pub key: String,
    pub size_bytes: i64,
    pub etag: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

/// Disk-backed object store that issues HMAC-signed links.
pub struct LocalObjectStore {
    base_path: PathBuf,
    public_base_url: String,
    secret: Vec<u8>,
}

/// Reject keys that could escape `base_path` or break URL construction.
pub fn ensure_key_safe(key: &str) -> GatewayResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(GatewayError::InvalidObjectKey);
    }
    if key.starts_with('/') || key.ends_with('/') || key.contains("..") || key.contains("//") {
        return Err(GatewayError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(GatewayError::InvalidObjectKey);
    }
    Ok(())
}

impl LocalObjectStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Two-level shard directories derived from MD5(key), as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn mac(&self, key: &str, expires: i64) -> GatewayResult<HmacSha256> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|err| GatewayError::Signing {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Build the public link for `key` expiring at the unix second `expires`.
    fn link(&self, key: &str, expires: i64) -> GatewayResult<String> {
        let signature = URL_SAFE_NO_PAD.encode(self.mac(key, expires)?.finalize().into_bytes());
        let path = key
            .split('/')
            .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/files/{}?expires={}&signature={}",
            self.public_base_url, path, expires, signature
        ))
    }

    /// Check a presented link. Signature is compared in constant time.
    pub fn verify(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LinkError> {
        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| LinkError::BadSignature)?;
        let mac = self.mac(key, expires).map_err(|_| LinkError::BadSignature)?;
        mac.verify_slice(&presented)
            .map_err(|_| LinkError::BadSignature)?;
        if now.timestamp() >= expires {
            return Err(LinkError::Expired);
        }
        Ok(())
    }

    /// Stream an upload to a temp file in the key's shard directory and fsync
    /// it. Nothing is visible under `key` until the staged file is committed,
    /// so a failed or rejected upload never touches an existing payload.
    pub async fn stage_stream<S>(&self, key: &str, stream: S) -> GatewayResult<StagedObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_key_safe(key)?;
        let final_path = self.object_path(key);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            GatewayError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(GatewayError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(GatewayError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }
        drop(file);

        debug!(key, size_bytes, "staged object");
        Ok(StagedObject {
            key: key.to_string(),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
            tmp_path,
            final_path,
        })
    }

    /// Rename a staged upload into place, replacing any payload under its key.
    pub async fn commit(&self, staged: &StagedObject) -> GatewayResult<()> {
        fs::rename(&staged.tmp_path, &staged.final_path).await?;
        debug!(key = %staged.key, "committed object");
        Ok(())
    }

    /// Remove a staged upload that will not be committed. A no-op once the
    /// upload was committed.
    pub async fn discard(&self, staged: &StagedObject) {
        match fs::remove_file(&staged.tmp_path).await {
            Ok(()) => {
                if let Some(parent) = staged.tmp_path.parent() {
                    self.prune_empty_dirs(parent).await;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!(
                "failed to remove staged upload {}: {}",
                staged.tmp_path.display(),
                err
            ),
        }
    }

    pub async fn exists(&self, key: &str) -> GatewayResult<bool> {
        ensure_key_safe(key)?;
        Ok(fs::try_exists(self.object_path(key)).await?)
    }

    /// Open an object for streaming out.
    pub async fn open(&self, key: &str) -> GatewayResult<File> {
        ensure_key_safe(key)?;
        File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                GatewayError::ObjectNotFound(key.to_string())
            } else {
                GatewayError::Io(err)
            }
        })
    }

    /// Remove empty shard directories up to (not including) `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStoreGateway for LocalObjectStore {
    async fn sign(&self, key: &str, ttl: Duration) -> GatewayResult<SignedUrl> {
        if !self.exists(key).await? {
            return Err(GatewayError::ObjectNotFound(key.to_string()));
        }
        let expires_at = Utc::now() + ttl;
        let url = self.link(key, expires_at.timestamp())?;
        // Links carry whole seconds; report the instant they actually lapse.
        let expires_at = DateTime::from_timestamp(expires_at.timestamp(), 0).unwrap_or(expires_at);
        Ok(SignedUrl { url, expires_at })
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(GatewayError::ObjectNotFound(key.to_string()));
            }
            Err(err) => return Err(GatewayError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}
