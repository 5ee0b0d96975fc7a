use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::id::ObjectId;
use crate::image;
use crate::paths::SOURCE_FILE;
use crate::store::BtrfsStore;

const REGISTRY_BASE: &str = "https://registry-1.docker.io";
const AUTH_BASE: &str = "https://auth.docker.io";
const AUTH_SERVICE: &str = "registry.docker.io";

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    digest: String,
}

/// A single-platform image manifest: ordered layers plus a config blob the
/// engine has no use for.
#[derive(Debug, Deserialize)]
struct ImageManifest {
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

/// A multi-platform manifest index, resolved to the host architecture.
#[derive(Debug, Deserialize)]
struct ImageIndex {
    manifests: Vec<IndexEntry>,
}

/// Fetch `name:tag` from the registry and materialize it as a new image.
///
/// Layers are overlaid into a staging directory in manifest order, the
/// origin reference is seeded, and the staging tree is handed to `init`.
/// The staging directory lives under the process temp root and is removed
/// on every exit path.
pub async fn pull(
    config: &EngineConfig,
    store: &BtrfsStore,
    name: &str,
    tag: &str,
) -> Result<ObjectId> {
    let staging = tempfile::Builder::new()
        .prefix("skiff-pull-")
        .tempdir()
        .map_err(|e| EngineError::Registry(format!("create staging dir: {e}")))?;

    fetch_image(name, tag, staging.path()).await?;

    tokio::fs::write(staging.path().join(SOURCE_FILE), format!("{name}:{tag}"))
        .await
        .map_err(|e| EngineError::Registry(format!("seed image source: {e}")))?;

    let id = image::init(config, store, staging.path()).await?;
    info!(%id, name, tag, "pull complete");
    Ok(id)
}

async fn fetch_image(name: &str, tag: &str, staging: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent("skiff")
        .build()
        .map_err(|e| EngineError::Registry(format!("http client: {e}")))?;

    let repo = repository_path(name);
    let token = fetch_token(&client, &repo).await?;
    let manifest = fetch_manifest(&client, &token, &repo, tag).await?;

    info!(layers = manifest.layers.len(), "downloading image layers");

    for (index, layer) in manifest.layers.iter().enumerate() {
        let tarball = staging.join(format!("layer-{index}.tar"));
        download_blob(&client, &token, &repo, layer, &tarball).await?;
        extract_layer(&tarball, staging, is_gzip_layer(&layer.media_type)).await?;
        tokio::fs::remove_file(&tarball)
            .await
            .map_err(|e| EngineError::Registry(format!("remove layer tarball: {e}")))?;
    }
    Ok(())
}

/// Bare official images live under the `library/` namespace.
fn repository_path(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    }
}

/// Registry platform name for the host architecture.
fn registry_architecture() -> Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("amd64"),
        "aarch64" => Ok("arm64"),
        other => Err(EngineError::Precondition(format!(
            "unsupported architecture: {other}"
        ))),
    }
}

fn is_gzip_layer(media_type: &str) -> bool {
    media_type.ends_with("gzip")
}

fn select_platform_digest(index: &ImageIndex, arch: &str) -> Option<String> {
    index
        .manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.architecture == arch && p.os == "linux")
        })
        .map(|entry| entry.digest.clone())
}

async fn fetch_token(client: &reqwest::Client, repo: &str) -> Result<String> {
    let url =
        format!("{AUTH_BASE}/token?service={AUTH_SERVICE}&scope=repository:{repo}:pull");
    let bytes = client
        .get(&url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| EngineError::Registry(format!("token request: {e}")))?
        .bytes()
        .await
        .map_err(|e| EngineError::Registry(format!("token body: {e}")))?;
    let response: TokenResponse = serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::Registry(format!("token decode: {e}")))?;
    Ok(response.token)
}

/// Fetch the manifest for a reference, resolving a multi-platform index to
/// the host architecture's image manifest.
async fn fetch_manifest(
    client: &reqwest::Client,
    token: &str,
    repo: &str,
    tag: &str,
) -> Result<ImageManifest> {
    let mut reference = tag.to_string();

    // At most two hops: index -> platform manifest.
    for _ in 0..2 {
        let url = format!("{REGISTRY_BASE}/v2/{repo}/manifests/{reference}");
        let bytes = client
            .get(&url)
            .bearer_auth(token)
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| EngineError::Registry(format!("manifest request: {e}")))?
            .bytes()
            .await
            .map_err(|e| EngineError::Registry(format!("manifest body: {e}")))?;

        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Registry(format!("manifest decode: {e}")))?;

        if value.get("manifests").is_some() {
            let index: ImageIndex = serde_json::from_value(value)
                .map_err(|e| EngineError::Registry(format!("manifest index decode: {e}")))?;
            let arch = registry_architecture()?;
            reference = select_platform_digest(&index, arch).ok_or_else(|| {
                EngineError::Registry(format!("no {arch}/linux manifest in index"))
            })?;
            continue;
        }

        return serde_json::from_value(value)
            .map_err(|e| EngineError::Registry(format!("image manifest decode: {e}")));
    }

    Err(EngineError::Registry(
        "manifest index did not resolve to an image manifest".to_string(),
    ))
}

/// Stream a layer blob to disk, verifying its sha256 digest on the way.
async fn download_blob(
    client: &reqwest::Client,
    token: &str,
    repo: &str,
    layer: &Descriptor,
    dest: &Path,
) -> Result<()> {
    let url = format!("{REGISTRY_BASE}/v2/{repo}/blobs/{}", layer.digest);
    let mut response = client
        .get(&url)
        .bearer_auth(token)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| EngineError::Registry(format!("blob request: {e}")))?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| EngineError::Registry(format!("create {}: {e}", dest.display())))?;
    let mut hasher = Sha256::new();

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| EngineError::Registry(format!("blob chunk: {e}")))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| EngineError::Registry(format!("write {}: {e}", dest.display())))?;
    }
    file.flush()
        .await
        .map_err(|e| EngineError::Registry(format!("flush {}: {e}", dest.display())))?;

    verify_digest(&layer.digest, &format!("{:x}", hasher.finalize()))
}

fn verify_digest(expected: &str, actual_hex: &str) -> Result<()> {
    match expected.strip_prefix("sha256:") {
        Some(expected_hex) if expected_hex == actual_hex => Ok(()),
        Some(expected_hex) => Err(EngineError::Registry(format!(
            "layer digest mismatch: expected {expected_hex}, got {actual_hex}"
        ))),
        None => {
            warn!(digest = expected, "unrecognized digest scheme; skipping verification");
            Ok(())
        }
    }
}

/// Unpack one layer tarball over the staging tree. Later layers overwrite
/// earlier ones; whiteout entries land as plain files.
async fn extract_layer(tarball: &Path, staging: &Path, gzip: bool) -> Result<()> {
    let tarball = tarball.to_path_buf();
    let dest = staging.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::open(&tarball)?;
        if gzip {
            unpack(flate2::read::GzDecoder::new(file), &dest)
        } else {
            unpack(file, &dest)
        }
    })
    .await
    .map_err(|e| EngineError::Registry(format!("extract task: {e}")))?
    .map_err(|e| EngineError::Registry(format!("extract layer: {e}")))
}

fn unpack<R: std::io::Read>(reader: R, dest: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn official_images_get_the_library_namespace() {
        assert_eq!(repository_path("busybox"), "library/busybox");
        assert_eq!(repository_path("alpine"), "library/alpine");
    }

    #[test]
    fn namespaced_repositories_pass_through() {
        assert_eq!(repository_path("grafana/loki"), "grafana/loki");
    }

    #[test]
    fn gzip_detection_covers_docker_and_oci_media_types() {
        assert!(is_gzip_layer("application/vnd.docker.image.rootfs.diff.tar.gzip"));
        assert!(is_gzip_layer("application/vnd.oci.image.layer.v1.tar+gzip"));
        assert!(!is_gzip_layer("application/vnd.oci.image.layer.v1.tar"));
    }

    #[test]
    fn manifest_layers_preserve_order() {
        let json = r#"{
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:cfg"},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:base"},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:mid"},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:top"}
            ]
        }"#;
        let manifest: ImageManifest = serde_json::from_str(json).unwrap();
        let digests: Vec<&str> = manifest.layers.iter().map(|l| l.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:base", "sha256:mid", "sha256:top"]);
    }

    #[test]
    fn index_resolution_picks_the_matching_platform() {
        let json = r#"{
            "manifests": [
                {"digest": "sha256:arm", "platform": {"architecture": "arm64", "os": "linux"}},
                {"digest": "sha256:amd", "platform": {"architecture": "amd64", "os": "linux"}},
                {"digest": "sha256:win", "platform": {"architecture": "amd64", "os": "windows"}}
            ]
        }"#;
        let index: ImageIndex = serde_json::from_str(json).unwrap();
        assert_eq!(select_platform_digest(&index, "amd64").as_deref(), Some("sha256:amd"));
        assert_eq!(select_platform_digest(&index, "arm64").as_deref(), Some("sha256:arm"));
        assert_eq!(select_platform_digest(&index, "riscv64"), None);
    }

    #[test]
    fn index_entries_without_platforms_are_skipped() {
        let json = r#"{"manifests": [{"digest": "sha256:att"}]}"#;
        let index: ImageIndex = serde_json::from_str(json).unwrap();
        assert_eq!(select_platform_digest(&index, "amd64"), None);
    }

    #[test]
    fn token_response_decodes() {
        let json = r#"{"token": "abc123", "expires_in": 300}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.token, "abc123");
    }

    #[test]
    fn digest_verification_accepts_a_match() {
        assert!(verify_digest("sha256:ab12", "ab12").is_ok());
    }

    #[test]
    fn digest_verification_rejects_a_mismatch() {
        let err = verify_digest("sha256:ab12", "cd34").unwrap_err();
        assert!(matches!(err, EngineError::Registry(_)));
    }

    #[test]
    fn unknown_digest_schemes_are_tolerated() {
        assert!(verify_digest("blake3:ab12", "cd34").is_ok());
    }

    #[tokio::test]
    async fn extract_layers_overlay_in_order() {
        let staging = tempfile::tempdir().unwrap();

        let make_layer = |name: &str, content: &str| {
            let mut builder = tar::Builder::new(Vec::new());
            let data = content.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, data).unwrap();
            builder.into_inner().unwrap()
        };

        let base = staging.path().join("base.tar");
        tokio::fs::write(&base, make_layer("etc-issue", "base")).await.unwrap();
        extract_layer(&base, staging.path(), false).await.unwrap();

        let top = staging.path().join("top.tar");
        tokio::fs::write(&top, make_layer("etc-issue", "top")).await.unwrap();
        extract_layer(&top, staging.path(), false).await.unwrap();

        let content = tokio::fs::read_to_string(staging.path().join("etc-issue"))
            .await
            .unwrap();
        assert_eq!(content, "top");
    }
}
