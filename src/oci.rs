use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, ensure, Context, Error};
use flate2::read::GzDecoder;
use nix::unistd::{chown, fchownat, FchownatFlags, Gid, Uid};
use oci_client::{
    manifest::{OciDescriptor, OciImageManifest},
    secrets::RegistryAuth,
    Client, Reference, RegistryOperation,
};
use serde::Deserialize;
use tokio::runtime::Runtime;

use crate::cancellation::CancellationToken;

const CANCELLATION_POLL_INTERVAL: u64 = 1_000;
const MIN_EXTRACTED_BYTES: u64 = 100 * 1024 * 1024;

/// Where a pull resolves an image reference to. `localhost/`-prefixed references attempt a
/// local container daemon before falling back here to the registry; a pre-staged OCI layout
/// directory skips network access entirely.
enum ImageSource {
    Registry(Reference),
    OciLayout(PathBuf),
    Daemon { socket: PathBuf, reference: String },
}

/// A single layer, already located on local disk (either downloaded to a temp file from a
/// registry, or read directly out of an OCI layout's blob store), ready to be streamed as an
/// uncompressed tar.
struct ResolvedLayer {
    path: PathBuf,
    gzip: bool,
}

impl ResolvedLayer {
    fn reader(&self) -> Result<Box<dyn Read>, Error> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open layer blob '{}'", self.path.display()))?;
        Ok(if self.gzip {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        })
    }
}

pub struct ExtractedImage {
    pub digest: String,
    pub layer_count: usize,
}

/// Strips the `sha256:` algorithm prefix a manifest digest carries, leaving the bare hex string
/// `Sha256Hash` expects. A digest using another algorithm is returned unchanged and will fail
/// `Sha256Hash`'s own validation rather than silently truncating.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Loads `image_reference` (or the pre-staged layout at `local_oci_layout`), applies each layer
/// to `target_root` in manifest order, and verifies the result. `target_root` must already exist.
pub fn extract_image(
    image_reference: &str,
    local_oci_layout: Option<&Path>,
    target_root: impl AsRef<Path>,
    token: &CancellationToken,
) -> Result<ExtractedImage, Error> {
    let target_root = target_root.as_ref();
    let target_root = fs::canonicalize(target_root)
        .with_context(|| format!("Target root '{}' does not exist", target_root.display()))?;

    let source = resolve_image_source(image_reference, local_oci_layout)?;
    let (layers, digest) = match &source {
        ImageSource::Registry(image_ref) => pull_registry_layers(image_ref)?,
        ImageSource::OciLayout(layout_root) => read_layout_layers(layout_root)?,
        ImageSource::Daemon { socket, reference } => pull_daemon_layers(socket, reference)?,
    };

    for (index, layer) in layers.iter().enumerate() {
        token.check_during_extraction(index)?;
        let reader = layer.reader()?;
        apply_layer(reader, &target_root, token, index)
            .with_context(|| format!("Failed while applying layer {index}"))?;
    }

    verify_extraction(&target_root)?;

    Ok(ExtractedImage {
        digest,
        layer_count: layers.len(),
    })
}

/// Resolves the manifest digest of `image_reference` (or the pre-staged layout at
/// `local_oci_layout`) without downloading any layer blobs. Used by the Updater Orchestrator to
/// decide whether an update has anything to do before paying for a full pull.
pub fn resolve_image_digest(
    image_reference: &str,
    local_oci_layout: Option<&Path>,
) -> Result<String, Error> {
    match resolve_image_source(image_reference, local_oci_layout)? {
        ImageSource::Registry(image_ref) => {
            let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
            let client = Client::default();
            runtime
                .block_on(client.auth(&image_ref, &RegistryAuth::Anonymous, RegistryOperation::Pull))
                .with_context(|| {
                    format!(
                        "Registry '{}' is not accessible or does not exist",
                        image_ref.registry()
                    )
                })?;
            let (_, digest): (OciImageManifest, String) = runtime
                .block_on(client.pull_image_manifest(&image_ref, &RegistryAuth::Anonymous))
                .with_context(|| format!("Failed to fetch manifest digest for '{image_reference}'"))?;
            Ok(digest)
        }
        ImageSource::OciLayout(layout_root) => {
            let index_bytes = fs::read(layout_root.join("index.json"))
                .context("Failed to read OCI layout index.json")?;
            let index: OciLayoutIndex = serde_json::from_slice(&index_bytes)
                .context("Failed to parse OCI layout index.json")?;
            let image_descriptor = index
                .manifests
                .first()
                .context("OCI layout index.json lists no manifests")?;
            Ok(image_descriptor.digest.clone())
        }
        ImageSource::Daemon { socket, reference } => daemon_image_digest(&socket, &reference),
    }
}

fn candidate_daemon_sockets() -> [&'static str; 3] {
    [
        "/run/docker.sock",
        "/var/run/docker.sock",
        "/run/podman/podman.sock",
    ]
}

fn resolve_image_source(
    image_reference: &str,
    local_oci_layout: Option<&Path>,
) -> Result<ImageSource, Error> {
    if let Some(layout_root) = local_oci_layout {
        ensure!(
            layout_root.join("index.json").is_file(),
            "'{}' does not look like an OCI layout directory (missing index.json)",
            layout_root.display()
        );
        return Ok(ImageSource::OciLayout(layout_root.to_path_buf()));
    }

    let image_ref = Reference::try_from(image_reference)
        .with_context(|| format!("Failed to parse image reference '{image_reference}'"))?;

    if image_reference.starts_with("localhost/") {
        if let Some(socket) = candidate_daemon_sockets()
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
        {
            return Ok(ImageSource::Daemon {
                socket: socket.to_path_buf(),
                reference: image_reference.to_string(),
            });
        }
    }

    Ok(ImageSource::Registry(image_ref))
}

fn pull_registry_layers(image_ref: &Reference) -> Result<(Vec<ResolvedLayer>, String), Error> {
    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    let client = Client::default();

    runtime
        .block_on(client.auth(image_ref, &RegistryAuth::Anonymous, RegistryOperation::Pull))
        .with_context(|| {
            format!(
                "Registry '{}' is not accessible or does not exist",
                image_ref.registry()
            )
        })?;

    let (manifest, digest): (OciImageManifest, String) = runtime
        .block_on(client.pull_image_manifest(image_ref, &RegistryAuth::Anonymous))
        .with_context(|| {
            format!(
                "Failed to pull manifest for '{}' from registry '{}'",
                image_ref.repository(),
                image_ref.registry()
            )
        })?;

    let temp_dir = tempfile::tempdir().context("Failed to create temporary directory for layer blobs")?;
    let mut layers = Vec::with_capacity(manifest.layers.len());
    for (index, descriptor) in manifest.layers.iter().enumerate() {
        let blob_path = temp_dir.path().join(format!("layer-{index}.blob"));
        runtime
            .block_on(pull_blob_to_file(&client, image_ref, descriptor, &blob_path))
            .with_context(|| format!("Failed to pull layer {index} ({})", descriptor.digest))?;
        layers.push(ResolvedLayer {
            path: blob_path,
            gzip: descriptor.media_type.contains("gzip"),
        });
    }

    // Keep the temp dir alive for the lifetime of the returned layers by leaking its handle;
    // the directory is removed by the OS at reboot if the process is killed before cleanup, and
    // by the orchestrator's own temp-root cleanup otherwise.
    let _ = temp_dir.into_path();

    Ok((layers, digest))
}

async fn pull_blob_to_file(
    client: &Client,
    image_ref: &Reference,
    descriptor: &OciDescriptor,
    dest: &Path,
) -> Result<(), Error> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create temporary blob file '{}'", dest.display()))?;
    client
        .pull_blob(image_ref, descriptor, &mut file)
        .await
        .context("Failed to download layer blob")?;
    Ok(())
}

#[derive(Deserialize)]
struct OciLayoutIndex {
    manifests: Vec<OciDescriptor>,
}

fn read_layout_layers(layout_root: &Path) -> Result<(Vec<ResolvedLayer>, String), Error> {
    let index_bytes = fs::read(layout_root.join("index.json"))
        .context("Failed to read OCI layout index.json")?;
    let index: OciLayoutIndex =
        serde_json::from_slice(&index_bytes).context("Failed to parse OCI layout index.json")?;
    let image_descriptor = index
        .manifests
        .first()
        .context("OCI layout index.json lists no manifests")?;

    let manifest_path = blob_path(layout_root, &image_descriptor.digest)?;
    let manifest_bytes =
        fs::read(&manifest_path).context("Failed to read OCI layout image manifest")?;
    let manifest: OciImageManifest =
        serde_json::from_slice(&manifest_bytes).context("Failed to parse OCI layout image manifest")?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for descriptor in &manifest.layers {
        layers.push(ResolvedLayer {
            path: blob_path(layout_root, &descriptor.digest)?,
            gzip: descriptor.media_type.contains("gzip"),
        });
    }

    Ok((layers, image_descriptor.digest.clone()))
}

fn blob_path(layout_root: &Path, digest: &str) -> Result<PathBuf, Error> {
    let (algorithm, hex) = digest
        .split_once(':')
        .with_context(|| format!("Malformed digest '{digest}'"))?;
    Ok(layout_root.join("blobs").join(algorithm).join(hex))
}

#[derive(Deserialize)]
struct DaemonImageInspect {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct DaemonSaveManifestEntry {
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Asks the daemon for the image's `Id` (its config digest, `sha256:...`) without exporting any
/// layer blobs. Used by [`resolve_image_digest`] to decide whether an update has anything to do.
fn daemon_image_digest(socket: &Path, reference: &str) -> Result<String, Error> {
    let body = daemon_http_get(socket, &format!("/images/{reference}/json"))?;
    let inspect: DaemonImageInspect = serde_json::from_slice(&body)
        .context("Failed to parse image inspect response from container daemon")?;
    Ok(inspect.id)
}

/// Exports `reference` from the daemon at `socket` via the Docker/Podman Engine API's `save`
/// endpoint (a tar of `manifest.json` plus one `layer.tar` per layer) and unpacks it to a temp
/// directory, mirroring how [`pull_registry_layers`] stages blobs on disk before extraction.
fn pull_daemon_layers(socket: &Path, reference: &str) -> Result<(Vec<ResolvedLayer>, String), Error> {
    let digest = daemon_image_digest(socket, reference)?;

    let export = daemon_http_get(socket, &format!("/images/{reference}/get"))?;

    let temp_dir =
        tempfile::tempdir().context("Failed to create temporary directory for daemon image export")?;
    tar::Archive::new(export.as_slice())
        .unpack(temp_dir.path())
        .context("Failed to unpack image export from container daemon")?;

    let manifest_bytes = fs::read(temp_dir.path().join("manifest.json"))
        .context("Failed to read manifest.json from daemon image export")?;
    let manifest: Vec<DaemonSaveManifestEntry> = serde_json::from_slice(&manifest_bytes)
        .context("Failed to parse manifest.json from daemon image export")?;
    let entry = manifest
        .first()
        .context("Daemon image export's manifest.json lists no images")?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer in &entry.layers {
        layers.push(ResolvedLayer {
            path: temp_dir.path().join(layer),
            gzip: false,
        });
    }

    // Keep the temp dir alive for the lifetime of the returned layers, same as
    // `pull_registry_layers`.
    let _ = temp_dir.into_path();

    Ok((layers, digest))
}

/// Minimal synchronous HTTP/1.1 GET over a Unix domain socket, enough to talk to the Docker and
/// Podman Engine APIs without pulling in an async HTTP stack for a single request/response.
fn daemon_http_get(socket: &Path, path: &str) -> Result<Vec<u8>, Error> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("Failed to connect to container daemon socket '{}'", socket.display()))?;
    write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .context("Failed to write request to container daemon socket")?;
    stream.flush().context("Failed to flush request to container daemon socket")?;

    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .context("Failed to read status line from container daemon")?;
    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .with_context(|| format!("Malformed HTTP status line from container daemon: '{}'", status_line.trim()))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    loop {
        let mut header_line = String::new();
        reader
            .read_line(&mut header_line)
            .context("Failed to read headers from container daemon")?;
        let header_line = header_line.trim_end();
        if header_line.is_empty() {
            break;
        }
        if let Some((name, value)) = header_line.split_once(':') {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().ok(),
                "transfer-encoding" if value.eq_ignore_ascii_case("chunked") => chunked = true,
                _ => {}
            }
        }
    }

    let body = if chunked {
        read_chunked_body(&mut reader)?
    } else if let Some(len) = content_length {
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .context("Failed to read response body from container daemon")?;
        buf
    } else {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .context("Failed to read response body from container daemon")?;
        buf
    };

    ensure!(
        status_code == 200,
        "container daemon returned HTTP {status_code} for '{path}'"
    );
    Ok(body)
}

/// Decodes an HTTP chunked transfer body: a hex chunk size, `\r\n`, the chunk bytes, `\r\n`,
/// repeated until a zero-size chunk terminates the stream.
fn read_chunked_body(reader: &mut impl BufRead) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader
            .read_line(&mut size_line)
            .context("Failed to read chunk size from container daemon")?;
        let size_line = size_line.trim();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or(size_line), 16)
            .with_context(|| format!("Malformed chunk size '{size_line}' from container daemon"))?;
        if size == 0 {
            let mut trailer = String::new();
            reader
                .read_line(&mut trailer)
                .context("Failed to read chunked trailer from container daemon")?;
            break;
        }

        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .context("Failed to read chunk body from container daemon")?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .context("Failed to read chunk terminator from container daemon")?;
    }
    Ok(body)
}

/// Normalizes `entry_path` against `root` without touching the filesystem (the path may not
/// exist yet) and rejects any `..` that would escape `root`, or any absolute component.
fn safe_target_path(root: &Path, entry_path: &Path) -> Result<PathBuf, Error> {
    let mut joined = root.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !joined.pop() {
                    bail!("path traversal: entry '{}' escapes target root", entry_path.display());
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("path traversal: entry '{}' is absolute", entry_path.display());
            }
        }
    }
    ensure!(
        joined.starts_with(root),
        "path traversal: entry '{}' escapes target root",
        entry_path.display()
    );
    Ok(joined)
}

fn apply_layer(
    reader: impl Read,
    target_root: &Path,
    token: &CancellationToken,
    layer_index: usize,
) -> Result<(), Error> {
    let mut archive = tar::Archive::new(reader);

    for (count, entry) in archive.entries()?.enumerate() {
        if count % CANCELLATION_POLL_INTERVAL as usize == 0 {
            token.check_during_extraction(layer_index)?;
        }

        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let target_path = safe_target_path(target_root, &entry_path)?;

        let file_name = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if file_name == ".wh..wh..opq" {
            apply_opaque_whiteout(&target_path)?;
            continue;
        }
        if let Some(whited_out) = file_name.strip_prefix(".wh.") {
            apply_whiteout(&target_path, whited_out)?;
            continue;
        }

        let uid = entry.header().uid()? as u32;
        let gid = entry.header().gid()? as u32;
        let mode = entry.header().mode()?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target_path).with_context(|| {
                    format!("Failed to create directory '{}'", target_path.display())
                })?;
                chown_path(&target_path, uid, gid)?;
                fs::set_permissions(&target_path, fs::Permissions::from_mode(mode))?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target_path).with_context(|| {
                    format!("Failed to create file '{}'", target_path.display())
                })?;
                std::io::copy(&mut entry, &mut out).with_context(|| {
                    format!("Failed to write contents of '{}'", target_path.display())
                })?;
                drop(out);
                chown_path(&target_path, uid, gid)?;
                fs::set_permissions(&target_path, fs::Permissions::from_mode(mode))?;
            }
            tar::EntryType::Symlink => {
                let link_target = entry
                    .link_name()?
                    .context("Symlink entry has no link name")?
                    .into_owned();
                remove_any(&target_path)?;
                if let Some(parent) = target_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                symlink(&link_target, &target_path).with_context(|| {
                    format!("Failed to create symlink '{}'", target_path.display())
                })?;
                lchown_path(&target_path, uid, gid)?;
            }
            tar::EntryType::Link => {
                let link_name = entry
                    .link_name()?
                    .context("Hard link entry has no link name")?
                    .into_owned();
                let link_source = safe_target_path(target_root, &link_name)?;
                if let Some(parent) = target_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                if fs::hard_link(&link_source, &target_path).is_err() {
                    fs::copy(&link_source, &target_path).with_context(|| {
                        format!(
                            "Failed to hard link or copy '{}' to '{}'",
                            link_source.display(),
                            target_path.display()
                        )
                    })?;
                    chown_path(&target_path, uid, gid)?;
                    fs::set_permissions(&target_path, fs::Permissions::from_mode(mode))?;
                }
            }
            other => {
                log::warn!(
                    "Skipping unsupported tar entry type {other:?} at '{}'",
                    target_path.display()
                );
            }
        }
    }

    Ok(())
}

/// Empties the directory named by `target_path` (the directory containing the opaque whiteout
/// marker) and recreates it, except when its basename is `boot` or `efi` — those hold the ESP
/// layout the partitioner already prepared and must not be touched by image content.
fn apply_opaque_whiteout(target_path: &Path) -> Result<(), Error> {
    let Some(dir) = target_path.parent() else {
        return Ok(());
    };
    if matches!(dir.file_name().and_then(|n| n.to_str()), Some("boot") | Some("efi")) {
        return Ok(());
    }
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to empty directory '{}' for opaque whiteout", dir.display()))?;
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to recreate directory '{}' after opaque whiteout", dir.display()))
}

fn apply_whiteout(target_path: &Path, whited_out_name: &str) -> Result<(), Error> {
    let Some(dir) = target_path.parent() else {
        return Ok(());
    };
    let victim = dir.join(whited_out_name);
    remove_any(&victim)
}

fn remove_any(path: &Path) -> Result<(), Error> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory '{}'", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("Failed to remove file '{}'", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to stat '{}'", path.display())),
    }
}

fn chown_path(path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .with_context(|| format!("Failed to chown '{}'", path.display()))
}

fn lchown_path(path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
    fchownat(
        None,
        path,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
        FchownatFlags::NoFollowSymlink,
    )
    .with_context(|| format!("Failed to lchown '{}'", path.display()))
}

/// Fails if any of the core directories or `os-release` is missing, or if fewer than 100 MiB
/// were extracted in total. Catches silent extraction failures that would otherwise leave an
/// unbootable slot.
pub fn verify_extraction(target_root: impl AsRef<Path>) -> Result<(), Error> {
    let target_root = target_root.as_ref();

    for relative in ["usr", "usr/bin", "usr/lib", "etc"] {
        let path = target_root.join(relative);
        ensure!(
            path.is_dir(),
            "Extraction verification failed: '{}' is missing or not a directory",
            path.display()
        );
    }

    let os_release = target_root.join("usr/lib/os-release");
    ensure!(
        os_release.is_file(),
        "Extraction verification failed: '{}' is missing or not a file",
        os_release.display()
    );

    let total_bytes = total_extracted_bytes(target_root, MIN_EXTRACTED_BYTES)?;
    ensure!(
        total_bytes >= MIN_EXTRACTED_BYTES,
        "Extraction verification failed: only {total_bytes} bytes extracted, expected at least {MIN_EXTRACTED_BYTES}"
    );

    Ok(())
}

/// Walks `root` summing file sizes, stopping as soon as `threshold` is crossed.
fn total_extracted_bytes(root: &Path, threshold: u64) -> Result<u64, Error> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to read '{}'", dir.display())),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
            if total >= threshold {
                return Ok(total);
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_target_path_rejects_parent_escape() {
        let root = Path::new("/tmp/nbc-root");
        let err = safe_target_path(root, Path::new("../../etc/passwd")).unwrap_err();
        assert!(err.to_string().contains("escapes target root"));
    }

    #[test]
    fn test_safe_target_path_rejects_absolute_entry() {
        let root = Path::new("/tmp/nbc-root");
        let err = safe_target_path(root, Path::new("/etc/passwd")).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_safe_target_path_accepts_normal_entry() {
        let root = Path::new("/tmp/nbc-root");
        let resolved = safe_target_path(root, Path::new("usr/bin/ls")).unwrap();
        assert_eq!(resolved, root.join("usr/bin/ls"));
    }

    #[test]
    fn test_resolve_image_source_rejects_layout_without_index() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_image_source("localhost/whatever:latest", Some(dir.path())).unwrap_err();
        assert!(err.to_string().contains("index.json"));
    }

    #[test]
    fn test_resolve_image_digest_reads_layout_index_without_pulling_blobs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.json"),
            r#"{"manifests":[{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:deadbeef","size":123}]}"#,
        )
        .unwrap();
        let digest = resolve_image_digest("localhost/mock:v2", Some(dir.path())).unwrap();
        assert_eq!(digest, "sha256:deadbeef");
    }

    #[test]
    fn test_digest_hex_strips_algorithm_prefix() {
        assert_eq!(digest_hex("sha256:deadbeef"), "deadbeef");
        assert_eq!(digest_hex("deadbeef"), "deadbeef");
    }

    #[test]
    fn test_verify_extraction_fails_on_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_extraction(dir.path()).unwrap_err();
        assert!(err.to_string().contains("usr"));
    }

    #[test]
    fn test_apply_opaque_whiteout_skips_boot_directory() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("vmlinuz"), b"kernel").unwrap();
        apply_opaque_whiteout(&boot.join(".wh..wh..opq")).unwrap();
        assert!(boot.join("vmlinuz").exists());
    }

    #[test]
    fn test_apply_opaque_whiteout_empties_other_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("some-dir");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.txt"), b"old").unwrap();
        apply_opaque_whiteout(&target.join(".wh..wh..opq")).unwrap();
        assert!(target.is_dir());
        assert!(!target.join("stale.txt").exists());
    }

    #[test]
    fn test_apply_whiteout_removes_named_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gone.txt"), b"bye").unwrap();
        apply_whiteout(&dir.path().join(".wh.gone.txt"), "gone.txt").unwrap();
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[test]
    fn test_read_chunked_body_reassembles_chunks() {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let body = read_chunked_body(&mut std::io::BufReader::new(&raw[..])).unwrap();
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn test_read_chunked_body_handles_empty_stream() {
        let raw = b"0\r\n\r\n";
        let body = read_chunked_body(&mut std::io::BufReader::new(&raw[..])).unwrap();
        assert!(body.is_empty());
    }
}
