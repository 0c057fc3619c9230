//! Custom release installation
//!
//! When the options request an alternate build of the wrapped server, the
//! archive is downloaded, identified by content, and extracted under a fixed
//! target directory. This is the most security-sensitive path in the
//! wrapper: the archive comes from the network and is written to the
//! filesystem, so every entry path is validated before anything lands on
//! disk, and any violation fails the whole install.

use flate2::read::GzDecoder;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// Default directory a custom release is installed into
const TARGET_DEFAULT: &str = "/opt/duplicati/custom";
/// Environment variable overriding the installation target
const TARGET_ENV: &str = "CUSTOM_RELEASE_TARGET";
/// Executable expected inside every release bundle
const EXECUTABLE_DEFAULT: &str = "duplicati-server";
/// Environment variable overriding the expected executable name
const EXECUTABLE_ENV: &str = "CUSTOM_RELEASE_EXECUTABLE";
/// Required prefix of the single top-level directory inside the archive
const BUNDLE_PREFIX: &str = "duplicati-";

/// Everything that can go wrong while installing a custom release.
/// Every variant aborts the install; there is no partial or best-effort
/// outcome.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("cannot download custom release from {url}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("cannot download custom release from {url}: got {status}")]
    DownloadStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("cannot buffer custom release locally")]
    Buffer(#[source] std::io::Error),
    #[error("custom release does not comply with a supported archive format")]
    UnsupportedFormat,
    #[error("archive entry {0:?} does not comply with the expected bundle layout")]
    UnexpectedLayout(PathBuf),
    #[error("cannot extract custom release")]
    Extract(#[source] std::io::Error),
    #[error("custom release does not contain expected executable {0:?}")]
    MissingExecutable(String),
}

/// Supported archive formats, identified from content rather than file
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

/// Download and install the release at `url`, returning the absolute path
/// of the verified executable.
pub async fn install(url: &str) -> Result<PathBuf, InstallError> {
    info!(url, "downloading custom release, this could take a few minutes...");

    let mut response = reqwest::get(url)
        .await
        .map_err(|source| InstallError::Download {
            url: url.to_string(),
            source,
        })?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(InstallError::DownloadStatus {
            url: url.to_string(),
            status: response.status(),
        });
    }

    // Fully materialize the download first: format identification and zip
    // extraction both need to seek.
    let mut buffer = NamedTempFile::new().map_err(InstallError::Buffer)?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|source| InstallError::Download {
            url: url.to_string(),
            source,
        })?
    {
        buffer.write_all(&chunk).map_err(InstallError::Buffer)?;
    }
    buffer.flush().map_err(InstallError::Buffer)?;

    info!(url, "extracting custom release, this could take a few minutes...");

    let target = std::path::absolute(install_target()).map_err(InstallError::Buffer)?;
    let executable_name = executable_name();
    let archive = buffer.into_file();

    let installed = tokio::task::spawn_blocking(move || {
        install_from(archive, &target, &executable_name)
    })
    .await
    .map_err(|e| InstallError::Extract(std::io::Error::other(e)))??;

    info!(url, executable = %installed.display(), "custom release downloaded and extracted");
    Ok(installed)
}

/// Identify and extract a buffered archive into `target`, verifying the
/// expected executable was among the extracted files.
fn install_from(
    mut archive: std::fs::File,
    target: &Path,
    executable_name: &str,
) -> Result<PathBuf, InstallError> {
    archive
        .seek(SeekFrom::Start(0))
        .map_err(InstallError::Buffer)?;
    let format = identify(&mut archive)?;
    archive
        .seek(SeekFrom::Start(0))
        .map_err(InstallError::Buffer)?;

    // The result must reflect exactly the new archive, never stale files
    // from a previous release.
    match std::fs::remove_dir_all(target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(InstallError::Extract(e)),
    }

    let executable = target.join(executable_name);
    let result = match format {
        ArchiveFormat::Zip => extract_zip(archive, target, &executable),
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(archive), target, &executable),
        ArchiveFormat::Tar => extract_tar(archive, target, &executable),
    };

    match result {
        Ok(true) => Ok(executable),
        Ok(false) => {
            let _ = std::fs::remove_dir_all(target);
            Err(InstallError::MissingExecutable(executable_name.to_string()))
        }
        Err(e) => {
            let _ = std::fs::remove_dir_all(target);
            Err(e)
        }
    }
}

fn identify(archive: &mut std::fs::File) -> Result<ArchiveFormat, InstallError> {
    let mut header = [0u8; 512];
    let mut filled = 0;
    loop {
        let n = archive
            .read(&mut header[filled..])
            .map_err(InstallError::Buffer)?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == header.len() {
            break;
        }
    }
    let header = &header[..filled];

    if header.starts_with(ZIP_MAGIC) {
        return Ok(ArchiveFormat::Zip);
    }
    if header.starts_with(GZIP_MAGIC) {
        return Ok(ArchiveFormat::TarGz);
    }
    if header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
    {
        return Ok(ArchiveFormat::Tar);
    }
    Err(InstallError::UnsupportedFormat)
}

/// Validate an entry path and compute where it lands under `target`.
///
/// Entries must live below a single top-level directory named like a
/// release bundle; the remainder of the path must consist of plain
/// components only, so no entry can escape the installation target.
fn entry_destination(target: &Path, name: &Path) -> Result<PathBuf, InstallError> {
    let mut components = name.components();
    let top = match components.next() {
        Some(Component::Normal(part)) => part.to_string_lossy(),
        _ => return Err(InstallError::UnexpectedLayout(name.to_path_buf())),
    };
    if !top.starts_with(BUNDLE_PREFIX) {
        return Err(InstallError::UnexpectedLayout(name.to_path_buf()));
    }

    let rest = components.as_path();
    if rest.as_os_str().is_empty()
        || rest
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(InstallError::UnexpectedLayout(name.to_path_buf()));
    }

    Ok(target.join(rest))
}

fn extract_tar<R: Read>(
    reader: R,
    target: &Path,
    executable: &Path,
) -> Result<bool, InstallError> {
    let mut found = false;
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(InstallError::Extract)? {
        let mut entry = entry.map_err(InstallError::Extract)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path().map_err(InstallError::Extract)?.into_owned();
        let destination = entry_destination(target, &name)?;
        let mode = entry.header().mode().map_err(InstallError::Extract)?;
        let size = entry.size();

        write_entry(&mut entry, &destination, mode)?;
        if destination.as_path() == executable {
            found = true;
        }
        debug!(file = %destination.display(), size, "file of custom release extracted");
    }
    Ok(found)
}

fn zip_err(e: zip::result::ZipError) -> InstallError {
    InstallError::Extract(std::io::Error::other(e))
}

fn extract_zip(
    archive: std::fs::File,
    target: &Path,
    executable: &Path,
) -> Result<bool, InstallError> {
    let mut found = false;
    let mut archive = zip::ZipArchive::new(archive).map_err(zip_err)?;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(zip_err)?;
        if file.is_dir() {
            continue;
        }

        let name = file
            .enclosed_name()
            .ok_or_else(|| InstallError::UnexpectedLayout(PathBuf::from(file.name())))?;
        let destination = entry_destination(target, &name)?;
        let mode = file.unix_mode().unwrap_or(0o644);
        let size = file.size();

        write_entry(&mut file, &destination, mode)?;
        if destination.as_path() == executable {
            found = true;
        }
        debug!(file = %destination.display(), size, "file of custom release extracted");
    }
    Ok(found)
}

fn write_entry<R: Read>(
    reader: &mut R,
    destination: &Path,
    mode: u32,
) -> Result<(), InstallError> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(InstallError::Extract)?;
    }
    let mut out = std::fs::File::create(destination).map_err(InstallError::Extract)?;
    std::io::copy(reader, &mut out).map_err(InstallError::Extract)?;
    set_mode(destination, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(InstallError::Extract)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), InstallError> {
    Ok(())
}

fn install_target() -> PathBuf {
    match std::env::var(TARGET_ENV) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => PathBuf::from(TARGET_DEFAULT),
    }
}

fn executable_name() -> String {
    match std::env::var(EXECUTABLE_ENV) {
        Ok(v) if !v.is_empty() => v,
        _ => EXECUTABLE_DEFAULT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Cursor;

    fn tar_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(*mode);
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn tar_gz_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes(entries)).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content, mode) in entries {
            let options =
                zip::write::SimpleFileOptions::default().unix_permissions(*mode);
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn as_temp_file(bytes: &[u8]) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    fn bundle() -> Vec<(&'static str, &'static [u8], u32)> {
        vec![
            ("duplicati-2.1.0/duplicati-server", b"#!/bin/sh\n" as &[u8], 0o755),
            ("duplicati-2.1.0/lib/one.dll", b"library" as &[u8], 0o644),
        ]
    }

    #[test]
    fn test_identify_formats() {
        let mut zip = as_temp_file(&zip_bytes(&bundle()));
        assert_eq!(identify(&mut zip).unwrap(), ArchiveFormat::Zip);

        let mut tar_gz = as_temp_file(&tar_gz_bytes(&bundle()));
        assert_eq!(identify(&mut tar_gz).unwrap(), ArchiveFormat::TarGz);

        let mut tar = as_temp_file(&tar_bytes(&bundle()));
        assert_eq!(identify(&mut tar).unwrap(), ArchiveFormat::Tar);
    }

    #[test]
    fn test_identify_rejects_unknown_content() {
        let mut file = as_temp_file(b"this is not an archive at all");
        assert!(matches!(
            identify(&mut file),
            Err(InstallError::UnsupportedFormat)
        ));
    }

    #[test]
    fn test_install_from_tar_gz() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("custom");

        let archive = as_temp_file(&tar_gz_bytes(&bundle()));
        let installed =
            install_from(archive, &target, "duplicati-server").unwrap();

        assert_eq!(installed, target.join("duplicati-server"));
        assert!(installed.exists());
        assert!(target.join("lib/one.dll").exists());
    }

    #[test]
    fn test_install_from_zip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("custom");

        let archive = as_temp_file(&zip_bytes(&bundle()));
        let installed =
            install_from(archive, &target, "duplicati-server").unwrap();

        assert_eq!(installed, target.join("duplicati-server"));
        assert!(installed.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_mode_is_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("custom");

        let archive = as_temp_file(&tar_gz_bytes(&bundle()));
        let installed =
            install_from(archive, &target, "duplicati-server").unwrap();

        let mode = std::fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_stale_target_content_is_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("custom");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale-file"), b"old release").unwrap();

        let archive = as_temp_file(&tar_gz_bytes(&bundle()));
        install_from(archive, &target, "duplicati-server").unwrap();

        assert!(!target.join("stale-file").exists());
        assert!(target.join("duplicati-server").exists());
    }

    #[test]
    fn test_entry_outside_bundle_prefix_fails_whole_install() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("custom");

        let entries = vec![
            ("duplicati-2.1.0/duplicati-server", b"#!/bin/sh\n" as &[u8], 0o755),
            ("evil/duplicati-server", b"#!/bin/sh\n" as &[u8], 0o755),
        ];
        let archive = as_temp_file(&tar_gz_bytes(&entries));

        let err = install_from(archive, &target, "duplicati-server").unwrap_err();
        assert!(matches!(err, InstallError::UnexpectedLayout(_)));
        // Nothing usable may remain behind after a rejected archive
        assert!(!target.join("duplicati-server").exists());
    }

    #[test]
    fn test_bare_top_level_file_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("custom");

        let entries = vec![("duplicati-server", b"#!/bin/sh\n" as &[u8], 0o755)];
        let archive = as_temp_file(&tar_bytes(&entries));

        let err = install_from(archive, &target, "duplicati-server").unwrap_err();
        assert!(matches!(err, InstallError::UnexpectedLayout(_)));
    }

    #[test]
    fn test_missing_executable_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("custom");

        let entries =
            vec![("duplicati-2.1.0/lib/one.dll", b"library" as &[u8], 0o644)];
        let archive = as_temp_file(&tar_gz_bytes(&entries));

        let err = install_from(archive, &target, "duplicati-server").unwrap_err();
        assert!(matches!(err, InstallError::MissingExecutable(name) if name == "duplicati-server"));
        assert!(!target.join("duplicati-server").exists());
    }

    #[test]
    fn test_entry_destination_rejects_traversal() {
        let target = Path::new("/opt/duplicati/custom");

        let err =
            entry_destination(target, Path::new("duplicati-x/../../etc/passwd"))
                .unwrap_err();
        assert!(matches!(err, InstallError::UnexpectedLayout(_)));

        let err = entry_destination(target, Path::new("/duplicati-x/abs")).unwrap_err();
        assert!(matches!(err, InstallError::UnexpectedLayout(_)));
    }

    #[test]
    fn test_entry_destination_strips_top_level_directory() {
        let target = Path::new("/opt/duplicati/custom");
        let destination =
            entry_destination(target, Path::new("duplicati-2.1.0/lib/one.dll")).unwrap();
        assert_eq!(
            destination,
            Path::new("/opt/duplicati/custom/lib/one.dll")
        );
    }
}
