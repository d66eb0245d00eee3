use crate::dto::DataFile;
use crate::error::{LinkageError, Result};
use futures::stream::TryStreamExt;
use rusoto_core::Region;
use rusoto_s3::{GetObjectRequest, PutObjectRequest, S3Client, S3};
use std::env;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::str::FromStr;
use tempfile::NamedTempFile;

pub fn get_region() -> Result<Region> {
    let val = get_env_var("REGION")?;
    Region::from_str(val.as_str())
        .map_err(|_| LinkageError::config(format!("Unable to parse region {}", val)))
}

pub fn get_env_var(name: &str) -> Result<String> {
    env::var(name)
        .map_err(|_| LinkageError::config(format!("Environment variable '{}' not found", name)))
}

pub async fn download_object_from_s3(client: &S3Client, file: &DataFile) -> Result<Vec<u8>> {
    let request = GetObjectRequest {
        bucket: file.bucket.clone(),
        key: file.key.clone(),
        ..Default::default()
    };
    let mut object = client
        .get_object(request)
        .await
        .map_err(|err| LinkageError::input(format!("{}: {}", file, err)))?;
    let body = object
        .body
        .take()
        .ok_or_else(|| LinkageError::input(format!("{}: unable to extract body", file)))?;
    body.map_ok(|b| b.to_vec())
        .try_concat()
        .await
        .map_err(LinkageError::from)
}

/// Like [`download_object_from_s3`] but a missing key is `None` rather than an error.
pub async fn download_optional_object_from_s3(
    client: &S3Client,
    file: &DataFile,
) -> Result<Option<Vec<u8>>> {
    let request = GetObjectRequest {
        bucket: file.bucket.clone(),
        key: file.key.clone(),
        ..Default::default()
    };
    match client.get_object(request).await {
        Ok(mut object) => match object.body.take() {
            Some(body) => Ok(Some(
                body.map_ok(|b| b.to_vec())
                    .try_concat()
                    .await
                    .map_err(LinkageError::from)?,
            )),
            None => Ok(None),
        },
        Err(rusoto_core::RusotoError::Service(rusoto_s3::GetObjectError::NoSuchKey(_))) => {
            Ok(None)
        }
        Err(err) => Err(LinkageError::input(format!("{}: {}", file, err))),
    }
}

pub async fn upload_object_to_s3(client: &S3Client, object: Vec<u8>, file: &DataFile) -> Result<()> {
    let request = PutObjectRequest {
        bucket: file.bucket.clone(),
        key: file.key.clone(),
        body: Some(object.into()),
        ..Default::default()
    };
    client
        .put_object(request)
        .await
        .map(|_| ())
        .map_err(|err| LinkageError::Io(std::io::Error::new(ErrorKind::Other, err.to_string())))
}

///
/// Writes `contents` to a temporary file next to `path` and renames it into
/// place, so readers only ever observe the old file or the complete new one.
///
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| LinkageError::Io(err.error))?;
    Ok(())
}

/// Reads `path`, treating a missing file as `None`.
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
