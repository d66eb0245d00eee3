use record_linkage_service::dto::{DataFile, LinkageJob};
use record_linkage_service::error::LinkageError;
use record_linkage_service::loader::{decode_input, Inputs};
use record_linkage_service::training::{MemoryStore, TrainingLog};
use record_linkage_service::util::{
    download_object_from_s3, download_optional_object_from_s3, upload_object_to_s3,
};
use rusoto_s3::S3Client;
use serde_json::{json, Value};
use tracing::info;

const TRAINING_FILE: &str = "training.json";
const SETTINGS_FILE: &str = "cached_settings";

pub async fn pull_inputs(client: &S3Client, job: &LinkageJob) -> Result<Inputs, LinkageError> {
    let mut texts = Vec::with_capacity(job.inputs.len());
    for file in &job.inputs {
        let bytes = download_object_from_s3(client, file).await?;
        texts.push(decode_input(bytes, &file.to_string())?);
    }
    Inputs::load(&job.config, job.mode, &texts)
}

/// Training artifacts live side by side under the `training` prefix.
fn artifact(prefix: &DataFile, name: &str) -> DataFile {
    DataFile {
        bucket: prefix.bucket.clone(),
        key: format!("{}/{}", prefix.key.trim_end_matches('/'), name),
    }
}

pub async fn pull_training_store(
    client: &S3Client,
    prefix: &DataFile,
) -> Result<MemoryStore, LinkageError> {
    let training = download_optional_object_from_s3(client, &artifact(prefix, TRAINING_FILE))
        .await?
        .map(|bytes| TrainingLog::from_json(&bytes))
        .transpose()?;
    let settings = download_optional_object_from_s3(client, &artifact(prefix, SETTINGS_FILE)).await?;
    info!(
        labeled = training.as_ref().map_or(0, TrainingLog::len),
        cached_settings = settings.is_some(),
        "training artifacts loaded"
    );
    Ok(MemoryStore { training, settings })
}

pub async fn push_training_store(
    client: &S3Client,
    prefix: &DataFile,
    store: MemoryStore,
) -> Result<(), LinkageError> {
    if let Some(log) = store.training {
        upload_object_to_s3(client, log.to_json()?, &artifact(prefix, TRAINING_FILE)).await?;
    }
    if let Some(settings) = store.settings {
        upload_object_to_s3(client, settings, &artifact(prefix, SETTINGS_FILE)).await?;
    }
    Ok(())
}

///
/// Uploads each named output next to the first input, under the bucket's
/// `/output` counterpart, and lists where they went.
///
pub async fn push_result_files(
    client: &S3Client,
    source: &DataFile,
    outputs: Vec<(&str, Vec<u8>)>,
) -> Result<Value, LinkageError> {
    let output_bucket = source.bucket.replace("/input", "/output");
    let folder = source.key.rsplit_once('/').map(|(folder, _)| folder);
    let mut written = Vec::with_capacity(outputs.len());
    for (name, object) in outputs {
        let file = DataFile {
            bucket: output_bucket.clone(),
            key: match folder {
                Some(folder) => format!("{folder}/{name}"),
                None => name.to_string(),
            },
        };
        upload_object_to_s3(client, object, &file).await?;
        info!(%file, "output uploaded");
        written.push(json!({ "bucket": file.bucket, "key": file.key }));
    }
    Ok(Value::Array(written))
}
