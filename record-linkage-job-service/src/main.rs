mod util;

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use lazy_static::lazy_static;
use record_linkage_service::classifier::MinHashClassifier;
use record_linkage_service::dto::LinkageJob;
use record_linkage_service::error::LinkageError;
use record_linkage_service::loader::Inputs;
use record_linkage_service::logging::init_tracing;
use record_linkage_service::orchestrator::{Linker, RunOptions, TrainingMode};
use record_linkage_service::response::make_response_payload;
use record_linkage_service::util::get_region;
use record_linkage_service::writer::{
    write_dedup, write_link, DedupLayout, MarkerColumn, A_ONLY_OUTPUT, B_ONLY_OUTPUT,
    DEDUP_OUTPUT, MATCHES_OUTPUT,
};
use rusoto_core::{Client, Region};
use rusoto_s3::S3Client;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{error, info};

lazy_static! {
    // AWS Region
    static ref REGION: Result<Region, String> = get_region().map_err(|err| err.to_string());
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing(true);
    run(service_fn(process)).await?;
    Ok(())
}

async fn process(event: LambdaEvent<LinkageJob>) -> Result<Value, Error> {
    let (job, _context) = event.into_parts();
    let result = link(job).await;
    if let Err(err) = &result {
        error!(%err, "linkage job failed");
    }
    make_response_payload(result)
}

///
/// Runs one job without a human in the loop: the stored training log is
/// replayed, or the cached classifier is reused when the job asks for it.
///
async fn link(job: LinkageJob) -> Result<Value, LinkageError> {
    job.config.validate()?;
    let region = REGION.clone().map_err(LinkageError::config)?;
    let client = S3Client::new_with_client(Client::shared(), region);

    let start = Instant::now();
    let inputs = util::pull_inputs(&client, &job).await?;
    let mut store = util::pull_training_store(&client, &job.training).await?;
    info!(secs = start.elapsed().as_secs_f64(), "inputs downloaded");

    let start = Instant::now();
    let mut classifier =
        MinHashClassifier::new(job.config.fields.clone(), job.config.classifier.clone());
    let options = RunOptions {
        sample_size: job.config.sample_size,
        recall_weight: job.config.recall_weight,
        training: if job.use_cached_settings {
            TrainingMode::CachedSettings
        } else {
            TrainingMode::ReplayOnly
        },
    };
    let mut linker = Linker {
        classifier: &mut classifier,
        store: &mut store,
        labels: None,
        options,
    };
    let delimiter = job.config.delimiter_byte()?;

    let (result, outputs) = match &inputs {
        Inputs::Dedup(dataset) => {
            let result = linker.dedup(dataset)?;
            let mut out = Vec::new();
            write_dedup(
                dataset,
                &result,
                DedupLayout::from_config(&job.config),
                delimiter,
                &mut out,
            )?;
            (result, vec![(DEDUP_OUTPUT, out)])
        }
        Inputs::Link(a, b) => {
            let result = linker.link(a, b)?;
            let (mut matches, mut a_only, mut b_only) = (Vec::new(), Vec::new(), Vec::new());
            let overflow = (!job.config.inner_join).then_some((&mut a_only, &mut b_only));
            write_link(
                a,
                b,
                &result,
                &MarkerColumn::from_config(&job.config),
                delimiter,
                &mut matches,
                overflow,
            )?;
            let mut outputs = vec![(MATCHES_OUTPUT, matches)];
            if !job.config.inner_join {
                outputs.push((A_ONLY_OUTPUT, a_only));
                outputs.push((B_ONLY_OUTPUT, b_only));
            }
            (result, outputs)
        }
    };
    info!(secs = start.elapsed().as_secs_f64(), "linkage completed");

    let files = util::push_result_files(&client, &job.inputs[0], outputs).await?;
    util::push_training_store(&client, &job.training, store).await?;
    Ok(json!({
        "outputs": files,
        "matched": result.clusters.len(),
        "unmatched": result.unmatched.len(),
        "threshold": result.threshold,
    }))
}
