mod prompt;

use clap::{Parser, ValueEnum};
use prompt::{resolve_data_file, Exit, Prompter};
use record_linkage_service::classifier::MinHashClassifier;
use record_linkage_service::dto::{LinkageConfig, Mode};
use record_linkage_service::error::{LinkageError, Result};
use record_linkage_service::labeling::ConsoleLabeler;
use record_linkage_service::loader::{decode_input, Inputs};
use record_linkage_service::logging::init_tracing;
use record_linkage_service::orchestrator::{Linker, RunOptions, TrainingMode};
use record_linkage_service::training::FileStore;
use record_linkage_service::util::write_atomically;
use record_linkage_service::writer::{
    write_dedup, write_link, DedupLayout, MarkerColumn, A_ONLY_OUTPUT, B_ONLY_OUTPUT,
    DEDUP_OUTPUT, MATCHES_OUTPUT,
};
use std::io::{self, StdinLock, Stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Dedup,
    Link,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Dedup => Mode::Dedup,
            ModeArg::Link => Mode::Link,
        }
    }
}

/// Finds duplicate records in one file or matching records across two.
#[derive(Parser, Debug)]
#[command(name = "record-linkage", version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "RECORD_LINKAGE_CONFIG")]
    config: PathBuf,

    /// Dedup one file or link two; asked for when omitted
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Data file, or folder holding a single data file; repeat for link mode
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,

    /// Reuse the cached classifier instead of training
    #[arg(long, conflicts_with = "train")]
    existing_training: bool,

    /// Label examples interactively before matching
    #[arg(long)]
    train: bool,

    /// Where result files are written
    #[arg(long, default_value = "./data/output")]
    output_dir: PathBuf,
}

type Console = Prompter<StdinLock<'static>, Stdout>;

fn main() -> ExitCode {
    init_tracing(false);
    let args = Args::parse();
    let console = Prompter::new(io::stdin().lock(), io::stdout());
    match run(args, console) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(Exit)) => {
            println!("Exiting.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("[ERROR] {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, mut console: Console) -> Result<std::result::Result<(), Exit>> {
    let config = LinkageConfig::from_path(&args.config)?;

    let mode = match args.mode {
        Some(mode) => mode.into(),
        None => match console.select(
            "Select an option:",
            &["Find duplicates in one file", "Match records across two files"],
        )? {
            Ok(0) => Mode::Dedup,
            Ok(_) => Mode::Link,
            Err(exit) => return Ok(Err(exit)),
        },
    };
    let roles: &[&str] = match mode {
        Mode::Dedup => &["input"],
        Mode::Link => &["first", "second"],
    };

    let mut paths = Vec::with_capacity(roles.len());
    for (i, role) in roles.iter().enumerate() {
        let path = match args.inputs.get(i) {
            Some(given) => resolve_data_file(given)?,
            None => match console.data_file(role)? {
                Ok(path) => path,
                Err(exit) => return Ok(Err(exit)),
            },
        };
        paths.push(path);
    }

    let training = if args.existing_training {
        TrainingMode::CachedSettings
    } else if args.train {
        TrainingMode::Interactive
    } else {
        match console.yes_no("Would you like to run with existing training data?")? {
            Ok(true) => TrainingMode::CachedSettings,
            Ok(false) => TrainingMode::Interactive,
            Err(exit) => return Ok(Err(exit)),
        }
    };

    let texts = paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .map_err(|err| LinkageError::input(format!("{}: {err}", path.display())))?;
            decode_input(bytes, &path.display().to_string())
        })
        .collect::<Result<Vec<_>>>()?;
    let inputs = Inputs::load(&config, mode, &texts)?;
    link(&config, &inputs, training, &args.output_dir, console)?;
    Ok(Ok(()))
}

fn link(
    config: &LinkageConfig,
    inputs: &Inputs,
    training: TrainingMode,
    output_dir: &Path,
    console: Console,
) -> Result<()> {
    let mut classifier = MinHashClassifier::new(config.fields.clone(), config.classifier.clone());
    let mut store = FileStore::new(config.training_file.clone(), config.settings_file.clone());
    let (input, output) = console.into_inner();
    let mut labeler = ConsoleLabeler::new(input, output);
    let mut linker = Linker {
        classifier: &mut classifier,
        store: &mut store,
        labels: Some(&mut labeler),
        options: RunOptions {
            sample_size: config.sample_size,
            recall_weight: config.recall_weight,
            training,
        },
    };
    let delimiter = config.delimiter_byte()?;

    match inputs {
        Inputs::Dedup(dataset) => {
            let result = linker.dedup(dataset)?;
            let mut out = Vec::new();
            write_dedup(dataset, &result, DedupLayout::from_config(config), delimiter, &mut out)?;
            save(output_dir, DEDUP_OUTPUT, &out)?;
        }
        Inputs::Link(a, b) => {
            let result = linker.link(a, b)?;
            let (mut matches, mut a_only, mut b_only) = (Vec::new(), Vec::new(), Vec::new());
            let overflow = (!config.inner_join).then_some((&mut a_only, &mut b_only));
            write_link(
                a,
                b,
                &result,
                &MarkerColumn::from_config(config),
                delimiter,
                &mut matches,
                overflow,
            )?;
            save(output_dir, MATCHES_OUTPUT, &matches)?;
            if !config.inner_join {
                save(output_dir, A_ONLY_OUTPUT, &a_only)?;
                save(output_dir, B_ONLY_OUTPUT, &b_only)?;
            }
        }
    }
    Ok(())
}

fn save(output_dir: &Path, name: &str, contents: &[u8]) -> Result<()> {
    let path = output_dir.join(name);
    write_atomically(&path, contents)?;
    info!(path = %path.display(), "results saved");
    println!("[INFO] Results saved to {}", path.display());
    Ok(())
}
