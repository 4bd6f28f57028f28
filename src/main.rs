use anyhow::{Context, Result};
use chordify::annotation::{parse_annotation, write_lab};
use chordify::config::AppConfig;
use chordify::evaluate::{self, EvaluationReport, Estimator};
use chordify::pipeline::cache::SampleCache;
use chordify::recognition::hcdf::{hcdf, strongest_changes};
use chordify::recognition::{
    ChordRecognizer, Classifier, LearnedRecognizer, NearestCentroid, SupervisedVectors,
    SvmClassifier, TemplateRecognizer,
};
use chordify::timeline::make_timeline;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chordify", version, about = "Chord recognition from audio")]
struct Cli {
    /// Path to a TOML config file (defaults to the XDG config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognise the chords of one audio file
    Predict {
        audio: PathBuf,

        /// Write the timeline as a .lab file instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also list the N strongest harmonic changes
        #[arg(long, value_name = "N")]
        changes: Option<usize>,
    },

    /// Score a predicted .lab file against a reference .lab file
    Score {
        predicted: PathBuf,
        reference: PathBuf,
    },

    /// Evaluate every audio file with a sibling .lab under the given directories
    Evaluate {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Train a recogniser on one directory, evaluate on another
    Learn {
        train_dir: PathBuf,
        test_dir: PathBuf,

        /// Classifier to train
        #[arg(long, value_enum, default_value = "svm")]
        classifier: ClassifierKind,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Clone, ValueEnum)]
enum ClassifierKind {
    /// RBF support vector machines, penalty picked on a held-out split
    Svm,
    /// Nearest class mean
    Centroid,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Explicit --config must exist; the default location is optional
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path).context("Failed to load config")?,
        None => AppConfig::load(),
    };
    config.validate().context("Invalid configuration")?;

    let cache = SampleCache::shared(config.audio.cache_capacity);

    match cli.command {
        Commands::Predict { audio, output, changes } => {
            let estimator = Estimator::from_config(&config, cache)
                .context("Failed to build pipeline")?;
            let recognizer = TemplateRecognizer::from_config(&config.recognition)
                .context("Failed to build recogniser")?;

            let (chroma, boundaries) = estimator
                .features(&audio)
                .with_context(|| format!("Failed to process {}", audio.display()))?;
            let chords = recognizer.predict(&chroma).context("Recognition failed")?;
            let timeline = make_timeline(&boundaries, &chords)
                .context("Failed to build timeline")?
                .merged();

            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    write_lab(&timeline, std::io::BufWriter::new(file))
                        .context("Failed to write timeline")?;
                    println!("Wrote {} segments to {}", timeline.len(), path.display());
                }
                None => {
                    write_lab(&timeline, std::io::stdout().lock())
                        .context("Failed to write timeline")?;
                }
            }

            if let Some(count) = changes {
                let peaks = strongest_changes(&hcdf(&chroma), &boundaries, count);
                let mut err = std::io::stderr().lock();
                writeln!(err, "Strongest harmonic changes:")?;
                for (time, strength) in peaks {
                    writeln!(err, "  {:>9.3}s  {:.4}", time, strength)?;
                }
            }
        }

        Commands::Score { predicted, reference } => {
            let predicted = parse_annotation(&predicted)
                .with_context(|| format!("Failed to read {}", predicted.display()))?;
            let reference = parse_annotation(&reference)
                .with_context(|| format!("Failed to read {}", reference.display()))?;
            println!("{:.6}", chordify::scoring::score(&predicted, &reference));
        }

        Commands::Evaluate { dirs, jobs, json } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let pairs = evaluate::discover_pairs(&dirs);
            if pairs.is_empty() {
                anyhow::bail!("No audio files with a sibling .lab found");
            }

            let estimator = Estimator::from_config(&config, cache)
                .context("Failed to build pipeline")?;
            let recognizer = TemplateRecognizer::from_config(&config.recognition)
                .context("Failed to build recogniser")?;
            let report = evaluate::evaluate_pairs(&estimator, &recognizer, &pairs, workers)
                .context("Evaluation failed")?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialise report")?
                );
            } else {
                print_report(&report);
            }
        }

        Commands::Learn { train_dir, test_dir, classifier, jobs } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let train = evaluate::discover_pairs(&[train_dir]);
            let test = evaluate::discover_pairs(&[test_dir]);
            if train.is_empty() || test.is_empty() {
                anyhow::bail!(
                    "Need annotated audio in both directories ({} training, {} test files found)",
                    train.len(),
                    test.len()
                );
            }

            let estimator = Estimator::from_config(&config, cache)
                .context("Failed to build pipeline")?;
            let (data, failed) = evaluate::collect_training(&estimator, &train, workers)
                .context("Collecting training data failed")?;
            println!(
                "Training data: {} vectors from {} files ({} failed)",
                data.len(),
                train.len() as u64 - failed,
                failed
            );

            let report = match classifier {
                ClassifierKind::Svm => {
                    train_and_evaluate(SvmClassifier::new(), &estimator, &data, &test, workers)?
                }
                ClassifierKind::Centroid => {
                    train_and_evaluate(NearestCentroid::new(), &estimator, &data, &test, workers)?
                }
            };
            print_report(&report);
        }

        Commands::ShowConfig => {
            let text = toml::to_string(&config).context("Failed to serialise config")?;
            print!("{}", text);
        }
    }

    Ok(())
}

fn train_and_evaluate<C: Classifier>(
    classifier: C,
    estimator: &Estimator,
    data: &SupervisedVectors,
    test: &[evaluate::Pair],
    workers: usize,
) -> Result<EvaluationReport> {
    let mut recognizer = LearnedRecognizer::new(classifier);
    recognizer.learn(data).context("Training failed")?;
    let classes = recognizer.resolution().context("Training failed")?;
    println!("Learned {} chord classes", classes.len());

    evaluate::evaluate_pairs(estimator, &recognizer, test, workers).context("Evaluation failed")
}

fn print_report(report: &EvaluationReport) {
    println!("{:>8}  File", "Score");
    for file in &report.files {
        let name = file
            .audio
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.audio.display().to_string());
        println!("{:>8.4}  {}", file.score, name);
    }
    println!();
    println!(
        "Evaluation complete: {} scored, {} failed, mean score {:.4}",
        report.files.len(),
        report.failed,
        report.mean()
    );
}
