use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use navlight::{
    aggregate, format_hms, process_tags, ControlTable, NavError, Params, Tag, TrajectoryRecord,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Navlight tag route reconstruction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interpolate team routes from tag downloads and export them
    Route(RouteArgs),
    /// Print the parsed schedule of a single tag
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct RouteArgs {
    /// Tag files, or directories containing `*.txt` tags
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Control coordinates CSV (id column first, plus `x` and `y`)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    controls: PathBuf,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "routes.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = FormatOpt::Csv)]
    format: FormatOpt,

    /// Params JSON; flags below override its values
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Event duration in hours
    #[arg(long)]
    hours: Option<f64>,

    /// Sampling step in minutes
    #[arg(long)]
    step: Option<f64>,

    /// Grace window after the event end, in minutes
    #[arg(long)]
    grace: Option<f64>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Tag file to parse
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Params JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Report path (stdout when omitted)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatOpt {
    Csv,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Route(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Route(args) => handle_route(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn load_params(config: Option<&Path>) -> Result<Params> {
    match config {
        Some(path) => Params::from_json_path(path)
            .with_context(|| format!("failed to load params {}", path.display())),
        None => Ok(Params::default()),
    }
}

fn handle_route(args: RouteArgs) -> Result<()> {
    let mut params = load_params(args.config.as_deref())?;
    if let Some(hours) = args.hours {
        params.event_hours = hours;
    }
    if let Some(step) = args.step {
        params.step_minutes = step;
    }
    if let Some(grace) = args.grace {
        params.grace_minutes = grace;
    }
    params.validate()?;

    let controls = ControlTable::from_path(&args.controls)
        .with_context(|| format!("failed to load controls {}", args.controls.display()))?;
    info!("Loaded {} controls", controls.len());

    let files = collect_inputs(&args.inputs)?;
    if files.is_empty() {
        return Err(anyhow!("no tag files found"));
    }

    // Parse in parallel; interpolation stays sequential and in input order.
    let t_parse = Instant::now();
    let mut parsed: Vec<(usize, String, Result<Tag, NavError>)> = files
        .par_iter()
        .enumerate()
        .filter_map(|(idx, path)| {
            let name = path.display().to_string();
            match load_tag(path, &params) {
                Ok(result) => Some((idx, name, result)),
                Err(err) => {
                    warn!("Skipping {}: {:#}", name, err);
                    None
                }
            }
        })
        .collect();
    parsed.sort_by_key(|(idx, _, _)| *idx);
    let unreadable = files.len() - parsed.len();
    debug!(
        "Parse stage: {:.1} ms",
        t_parse.elapsed().as_secs_f64() * 1000.0
    );

    let batch = process_tags(
        parsed
            .into_iter()
            .map(|(_, name, result)| (name, result))
            .collect(),
        &controls,
        &params,
    );
    info!(
        "Processed {} tags, skipped {}",
        batch.tags.len(),
        batch.skipped.len() + unreadable
    );

    let records = aggregate(&batch.tags);
    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        write_records(&records, args.format, stdout.lock())?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        write_records(&records, args.format, file)?;
        info!(
            "Wrote {} route samples: {}",
            records.len(),
            args.output.display()
        );
    }
    Ok(())
}

fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in fs::read_dir(input)
                .with_context(|| format!("failed to read directory {}", input.display()))?
            {
                let path = entry?.path();
                let is_tag = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));
                if path.is_file() && is_tag {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

/// Outer error: the file could not be read. Inner: the tag did not parse.
fn load_tag(path: &Path, params: &Params) -> Result<Result<Tag, NavError>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Tag::parse(&text, params))
}

fn write_records<W: Write>(records: &[TrajectoryRecord], format: FormatOpt, out: W) -> Result<()> {
    match format {
        FormatOpt::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            write_record_rows(records, &mut writer)
        }
        FormatOpt::Json => {
            let mut out = out;
            serde_json::to_writer_pretty(&mut out, records)?;
            writeln!(out)?;
            Ok(())
        }
    }
}

fn write_record_rows<W: Write>(
    records: &[TrajectoryRecord],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "team", "time_s", "time", "control", "x", "y", "score", "max_score", "leader",
    ])?;
    for record in records {
        writer.write_record([
            record.team.to_string(),
            record.time_s.to_string(),
            record.time_label.clone(),
            record.control.clone(),
            record.x.to_string(),
            record.y.to_string(),
            format!("{:.3}", record.score),
            format!("{:.3}", record.max_score),
            record.leader.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let params = load_params(args.config.as_deref())?;
    let text = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let tag = Tag::parse(&text, &params)
        .with_context(|| format!("failed to parse {}", args.input.display()))?;
    let report = inspect_report(&args.input, &tag);

    match args.output.as_ref() {
        Some(path) => {
            fs::write(path, report).with_context(|| format!("failed to write {}", path.display()))?;
            info!("Schedule report written: {}", path.display());
        }
        None => io::stdout().write_all(report.as_bytes())?,
    }
    Ok(())
}

fn inspect_report(path: &Path, tag: &Tag) -> String {
    let mut report = String::new();
    report.push_str(&format!("FILE: {}\n", path.display()));
    report.push_str(&format!("  team: {}\n", tag.meta.team));
    report.push_str(&format!("  names: {}\n", tag.meta.names.join(", ")));
    report.push_str(&format!("  score: {}\n", tag.meta.score));
    report.push_str(&format!("  controls: {}\n", tag.schedule.len()));
    report.push_str("  schedule:\n");
    for row in &tag.schedule {
        report.push_str(&format!(
            "    - {:>4} {:>9} {:>7.0}\n",
            row.control,
            format_hms(row.elapsed),
            row.points
        ));
    }
    report
}
