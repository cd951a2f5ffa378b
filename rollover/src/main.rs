use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rollover::dates::{self, DateAliases};
use rollover::dir_store::{DirNoteStore, NOTE_EXTENSION};
use rollover::model::{DateFormat, Node, Periodicity};
use rollover::projectors::{history_projector, rollover_projector};
use rollover::sections::SectionHeaders;
use rollover::service::{self, DEFAULT_TAG, NoteReport, RolloverOptions};
use rollover::{format_document, parse_document};
use serde::Deserialize;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(
    name = "rollover",
    about = "Daily rollover for checklist notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Roll over every tagged note of a note directory and archive completed tasks.
    Run(RunArgs),

    /// Roll over a single note file and print the result.
    Roll(RollArgs),

    /// Parse note files and print their tree.
    Parse(ParseArgs),

    /// Reformat note files.
    Format(FormatArgs),

    /// Print the history note title for a date.
    Title(TitleArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Directory holding the notes (`*.enml`), notebooks are sub-directories.
    #[arg(long)]
    store: PathBuf,
    /// Tag marking the notes to roll over. Overrides the config file.
    #[arg(long)]
    tag: Option<String>,
    /// Run date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Compute everything but write nothing.
    #[arg(long)]
    dry_run: bool,
    /// Emit a JSON report instead of a summary.
    #[arg(long)]
    json: bool,
    /// JSON file with the tag and section header strings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RollArgs {
    /// Note file to roll over.
    input: PathBuf,
    /// Run date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// JSON file with the section header strings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Note files or directories containing note files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Note files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct TitleArgs {
    /// Title prefix, as in the "History note" setting.
    #[arg(long)]
    prefix: String,
    /// Date inside the period (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long, value_enum, default_value_t = IntervalArg::Weekly)]
    interval: IntervalArg,
    /// Field order, e.g. `dmy` or `m/d/y`.
    #[arg(long, default_value = "dmy")]
    format: DateFormat,
    #[arg(long, default_value = "/")]
    separator: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum IntervalArg {
    Daily,
    Weekly,
    Monthly,
}

impl From<IntervalArg> for Periodicity {
    fn from(value: IntervalArg) -> Self {
        match value {
            IntervalArg::Daily => Periodicity::Daily,
            IntervalArg::Weekly => Periodicity::Weekly,
            IntervalArg::Monthly => Periodicity::Monthly,
        }
    }
}

/// Optional process configuration read from `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    tag: Option<String>,
    /// Header text to section, replacing the built-in headers when present.
    headers: Option<SectionHeaders>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("rollover=debug")
    } else {
        EnvFilter::new("rollover=warn")
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::Roll(args) => handle_roll(args),
        Commands::Parse(args) => handle_parse(args),
        Commands::Format(args) => handle_format(args),
        Commands::Title(args) => handle_title(args),
    }
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
    let config: FileConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing config {:?}", path))?;
    debug!(?path, "loaded config");
    Ok(config)
}

/// Command-line values win over the config file, the config file over the defaults.
fn build_options(config: FileConfig, tag: Option<String>, dry_run: bool) -> RolloverOptions {
    RolloverOptions {
        tag: tag
            .or(config.tag)
            .unwrap_or_else(|| DEFAULT_TAG.to_string()),
        headers: config.headers.unwrap_or_default(),
        dry_run,
    }
}

fn resolve_date(date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| Local::now().date_naive())
}

fn handle_run(args: RunArgs) -> Result<()> {
    let RunArgs {
        store,
        tag,
        date,
        dry_run,
        json,
        config,
    } = args;
    let options = build_options(load_config(config.as_deref())?, tag, dry_run);
    if !store.is_dir() {
        anyhow::bail!("{:?} is not a directory", store);
    }
    let today = resolve_date(date);
    info!(%today, tag = %options.tag, dry_run, "starting rollover");

    let store = DirNoteStore::new(store);
    let report = service::process_tagged(&store, today, &options)
        .with_context(|| format!("searching notes tagged {:?}", options.tag))?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonFailure {
            note: String,
            stage: String,
            error: String,
        }

        #[derive(serde::Serialize)]
        struct JsonReport<'a> {
            date: NaiveDate,
            processed: &'a [NoteReport],
            failures: Vec<JsonFailure>,
        }

        let payload = JsonReport {
            date: today,
            processed: &report.processed,
            failures: report
                .failures
                .iter()
                .map(|f| JsonFailure {
                    note: f.note.clone(),
                    stage: f.stage.to_string(),
                    error: f.source.to_string(),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for done in &report.processed {
            let stats = done.stats;
            println!(
                "{}: {} today, {} later, {} archived to {:?}{}",
                done.note.title,
                stats.today,
                stats.later,
                stats.completed,
                done.history_title,
                if done.dry_run { " (dry run)" } else { "" }
            );
        }
        for failure in &report.failures {
            eprintln!("{failure}");
        }
    }

    if !report.is_success() {
        anyhow::bail!(
            "{} of {} notes failed",
            report.failures.len(),
            report.failures.len() + report.processed.len()
        );
    }
    Ok(())
}

fn handle_roll(args: RollArgs) -> Result<()> {
    let RollArgs {
        input,
        date,
        in_place,
        config,
    } = args;
    let options = build_options(load_config(config.as_deref())?, None, false);
    let today = resolve_date(date);

    let raw = fs::read_to_string(&input).with_context(|| format!("reading {:?}", input))?;
    let root = parse_document(&raw).with_context(|| format!("parsing {:?}", input))?;
    let result = rollover_projector::run_with_headers(
        root,
        today,
        &DateAliases::standard(today),
        &options.headers,
    )
    .with_context(|| format!("rolling over {:?}", input))?;
    info!(run_id = %result.run_id, stats = ?result.stats, "rolled over {:?}", input);

    let formatted = format_document(&result.updated_root);
    if in_place {
        fs::write(&input, formatted.as_bytes()).with_context(|| format!("writing {:?}", input))?;
        eprintln!(
            "{} completed task(s) belong in {:?} / {:?}",
            result.history_fragments.len(),
            result.notebook_name,
            result.history_title
        );
    } else {
        print!("{formatted}");
        if !formatted.ends_with('\n') {
            println!();
        }
        let history = history_projector::append_history(
            None,
            today,
            &result.settings,
            result.history_fragments,
        );
        eprintln!(
            "history {:?} / {:?}: {}",
            result.notebook_name,
            result.history_title,
            rollover::format_node(&history)
        );
    }
    Ok(())
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no note files found in the provided inputs");
    }

    let mut parsed = Vec::new();
    for path in expanded {
        debug!(?path, "parsing");
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let root = parse_document(&raw).with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, root));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            root: &'a Node,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, root)| JsonOutput {
                path: path.display().to_string(),
                root,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, root)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", root);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no note files found in the provided inputs");
    }

    let multiple = expanded.len() > 1;
    for (idx, path) in expanded.iter().enumerate() {
        debug!(?path, "formatting");
        let raw = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let root = parse_document(&raw).with_context(|| format!("parsing {:?}", path))?;
        let formatted = format_document(&root);

        if in_place {
            fs::write(path, formatted.as_bytes()).with_context(|| format!("writing {:?}", path))?;
        } else {
            if idx > 0 {
                println!();
            }
            if multiple {
                println!("== {} ==", path.display());
            }
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_title(args: TitleArgs) -> Result<()> {
    let TitleArgs {
        prefix,
        date,
        interval,
        format,
        separator,
    } = args;
    let title = dates::history_title(
        &prefix,
        resolve_date(date),
        interval.into(),
        &format,
        &separator,
    );
    println!("{title}");
    Ok(())
}

/// Files are taken as given; directories contribute their `*.enml` files, recursively.
fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        if canonical.is_dir() {
            debug!(?canonical, "scanning directory");
            let mut found = Vec::new();
            collect_note_files(&canonical, &mut found)?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if visited.insert(canonical.clone()) {
            out.push(canonical);
        }
    }
    Ok(out)
}

fn collect_note_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading directory {:?}", dir))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_note_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == NOTE_EXTENSION) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollover::sections::SectionKind;
    use std::fs;

    #[test]
    fn missing_config_path_gives_defaults() {
        let options = build_options(load_config(None).expect("no config"), None, false);
        assert_eq!(options, RolloverOptions::default());
    }

    #[test]
    fn config_file_overrides_defaults_and_cli_overrides_config() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("rollover.json");
        fs::write(
            &path,
            r#"{"tag": "@daily", "headers": {"Dnes:": "today", "Pozdeji:": "later", "Nastaveni:": "end"}}"#,
        )
        .expect("write config");

        let from_file = build_options(load_config(Some(&path)).expect("config"), None, true);
        assert_eq!(from_file.tag, "@daily");
        assert!(from_file.dry_run);
        assert_eq!(from_file.headers.lookup("Dnes:"), Some(SectionKind::Today));
        assert_eq!(from_file.headers.lookup("Today:"), None);

        let from_cli = build_options(
            load_config(Some(&path)).expect("config"),
            Some("@mine".into()),
            false,
        );
        assert_eq!(from_cli.tag, "@mine");
    }

    #[test]
    fn rejects_unknown_config_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("rollover.json");
        fs::write(&path, r#"{"tga": "@typo"}"#).expect("write config");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn expand_inputs_collects_note_files_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("nested")).expect("mkdir nested");
        fs::write(root.join("a.enml"), "<en-note/>").expect("write a");
        fs::write(root.join("nested").join("b.enml"), "<en-note/>").expect("write b");
        fs::write(root.join("skip.txt"), "x").expect("write txt");

        let expanded =
            expand_inputs(&[root.to_path_buf(), root.join("a.enml")]).expect("expand inputs");
        let names: Vec<_> = expanded
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.enml", "b.enml"]);
    }
}
