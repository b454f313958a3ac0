//! vmimg - mirror and query VM image catalogs.
//!
//! # Usage
//!
//! ```bash
//! # Mirror the newest amd64 images into /srv/images
//! vmimg mirror --arches amd64 /srv/images release=focal
//!
//! # List what is mirrored
//! vmimg query /srv/images 'ftype~(root-image.gz|squashfs)'
//!
//! # Same, as JSON
//! vmimg query --json /srv/images arch=amd64
//!
//! # Show the state of the last sync
//! vmimg status /srv/images
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vmimg_core::{
    arch_predicate, format_size, host_arches, query, sync_images, FileStore, FilterSet,
    FlattenedRecord, ImageConfig, MirrorError, MirrorOptions, ProgressReporter, ProgressStyle,
    ReferenceIndex, SyncState, Template, DEFAULT_FORMAT,
};

/// Exit status for a write to a closed pipe (128 + SIGPIPE)
const EXIT_BROKEN_PIPE: u8 = 0x80 | 13;

#[derive(Parser, Debug)]
#[command(name = "vmimg")]
#[command(version)]
#[command(about = "Mirror and query simplestreams VM image catalogs")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror a filtered subset of a remote catalog
    Mirror {
        /// Newest versions kept per product (0 keeps all)
        #[arg(long, default_value_t = 1)]
        max: usize,
        /// Architectures to mirror (default: those the host can run)
        #[arg(long, value_delimiter = ',')]
        arches: Option<Vec<String>>,
        /// Remote index or products URL
        #[arg(long)]
        source: Option<String>,
        /// Keyring used to verify signed catalogs
        #[arg(long)]
        keyring: Option<PathBuf>,
        /// Accept signed catalogs without verifying them
        #[arg(long, conflicts_with = "keyring")]
        no_verify: bool,
        /// Mirror directory
        output_dir: PathBuf,
        /// Filter expressions (field=value or field~regex)
        filters: Vec<String>,
    },

    /// Query a local mirror
    Query {
        /// Newest versions listed per product (0 lists all)
        #[arg(long, default_value_t = 1)]
        max: usize,
        /// Percent-style template over item fields
        #[arg(long)]
        output_format: Option<String>,
        /// Print results as a JSON array
        #[arg(long, conflicts_with = "output_format")]
        json: bool,
        /// Mirror directory
        mirror_root: PathBuf,
        /// Filter expressions (field=value or field~regex)
        filters: Vec<String>,
    },

    /// Show sync state of a mirror
    Status {
        /// Mirror directory (default: the configured image dir)
        dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("error: {:#}", e);
        return ExitCode::FAILURE;
    }
    let config = ImageConfig::from_env();

    let result = match cli.command {
        Commands::Mirror {
            max,
            arches,
            source,
            keyring,
            no_verify,
            output_dir,
            filters,
        } => cmd_mirror(&config, max, arches, source, keyring, no_verify, output_dir, filters),

        Commands::Query {
            max,
            output_format,
            json,
            mirror_root,
            filters,
        } => cmd_query(max, output_format, json, mirror_root, filters),

        Commands::Status { dir } => cmd_status(dir.unwrap_or_else(|| config.image_dir.clone())),
    };

    match result {
        Ok(code) => code,
        Err(e) if is_broken_pipe(&e) => ExitCode::from(EXIT_BROKEN_PIPE),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr so query output stays clean.
fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("vmimg={}", level).parse()?)
        .add_directive(format!("vmimg_core={}", level).parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn is_broken_pipe(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::BrokenPipe;
        }
        cause
            .downcast_ref::<MirrorError>()
            .map(MirrorError::is_broken_pipe)
            .unwrap_or(false)
    })
}

/// `--max 0` means no limit.
fn max_versions(max: usize) -> Option<usize> {
    (max > 0).then_some(max)
}

/// User filters plus the architecture restriction.
fn mirror_filters(exprs: &[String], arches: &[String]) -> Result<FilterSet> {
    let mut filters = FilterSet::parse(exprs)?;
    filters.push(arch_predicate(arches)?);
    Ok(filters)
}

#[allow(clippy::too_many_arguments)]
fn cmd_mirror(
    config: &ImageConfig,
    max: usize,
    arches: Option<Vec<String>>,
    source: Option<String>,
    keyring: Option<PathBuf>,
    no_verify: bool,
    output_dir: PathBuf,
    filters: Vec<String>,
) -> Result<ExitCode> {
    let arches = match arches.or_else(host_arches) {
        Some(a) => a,
        None => {
            eprintln!("{}", Cli::command().render_usage());
            eprintln!(
                "error: cannot map host architecture {:?} to image architectures; pass --arches",
                std::env::consts::ARCH
            );
            return Ok(ExitCode::FAILURE);
        }
    };

    // bad filters are reported before any network I/O
    let filters = mirror_filters(&filters, &arches)?;
    let options = MirrorOptions::new(max_versions(max), filters);
    let source = source.unwrap_or_else(|| config.source_url.clone());
    let keyring = if no_verify {
        None
    } else {
        Some(keyring.unwrap_or_else(|| config.keyring.clone()))
    };

    info!("Mirroring {} into {}", source, output_dir.display());
    info!("Filters: {}", options.filters);

    let style = if std::io::stderr().is_terminal() {
        ProgressStyle::Terminal
    } else {
        ProgressStyle::Log
    };
    let mut progress = ProgressReporter::new(style);
    let report = sync_images(&source, &output_dir, options, keyring, &mut progress)
        .with_context(|| format!("mirror of {} failed", source))?;

    println!("Sync completed:");
    println!("  Catalogs:    {}", report.content_ids.join(", "));
    println!("  Items:       {}", report.items_accepted);
    println!("  Downloaded:  {} ({})", report.downloaded.len(), format_size(report.bytes_transferred));
    println!("  Up to date:  {}", report.deduplicated);
    println!("  Removed:     {}", report.removed.len());
    if !report.retired.is_empty() {
        println!("  Retired:     {}", report.retired.join(", "));
    }
    if !report.healed.is_empty() {
        println!("  Healed:      {}", report.healed.join(", "));
    }
    println!("  Time:        {}ms", report.duration_ms);
    Ok(ExitCode::SUCCESS)
}

/// How query results are printed
enum Output {
    Json,
    Lines(Template),
}

fn cmd_query(
    max: usize,
    output_format: Option<String>,
    json: bool,
    mirror_root: PathBuf,
    filters: Vec<String>,
) -> Result<ExitCode> {
    let filters = FilterSet::parse(&filters)?;
    let output = if json {
        Output::Json
    } else {
        Output::Lines(Template::parse(output_format.as_deref().unwrap_or(DEFAULT_FORMAT))?)
    };

    let results = query(&mirror_root, max_versions(max), &filters)
        .with_context(|| format!("query of {} failed", mirror_root.display()))?;

    let mut out = std::io::stdout().lock();
    write_results(&mut out, &results, &output)?;
    out.flush()?;
    Ok(ExitCode::SUCCESS)
}

fn write_results(out: &mut impl Write, results: &[FlattenedRecord], output: &Output) -> Result<()> {
    match output {
        Output::Json => {
            serde_json::to_writer_pretty(&mut *out, results)?;
            writeln!(out)?;
        }
        Output::Lines(template) => {
            let mut lines = results
                .iter()
                .map(|record| {
                    template.render(record).with_context(|| {
                        format!(
                            "cannot format item {}",
                            serde_json::to_string(record).unwrap_or_default()
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            lines.sort();
            for line in lines {
                writeln!(out, "{}", line)?;
            }
        }
    }
    Ok(())
}

fn cmd_status(dir: PathBuf) -> Result<ExitCode> {
    let store = FileStore::new(&dir);
    println!("Mirror: {}", dir.display());

    match SyncState::load(&store)? {
        Some(s) => {
            println!("  Source URL:   {}", s.source_url);
            println!("  Last sync:    {}", s.last_sync_display());
            println!("  Total syncs:  {}", s.total_syncs);
            println!("  In progress:  {}", s.sync_in_progress);
            println!("  Last synced:  {}", format_size(s.last_bytes_transferred));
            println!("  Catalogs:     {}", s.content_ids.join(", "));
        }
        None => println!("  Never synced"),
    }

    let refs = ReferenceIndex::load(&store)?;
    println!("  Blobs:        {}", refs.len());
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(arch: &str, path: &str) -> FlattenedRecord {
        let mut r = FlattenedRecord::new();
        r.insert("arch", json!(arch));
        r.insert("path", json!(path));
        r
    }

    #[test]
    fn test_parse_mirror_args() {
        let cli = Cli::try_parse_from([
            "vmimg", "mirror", "--max", "2", "--arches", "amd64,i386", "/srv/images", "release=focal",
        ])
        .unwrap();
        match cli.command {
            Commands::Mirror {
                max,
                arches,
                output_dir,
                filters,
                no_verify,
                ..
            } => {
                assert_eq!(max, 2);
                assert_eq!(arches.unwrap(), vec!["amd64", "i386"]);
                assert_eq!(output_dir, PathBuf::from("/srv/images"));
                assert_eq!(filters, vec!["release=focal"]);
                assert!(!no_verify);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_json_conflicts_with_output_format() {
        let err = Cli::try_parse_from(["vmimg", "query", "--json", "--output-format", "%(arch)s", "/m"]);
        assert!(err.is_err());
        let ok = Cli::try_parse_from(["vmimg", "-v", "query", "--json", "/m"]).unwrap();
        assert_eq!(ok.verbose, 1);
    }

    #[test]
    fn test_mirror_filters_add_arches() {
        let filters = mirror_filters(&["release=focal".to_string()], &["amd64".to_string()]).unwrap();
        assert_eq!(filters.len(), 2);
        assert!(filters.evaluate(&{
            let mut r = record("amd64", "x");
            r.insert("release", json!("focal"));
            r
        }));
        assert!(!filters.evaluate(&record("arm64", "x")));
        assert!(mirror_filters(&["bogus".to_string()], &["amd64".to_string()]).is_err());
    }

    #[test]
    fn test_max_zero_is_unlimited() {
        assert_eq!(max_versions(0), None);
        assert_eq!(max_versions(3), Some(3));
    }

    #[test]
    fn test_lines_sorted_by_output() {
        let results = vec![record("arm64", "b"), record("amd64", "a")];
        let mut out = Vec::new();
        let template = Template::parse("%(arch)s %(path)s").unwrap();
        write_results(&mut out, &results, &Output::Lines(template)).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "amd64 a\narm64 b\n");
    }

    #[test]
    fn test_json_output() {
        let results = vec![record("amd64", "a")];
        let mut out = Vec::new();
        write_results(&mut out, &results, &Output::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, json!([{"arch": "amd64", "path": "a"}]));
    }

    #[test]
    fn test_missing_field_names_item() {
        let results = vec![record("amd64", "a")];
        let mut out = Vec::new();
        let template = Template::parse("%(subarch)s").unwrap();
        let err = write_results(&mut out, &results, &Output::Lines(template)).unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("cannot format item"));
        assert!(msg.contains("subarch"));
    }

    #[test]
    fn test_broken_pipe_exit_detection() {
        let e = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(is_broken_pipe(&e));
        let e = anyhow::Error::new(MirrorError::Io(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe,
        )))
        .context("writing results");
        assert!(is_broken_pipe(&e));
        assert!(!is_broken_pipe(&anyhow::anyhow!("other")));
        assert_eq!(EXIT_BROKEN_PIPE, 141);
    }

    #[test]
    fn test_status_on_empty_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(cmd_status(tmp.path().to_path_buf()).is_ok());
    }
}
