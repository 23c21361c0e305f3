use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use trendscan_core::{clamp_result_count, parse_keywords};
use trendscan_pipeline::{ExportRow, PipelineConfig, SearchPipeline};

#[derive(Debug, Parser)]
#[command(name = "trendscan")]
#[command(about = "Search recent videos by keyword, rank them and export to Excel")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one search and print the ranked results
    Search {
        /// Comma-separated keywords
        #[arg(short, long)]
        keywords: String,

        /// Number of results, clamped to 5..=20
        #[arg(short = 'n', long, default_value_t = 20)]
        max_results: usize,

        /// Also write the results to this .xlsx file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Print rows as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Start the web front end
    Serve {
        #[arg(long, env = "TRENDSCAN_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(?cli, "arguments parsed");

    let config = PipelineConfig::from_env();
    match cli.command {
        Commands::Search {
            keywords,
            max_results,
            export,
            json,
        } => {
            let keywords = parse_keywords(&keywords);
            if keywords.is_empty() {
                bail!("please enter at least one keyword");
            }
            let pipeline = SearchPipeline::from_config(&config)?;
            let records = pipeline.run(&keywords, clamp_result_count(max_results)).await;
            let rows: Vec<ExportRow> = records.iter().map(ExportRow::from_record).collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_table(&rows);
            }

            if let Some(path) = export {
                if records.is_empty() {
                    bail!("no videos found; nothing to export");
                }
                let written = pipeline
                    .exporter()
                    .export(&records, &path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(path = %written.display(), rows = records.len(), "export written");
            }
        }
        Commands::Serve { port } => {
            trendscan_web::serve(config, port).await?;
        }
    }

    Ok(())
}

fn print_table(rows: &[ExportRow]) {
    if rows.is_empty() {
        println!("No videos found for your query. Try different keywords.");
        return;
    }
    println!(
        "{:<3} {:<10} {:>10} {:>8} {:>8} {:>8}  {:<24} {}",
        "#", "Date", "Views", "Likes", "Comments", "Duration", "Channel", "Title"
    );
    for (i, row) in rows.iter().enumerate() {
        println!(
            "{:<3} {:<10} {:>10} {:>8} {:>8} {:>8}  {:<24} {}",
            i + 1,
            row.date,
            row.views,
            row.likes,
            row.comments,
            row.duration,
            truncate(&row.channel, 24),
            row.title
        );
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('~');
    cut
}
