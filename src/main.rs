use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use tracemask::report::Report;
use tracemask::{Pipeline, Project};

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "Consistently anonymize pcap captures and text logs: IPs, domains, phone numbers, MACs and names are replaced by structure-preserving synthetic values.")]
struct Args {
    /// Project directory (data/, in/, out/, trash/, validation/, report/)
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Seed for replacement generation, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Print the run summary as JSON to stdout
    #[arg(long, default_value_t = false)]
    report: bool,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Create the project layout and a default data/config.yml
    Init,
    /// Collect identifiers from in/ into the stores
    Discover,
    /// Generate replacements for every new identifier
    Generate,
    /// Write anonymized copies of in/ to out/, quarantining dropped packets in trash/
    Anonymize,
    /// Check out/ for residual original values
    Validate,
    /// Discover, generate, anonymize and validate
    Run,
    /// Remove out/, trash/, validation/ and report/
    Clean,
}

// ─── Summary ──────────────────────────────────────────────────────────────────

fn print_summary(report: &Report) {
    println!("=== Anonymization Summary ===");
    for phase in &report.phases {
        println!("Phase:                       {:?}", phase.phase);
        println!("  Files:                     {}", phase.files.len());
        println!("  Records:                   {}", phase.records());
        println!("  Written:                   {}", phase.written());
        println!("  Quarantined:               {}", phase.quarantined());
        println!("  Drops:                     {}", phase.drops());
    }
    println!("─────────────────────────────────────────");
    for (kind, stats) in &report.stores {
        println!("{:<29}{} ({} resolved)", format!("{} values:", kind), stats.values, stats.resolved);
    }
    if report.phases.iter().any(|p| p.phase == tracemask::packet::Phase::Validate) {
        println!("Validation findings:         {}", report.findings.len());
    }
    if let Some(seed) = report.seed {
        println!("Seed:                        {}", seed);
    }
}

// ─── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).with_target(false).with_writer(std::io::stderr).init();

    let project = Project::new(args.project.clone());
    match args.command {
        Command::Init => return project.init(),
        Command::Clean => return project.clean(),
        _ => {}
    }

    info!("Opening project {:?}", project.root());
    let mut pipeline = Pipeline::open(project, args.seed)?;
    match args.command {
        Command::Discover => pipeline.discover()?,
        Command::Generate => pipeline.generate()?,
        Command::Anonymize => pipeline.anonymize()?,
        Command::Validate => pipeline.validate()?,
        Command::Run => pipeline.run()?,
        Command::Init | Command::Clean => {}
    }

    if args.report {
        println!("{}", serde_json::to_string_pretty(pipeline.report())?);
    } else {
        print_summary(pipeline.report());
    }
    Ok(())
}
