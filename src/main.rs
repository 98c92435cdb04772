use anyhow::Result;
use clap::{Parser, Subcommand};
use duckdb::Connection;
use nhstac::{
    activity,
    canonical::build_canonical,
    config::Config,
    enrich,
    logging,
    mapping::{build_line_dim, build_line_seed, build_provider_seed, build_subcode_dim},
    reports::{
        export_pfi, run_consultancy, run_it_consultancy, run_pfi,
        top_lines::{latest_fy, top_lines_path},
        write_top_lines,
    },
    store::{open_existing_db, FACT_TABLE},
};
use std::{path::PathBuf, time::Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "nhstac",
    version,
    about = "NHS TAC workbooks to a canonical fact table, mappings and spending reports"
)]
struct Cli {
    /// YAML configuration file (falls back to $NHSTAC_CONFIG, then defaults)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Extract raw TAC workbooks into Parquet and DuckDB
    BuildCanonical,
    /// Subcode labels per worksheet from the illustrative workbooks
    BuildSubcodes,
    /// Line definitions from the FT mapping schedules
    BuildLines,
    /// Provider roll-up to seed dim_provider.csv
    ProviderSeed,
    /// Build fact_tru_tac_enriched and the mapping QC
    Enrich,
    /// Largest unmapped subcode groups
    Unmapped,
    /// Compare join keys between facts and subcode labels
    DiagnoseJoins,
    /// Largest lines per sector for one year
    TopLines {
        #[arg(long)]
        fy: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Line classification seed from the top-lines report
    LineSeed,
    /// Bed counts matched to TAC organisations
    Beds,
    /// PFI spend, per-bed metrics and chart
    Pfi,
    /// Flourish-ready CSVs from the PFI per-bed data
    PfiExport,
    /// IT, intangibles and consultancy spend
    ItConsultancy,
    /// Consultancy as a share of turnover, with outliers
    Consultancy,
    /// Every step in order
    All,
}

fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    logging::init("info");
    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 2) config ───────────────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    info!(command = ?cli.command, "startup");

    let t0 = Instant::now();
    run(&cli.command, &cfg)?;
    info!("done in {:?}", t0.elapsed());
    Ok(())
}

fn db(cfg: &Config) -> Result<Connection> {
    open_existing_db(&cfg.paths.duckdb())
}

fn run(command: &Command, cfg: &Config) -> Result<()> {
    match command {
        Command::BuildCanonical => {
            let manifest = build_canonical(cfg)?;
            info!(
                "fact table: {} rows from {} workbooks",
                manifest.total_rows,
                manifest.sources.len()
            );
        }
        Command::BuildSubcodes => {
            let rows = build_subcode_dim(cfg)?;
            info!("{} subcode rows → {}", rows.len(), cfg.paths.subcode_dim().display());
        }
        Command::BuildLines => {
            let rows = build_line_dim(cfg)?;
            info!("{} lines → {}", rows.len(), cfg.paths.line_dim().display());
        }
        Command::ProviderSeed => {
            let seed = build_provider_seed(&db(cfg)?, &cfg.paths.provider_seed())?;
            info!("{} providers → {}", seed.len(), cfg.paths.provider_seed().display());
        }
        Command::Enrich => {
            enrich::enrich(&db(cfg)?, cfg)?;
        }
        Command::Unmapped => {
            let t = enrich::write_unmapped_report(&db(cfg)?, cfg)?;
            info!("{} unmapped groups", t.len());
        }
        Command::DiagnoseJoins => {
            enrich::write_join_diagnostics(&db(cfg)?, cfg)?;
        }
        Command::TopLines { fy, limit } => {
            let path = write_top_lines(&db(cfg)?, cfg, fy.as_deref(), *limit)?;
            info!("wrote {}", path.display());
        }
        Command::LineSeed => {
            let conn = db(cfg)?;
            let limit = cfg.reports.top_lines_per_sector;
            let fy = match cfg.reports.top_lines_fy.clone() {
                Some(fy) => Some(fy),
                None => latest_fy(&conn)?,
            };
            let Some(fy) = fy else {
                anyhow::bail!("{} is empty; run build-canonical first", FACT_TABLE);
            };
            let top = top_lines_path(cfg, limit, &fy);
            if !top.exists() {
                write_top_lines(&conn, cfg, Some(&fy), Some(limit))?;
            }
            let rows = build_line_seed(&top, &cfg.paths.line_seed())?;
            info!("{} line keys → {}", rows.len(), cfg.paths.line_seed().display());
        }
        Command::Beds => {
            let rows = activity::build_beds(&db(cfg)?, cfg)?;
            info!("{} bed rows → {}", rows.len(), cfg.paths.beds_matched().display());
        }
        Command::Pfi => {
            let report = run_pfi(&db(cfg)?, cfg)?;
            info!(
                "{} PFI codes, {} org-years, per-bed rows: {}",
                report.codes.len(),
                report.spend.len(),
                report.with_beds.as_ref().map_or(0, Vec::len)
            );
        }
        Command::PfiExport => {
            let files = export_pfi(cfg)?;
            info!("{} export files", files.len());
        }
        Command::ItConsultancy => {
            run_it_consultancy(&db(cfg)?, cfg)?;
        }
        Command::Consultancy => {
            let counts = run_consultancy(&db(cfg)?, cfg)?;
            info!("{} organisations scored for {}", counts.organisations, counts.latest_fy);
        }
        Command::All => {
            for step in [
                Command::BuildCanonical,
                Command::BuildSubcodes,
                Command::Enrich,
                Command::Unmapped,
                Command::DiagnoseJoins,
                Command::TopLines { fy: None, limit: None },
                Command::ProviderSeed,
            ] {
                run(&step, cfg)?;
            }
            // optional inputs: bed workbooks and FT mapping schedules
            for step in [Command::BuildLines, Command::Beds] {
                if let Err(e) = run(&step, cfg) {
                    warn!("skipping {:?}: {:#}", step, e);
                }
            }
            for step in [
                Command::Pfi,
                Command::PfiExport,
                Command::ItConsultancy,
                Command::Consultancy,
            ] {
                if let Err(e) = run(&step, cfg) {
                    warn!("{:?} failed: {:#}", step, e);
                }
            }
        }
    }
    Ok(())
}
