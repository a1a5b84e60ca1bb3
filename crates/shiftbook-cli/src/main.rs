use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use shiftbook_adapters::{export_rows, write_csv, write_schedule_workbook};
use shiftbook_core::{
    group_by_site, sort_by_weekday, ScheduleRecord, SheetConfig, Shift, DEFAULT_WORKSHEET,
};
use shiftbook_storage::HttpFetcher;
use shiftbook_sync::{import_upload_file, sync_from_sheet, SyncConfig};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "shiftbook")]
#[command(about = "Weekly employee shift schedules")]
struct Cli {
    /// Directory holding the stored employee and schedule data.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Summarize every schedule.
    List,
    /// Show one employee's shifts.
    Show {
        employee_id: String,
        #[arg(long)]
        by_site: bool,
    },
    /// Replace all schedules with the rows of a workbook or CSV file.
    Import {
        path: PathBuf,
        #[arg(long)]
        mime: Option<String>,
    },
    /// Write all schedules to a `.csv` file or a workbook.
    Export { path: PathBuf },
    /// Replace all schedules with the rows of the remote sheet.
    Sync {
        #[arg(long)]
        sheet_id: Option<String>,
        #[arg(long)]
        worksheet: Option<String>,
    },
    /// Store the remote sheet used by `sync`.
    ConfigureSheet {
        sheet_id: String,
        worksheet: Option<String>,
    },
    AddShift {
        employee_id: String,
        #[command(flatten)]
        shift: ShiftArgs,
    },
    EditShift {
        employee_id: String,
        index: usize,
        #[command(flatten)]
        shift: ShiftArgs,
    },
    DeleteShift {
        employee_id: String,
        index: usize,
    },
}

#[derive(Debug, Args)]
struct ShiftArgs {
    #[arg(long)]
    day: String,
    #[arg(long)]
    site: String,
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
}

impl From<ShiftArgs> for Shift {
    fn from(args: ShiftArgs) -> Self {
        Shift::new(args.day, args.site, args.start, args.end)
    }
}

fn init_logging() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing log subscriber")
}

fn summary_line(record: &ScheduleRecord) -> String {
    format!(
        "{} ({}): {} shifts scheduled, {:.2} hours. Sites: {}",
        record.employee_name,
        record.employee_id,
        record.shifts.len(),
        record.total_hours(),
        record.sites().join(", ")
    )
}

fn shift_line(index: usize, shift: &Shift) -> String {
    format!(
        "  [{index}] {:<9} {:<12} {} - {} ({})",
        shift.day,
        shift.site,
        shift.start_time,
        shift.end_time,
        shift.duration_label()
    )
}

/// Position of `shift` in `record.shifts`, which edit and delete address by.
fn stored_index(record: &ScheduleRecord, shift: &Shift) -> usize {
    record
        .shifts
        .iter()
        .position(|s| std::ptr::eq(s, shift))
        .unwrap_or_default()
}

fn show(record: &ScheduleRecord, by_site: bool) {
    println!("{}", summary_line(record));
    if by_site {
        for group in group_by_site(&record.shifts) {
            println!("{}:", group.site);
            for shift in group.shifts {
                println!("{}", shift_line(stored_index(record, shift), shift));
            }
        }
    } else {
        for shift in sort_by_weekday(&record.shifts) {
            println!("{}", shift_line(stored_index(record, shift), shift));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command.unwrap_or(Commands::List) {
        Commands::List => {
            let pipeline = config.open_pipeline();
            for record in pipeline.schedules().list_all() {
                println!("{}", summary_line(record));
            }
        }
        Commands::Show {
            employee_id,
            by_site,
        } => {
            let pipeline = config.open_pipeline();
            let record = pipeline
                .schedules()
                .get(&employee_id)
                .ok_or_else(|| anyhow!("no schedule for employee {employee_id:?}"))?;
            show(record, by_site);
        }
        Commands::Import { path, mime } => {
            let mut pipeline = config.open_pipeline();
            let report = import_upload_file(&mut pipeline, &path, mime.as_deref())?;
            println!(
                "processed {} employee schedules ({} shifts, {} rows skipped)",
                report.schedules,
                report.shifts_added,
                report.skipped.len()
            );
            for skipped in &report.skipped {
                println!(
                    "  row {} missing {}",
                    skipped.row_index + 1,
                    skipped.missing.join(", ")
                );
            }
        }
        Commands::Export { path } => {
            let pipeline = config.open_pipeline();
            let is_csv = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            let bytes = if is_csv {
                write_csv(&export_rows(pipeline.schedules())).into_bytes()
            } else {
                write_schedule_workbook(pipeline.schedules())?
            };
            std::fs::write(&path, bytes)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("exported {} shifts to {}", pipeline.schedules().total_shifts(), path.display());
        }
        Commands::Sync {
            sheet_id,
            worksheet,
        } => {
            let mut pipeline = config.open_pipeline();
            let stored = config.resolve_sheet(pipeline.sheet_config());
            let sheet = SheetConfig::new(
                sheet_id.unwrap_or(stored.sheet_id),
                worksheet.unwrap_or(stored.worksheet),
            );
            let http = HttpFetcher::new(config.http_client_config())?;
            let summary = sync_from_sheet(&mut pipeline, &http, &sheet).await?;
            println!(
                "sync complete: run_id={} source={} rows={} schedules={}",
                summary.run_id, summary.source_id, summary.rows_fetched, summary.report.schedules
            );
        }
        Commands::ConfigureSheet {
            sheet_id,
            worksheet,
        } => {
            let pipeline = config.open_pipeline();
            let sheet = SheetConfig::new(
                sheet_id,
                worksheet.unwrap_or_else(|| DEFAULT_WORKSHEET.to_string()),
            );
            pipeline.configure_sheet(&sheet)?;
            println!("sheet settings saved: {} / {}", sheet.sheet_id, sheet.worksheet);
        }
        Commands::AddShift { employee_id, shift } => {
            let mut pipeline = config.open_pipeline();
            let mut editor = pipeline.editor(&employee_id)?;
            editor.add_shift(shift.into())?;
            println!("{} now has {} shifts", employee_id, editor.shifts().len());
        }
        Commands::EditShift {
            employee_id,
            index,
            shift,
        } => {
            let mut pipeline = config.open_pipeline();
            let mut editor = pipeline.editor(&employee_id)?;
            if editor.replace_shift(index, shift.into())? {
                println!("updated shift {index} for {employee_id}");
            } else {
                println!("no shift {index} for {employee_id}; nothing changed");
            }
        }
        Commands::DeleteShift { employee_id, index } => {
            let mut pipeline = config.open_pipeline();
            let mut editor = pipeline.editor(&employee_id)?;
            match editor.delete_shift(index) {
                Some(removed) => println!("deleted {} shift at {}", removed.day, removed.site),
                None => println!("no shift {index} for {employee_id}; nothing changed"),
            }
        }
    }

    Ok(())
}
