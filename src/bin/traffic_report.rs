//! traffic_report - export one location's counts for a time range as CSV

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use clap::Parser;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;

use trafficcam::{SqliteTelemetrySink, TrafficResult};

#[path = "../ui.rs"]
mod ui;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const CSV_HEADER: &str = "cameraLocationId,timestamp,cars,trucks,people";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Camera location id to report on.
    location_id: u64,
    /// Range start, local time `YYYY-MM-DD HH:MM:SS`.
    begin: String,
    /// Range end (inclusive), local time `YYYY-MM-DD HH:MM:SS`.
    end: String,
    /// Telemetry database written by trafficd.
    #[arg(long, default_value = "traffic.db")]
    db_path: String,
    /// Output file; defaults to `result_{location_id}.csv`.
    #[arg(long)]
    output: Option<PathBuf>,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

fn parse_local(raw: &str) -> Result<u64> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), TIME_FORMAT)
        .with_context(|| format!("'{}' does not match {}", raw, TIME_FORMAT))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("'{}' does not exist in the local time zone", raw))?;
    u64::try_from(local.timestamp()).map_err(|_| anyhow!("'{}' is before the Unix epoch", raw))
}

fn write_csv(out: &mut impl Write, rows: &[TrafficResult]) -> Result<()> {
    writeln!(out, "{}", CSV_HEADER)?;
    for row in rows {
        writeln!(
            out,
            "{},{},{},{},{}",
            row.camera_location_id,
            row.timestamp,
            row.number_cars,
            row.number_trucks,
            row.number_people
        )?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(args.ui, is_tty, !stdout_is_tty);

    let begin = parse_local(&args.begin)?;
    let end = parse_local(&args.end)?;
    if end < begin {
        return Err(anyhow!("end {} is before begin {}", args.end, args.begin));
    }

    let rows = {
        let mut stage = ui.stage("Query telemetry");
        let sink = SqliteTelemetrySink::open(&args.db_path)?;
        let rows = sink.query_range(args.location_id, begin, end)?;
        stage.detail(format!("{} rows", rows.len()));
        rows
    };

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("result_{}.csv", args.location_id)));
    {
        let _stage = ui.stage("Write CSV");
        let mut file = std::io::BufWriter::new(
            std::fs::File::create(&output)
                .with_context(|| format!("create {}", output.display()))?,
        );
        write_csv(&mut file, &rows)?;
        file.flush()?;
    }
    println!("{} rows written to {}", rows.len(), output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_timestamps() {
        let begin = parse_local("2018-10-14 00:00:00").unwrap();
        let end = parse_local("2018-10-15 00:00:00").unwrap();
        assert_eq!(end - begin, 86_400);
        assert!(parse_local("14/10/2018").is_err());
    }

    #[test]
    fn csv_has_header_and_one_line_per_record() {
        let rows = vec![TrafficResult {
            timestamp: 1_539_560_991,
            camera_location_id: 123,
            number_cars: 1,
            number_trucks: 0,
            number_people: 1,
        }];
        let mut out = Vec::new();
        write_csv(&mut out, &rows).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "cameraLocationId,timestamp,cars,trucks,people\n123,1539560991,1,0,1\n"
        );
    }
}
