//! archive_fetch - pull archived raw images for chosen camera locations
//!
//! Lists `{bucket}/raw/` in a `file://` archive store and copies every image
//! whose location id was asked for into `<output>/<location_id>/<file>`.
//! Files already present in the output are left alone, so reruns only pull
//! what is new.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::PathBuf;

use trafficcam::archive::Category;
use trafficcam::naming::ImageName;
use trafficcam::{FilesystemObjectStore, PipelineConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Camera location ids to pull.
    #[arg(required = true, num_args = 1.., value_delimiter = ',')]
    locations: Vec<u64>,
    /// Config file (TOML or JSON) naming the archive store and bucket.
    #[arg(long, env = "TRAFFIC_CONFIG")]
    config: Option<PathBuf>,
    /// Archive store root; overrides `archive.store`.
    #[arg(long)]
    store: Option<String>,
    /// Directory the images are copied into.
    #[arg(long, default_value = ".")]
    output: PathBuf,
    /// Print matching keys without copying anything.
    #[arg(long)]
    list: bool,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

/// Keys whose file name carries one of `locations`, paired with that id.
fn select(keys: &[String], locations: &BTreeSet<u64>) -> Vec<(u64, String)> {
    keys.iter()
        .filter_map(|key| {
            let file_name = key.rsplit('/').next()?;
            let name = ImageName::parse(file_name)?;
            locations
                .contains(&name.location_id)
                .then(|| (name.location_id, key.clone()))
        })
        .collect()
}

fn store_root(spec: &str) -> Result<PathBuf> {
    spec.strip_prefix("file://")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("archive_fetch reads file:// stores only, got '{}'", spec))
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(args.ui, is_tty, !stdout_is_tty);

    let cfg = PipelineConfig::load_from(args.config.as_deref())?;
    let spec = args.store.clone().unwrap_or(cfg.archive.store);
    let store = FilesystemObjectStore::new(store_root(&spec)?);
    let locations: BTreeSet<u64> = args.locations.iter().copied().collect();

    let matches = {
        let mut stage = ui.stage("List archived images");
        let prefix = format!("{}/{}/", cfg.archive.bucket, Category::Raw.as_str());
        let keys = store.list(&prefix)?;
        let matches = select(&keys, &locations);
        stage.detail(format!("{} of {} objects match", matches.len(), keys.len()));
        matches
    };

    if args.list {
        for (_, key) in &matches {
            println!("{}", key);
        }
        return Ok(());
    }

    let mut copied = 0usize;
    let mut skipped = 0usize;
    {
        let mut stage = ui.stage("Copy images");
        for (location_id, key) in &matches {
            let Some(file_name) = key.rsplit('/').next() else {
                continue;
            };
            let dest = args.output.join(location_id.to_string()).join(file_name);
            if dest.exists() {
                skipped += 1;
                continue;
            }
            match store.get_object(key, &dest) {
                Ok(_) => copied += 1,
                Err(e) => log::warn!("skipping {}: {:#}", key, e),
            }
        }
        stage.detail(format!("{} copied, {} already present", copied, skipped));
    }
    println!(
        "{} images copied to {} ({} already present)",
        copied,
        args.output.display(),
        skipped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_only_requested_locations() {
        let keys: Vec<String> = [
            "ourcamera/raw/2018/10/14/23/126_932_1539560991.jpg",
            "ourcamera/raw/2018/10/14/23/127_1161_1539560991.jpg",
            "ourcamera/raw/2018/10/14/23/128_529_1539560991.jpg",
            "ourcamera/raw/2018/10/14/23/.DS_Store",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        let wanted = BTreeSet::from([932, 1161]);
        let picked: Vec<u64> = select(&keys, &wanted).into_iter().map(|(id, _)| id).collect();
        assert_eq!(picked, vec![932, 1161]);
    }

    #[test]
    fn only_filesystem_stores_are_readable() {
        assert_eq!(
            store_root("file:///srv/archive").unwrap(),
            PathBuf::from("/srv/archive")
        );
        assert!(store_root("https://archive.example.net").is_err());
    }
}
