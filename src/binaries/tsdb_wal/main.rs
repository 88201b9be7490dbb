use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use metricdb_common::iterator::AsyncIterator;
use metricdb_tsdb::wal::series::{list_log_files, SeriesWalIterator};

/// Dump the records of a series WAL directory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Parser)]
#[command(about, version)]
struct Config {
    /// series WAL directory, e.g. <shard>/index/wal/series
    #[arg(long)]
    pub path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    println!("config: {:?}", config);

    let files = list_log_files(&config.path).await?;
    if files.is_empty() {
        println!("no series wal files under {}", config.path.display());
        return Ok(());
    }

    let mut i = 0;
    for (seq, size) in files {
        let filename = format!("{:08}.wal", seq);
        println!("{} ({} bytes)", filename, size);

        let mut itr = SeriesWalIterator::open(config.path.join(&filename)).await?;
        while let Some((entry, offset)) = itr.try_next().await? {
            println!(
                "{}> metric={} tags_hash={:#018x} series={} @{}",
                i, entry.metric_id, entry.tags_hash, entry.series_id, offset
            );
            i += 1;
        }
    }

    Ok(())
}
