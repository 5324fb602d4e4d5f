//! needlestore CLI
//!
//! Operates directly on the volume directories of a storage node.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use needlestore::volume::{now_unix, scan_volume_file};
use needlestore::{FileId, Needle, Store, StoreConfig, Ttl, Volume, VolumeId};
use tracing_subscriber::{fmt, EnvFilter};

/// needlestore CLI
#[derive(Parser, Debug)]
#[command(name = "needlestore")]
#[command(about = "Inspect and modify needle volumes on local disk")]
#[command(version)]
struct Args {
    /// Volume directory (repeat for several)
    #[arg(short, long = "dir", default_value = "./needlestore_data")]
    dirs: Vec<PathBuf>,

    /// Maximum number of volumes per directory
    #[arg(short, long, default_value = "7")]
    max: usize,

    /// Workers used to open existing volumes
    #[arg(long, default_value = "10")]
    load_concurrency: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every local volume as JSON
    Status,

    /// Print the heartbeat this node would send, as JSON
    Heartbeat {
        /// Volume size limit used to decide expiry (bytes)
        #[arg(long, default_value = "0")]
        volume_size_limit: u64,
    },

    /// Create volumes, e.g. "1,3-5"
    AddVolume {
        ids: String,

        #[arg(short, long, default_value = "")]
        collection: String,

        /// Replica placement "xyz"
        #[arg(short, long, default_value = "000")]
        replication: String,

        /// Volume TTL such as "3d"
        #[arg(short, long, default_value = "")]
        ttl: String,

        #[arg(long, default_value = "0")]
        preallocate: u64,
    },

    /// Store a local file under a file id such as "3,01637037d6"
    Put {
        fid: String,

        file: PathBuf,

        #[arg(long)]
        mime: Option<String>,

        #[arg(short, long)]
        ttl: Option<String>,
    },

    /// Write the content of a file id to stdout or a file
    Get {
        fid: String,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a file id
    Delete { fid: String },

    /// List the records of a volume data file
    Scan {
        volume: u32,

        #[arg(short, long, default_value = "")]
        collection: String,

        /// Decode record bodies too
        #[arg(long)]
        body: bool,
    },

    /// Rebuild the index file of a volume from its data file
    Fix {
        volume: u32,

        #[arg(short, long, default_value = "")]
        collection: String,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,needlestore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> needlestore::Result<()> {
    match args.command {
        // Offline commands work on the files without opening a store
        Commands::Scan {
            volume,
            ref collection,
            body,
        } => {
            let dir = first_dir(&args.dirs);
            return scan_volume_file(
                &dir,
                collection,
                VolumeId(volume),
                body,
                |sb| {
                    println!(
                        "version={} replication={} ttl={}",
                        sb.version, sb.replica_placement, sb.ttl
                    );
                    Ok(())
                },
                |n, offset| {
                    println!("offset={} {}", offset, n);
                    Ok(())
                },
            );
        }
        Commands::Fix {
            volume,
            ref collection,
        } => {
            let dir = first_dir(&args.dirs);
            let records = Volume::rebuild_index(&dir, collection, VolumeId(volume))?;
            tracing::info!("indexed {} records of volume {}", records, volume);
            return Ok(());
        }
        _ => {}
    }

    let mut builder = StoreConfig::builder().load_concurrency(args.load_concurrency);
    for dir in &args.dirs {
        builder = builder.location(dir, args.max);
    }
    let store = Store::open(builder.build())?;

    match args.command {
        Commands::Status => {
            println!("{}", serde_json::to_string_pretty(&store.status())?);
        }
        Commands::Heartbeat { volume_size_limit } => {
            store.set_volume_size_limit(volume_size_limit);
            println!("{}", serde_json::to_string_pretty(&store.collect_heartbeat())?);
        }
        Commands::AddVolume {
            ids,
            collection,
            replication,
            ttl,
            preallocate,
        } => {
            store.add_volume(&ids, &collection, &replication, &ttl, preallocate)?;
        }
        Commands::Put {
            fid,
            file,
            mime,
            ttl,
        } => {
            let fid: FileId = fid.parse()?;
            let data = fs::read(&file)?;
            let mut n = Needle::new(fid.key, fid.cookie, data).with_last_modified(now_unix());
            if let Some(name) = file.file_name().and_then(|s| s.to_str()) {
                n = n.with_name(name.as_bytes().to_vec());
            }
            if let Some(mime) = mime {
                n = n.with_mime(mime.into_bytes());
            }
            if let Some(ttl) = ttl {
                n = n.with_ttl(ttl.parse::<Ttl>()?);
            }
            let size = store.write(fid.volume_id, &mut n)?;
            println!("{} {}", fid, size);
        }
        Commands::Get { fid, output } => {
            let fid: FileId = fid.parse()?;
            let mut n = Needle {
                id: fid.key,
                cookie: fid.cookie,
                ..Default::default()
            };
            store.read_volume_needle(fid.volume_id, &mut n)?;
            if n.cookie != fid.cookie {
                return Err(needlestore::StorageError::NotFound(fid.key));
            }
            match output {
                Some(path) => fs::write(path, &n.data)?,
                None => std::io::stdout().write_all(&n.data)?,
            }
        }
        Commands::Delete { fid } => {
            let fid: FileId = fid.parse()?;
            let n = Needle::tombstone(fid.key, fid.cookie);
            let freed = store.delete(fid.volume_id, &n)?;
            println!("{} {}", fid, freed);
        }
        Commands::Scan { .. } | Commands::Fix { .. } => {}
    }

    store.close()
}

fn first_dir(dirs: &[PathBuf]) -> PathBuf {
    dirs.first()
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."))
}
