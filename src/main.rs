use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn, Level};

use lancaster::{
    Channel, Client, ClientOptions, FileEntry, HashId, Multicast, Server, TarballOptions,
    TarballReader, TransferConfig,
};

#[derive(Parser)]
#[command(name = "lancaster", version, about = "UDP multicast file transfer client and server")]
struct Args {
    /// IPv4 address of the network interface to bind multicast to
    #[arg(short, long, global = true)]
    interface: Option<Ipv4Addr>,

    /// UDP multicast group for transfers
    #[arg(short, long, global = true, default_value = "236.0.0.100:1360")]
    group: SocketAddrV4,

    /// multicast TTL
    #[arg(short, long, global = true, default_value_t = 8)]
    ttl: u32,

    /// deliver our own multicast sends back to this host (needed when sender
    /// and receiver share a machine)
    #[arg(short, long, global = true, default_value_t = false)]
    loopback: bool,

    /// lowest-common-denominator mode: no symlinks, no file modes
    #[arg(long, global = true, default_value_t = false)]
    compat: bool,

    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download files from a multicast group
    #[command(alias = "d")]
    Download {
        /// 16-hex-digit transfer id to wait for; the first announced
        /// transfer is taken otherwise
        hash_id: Option<String>,

        /// destination directory
        #[arg(long, default_value = ".")]
        into: PathBuf,
    },

    /// Serve files to a multicast group
    #[command(alias = "s")]
    Serve {
        /// PATH, PATH::SUBDIR (immediate contents under SUBDIR) or
        /// PATH:::SUBDIR (recursive)
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).try_init().ok();

    let mut config = TransferConfig::new(args.group);
    config.interface = args.interface;
    config.ttl = args.ttl;
    config.loopback = args.loopback;
    config.validate()?;

    let tarball_options = TarballOptions {
        compat_mode: args.compat,
    };

    match args.command {
        Command::Download { hash_id, into } => {
            let hash_id_filter = hash_id
                .as_deref()
                .map(HashId::from_hex)
                .transpose()
                .map_err(|_| anyhow!("transfer id must be 16 hex digits"))?;

            let mut multicast = Multicast::new(config.clone());
            multicast.join_sender(Channel::ControlToServer)?;
            let ctrl_rx = multicast.join_receiver(Channel::ControlToClient)?;
            let data_rx = multicast.join_receiver(Channel::Data)?;

            let client = Client::new(
                Arc::new(multicast),
                ClientOptions {
                    hash_id_filter,
                    root: into,
                    tarball: tarball_options,
                },
                config,
            );
            client.run(ctrl_rx, data_rx).await?;
        }

        Command::Serve { paths } => {
            let entries = collect_entries(&paths)?;
            if entries.is_empty() {
                bail!("no files to serve");
            }
            let reader = TarballReader::new(entries, tarball_options)?;

            let mut multicast = Multicast::new(config.clone());
            multicast.join_sender(Channel::ControlToClient)?;
            multicast.join_sender(Channel::Data)?;
            let ctrl_rx = multicast.join_receiver(Channel::ControlToServer)?;

            let server = Server::new(reader, Arc::new(multicast), config)?;
            tokio::select! {
                result = server.run(ctrl_rx) => result?,
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
        }
    }

    Ok(())
}

struct PathSpec<'a> {
    local: &'a str,
    subdir: &'a str,
    recursive: bool,
}

/// `p` serves a file under its basename or a directory's immediate files;
/// `p::s` places `p` (or its immediate contents) under `s`; `p:::s` walks
/// `p` recursively.
fn parse_path_spec(spec: &str) -> PathSpec<'_> {
    if let Some(i) = spec.rfind(":::") {
        if i > 0 {
            return PathSpec {
                local: &spec[..i],
                subdir: &spec[i + 3..],
                recursive: true,
            };
        }
    }
    if let Some(i) = spec.rfind("::") {
        if i > 0 {
            return PathSpec {
                local: &spec[..i],
                subdir: &spec[i + 2..],
                recursive: false,
            };
        }
    }
    PathSpec {
        local: spec,
        subdir: "",
        recursive: false,
    }
}

fn collect_entries(specs: &[String]) -> anyhow::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for raw in specs {
        let spec = parse_path_spec(raw);
        let local = Path::new(spec.local);

        let md = match fs::symlink_metadata(local) {
            Ok(md) => md,
            Err(e) => {
                warn!("skipping '{}': {}", spec.local, e);
                continue;
            }
        };

        if md.is_dir() {
            walk_dir(local, local, spec.subdir, spec.recursive, &mut entries)?;
        } else {
            let path = if spec.subdir.is_empty() {
                local
                    .file_name()
                    .ok_or_else(|| anyhow!("cannot derive a name from '{}'", spec.local))?
                    .to_string_lossy()
                    .into_owned()
            } else {
                spec.subdir.to_owned()
            };
            entries.push(new_entry(path, local.to_path_buf()));
        }
    }

    Ok(entries)
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    subdir: &str,
    recursive: bool,
    entries: &mut Vec<FileEntry>,
) -> anyhow::Result<()> {
    for dir_entry in fs::read_dir(dir).with_context(|| format!("reading {:?}", dir))? {
        let dir_entry = dir_entry?;
        let file_type = dir_entry.file_type()?;
        let full_path = dir_entry.path();

        if file_type.is_dir() {
            if recursive {
                walk_dir(root, &full_path, subdir, recursive, entries)?;
            }
            continue;
        }
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }

        let rel = full_path
            .strip_prefix(root)
            .expect("walked paths are below the walk root");
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let path = if subdir.is_empty() {
            rel
        } else {
            format!("{}/{}", subdir, rel)
        };

        entries.push(new_entry(path, full_path));
    }
    Ok(())
}

fn new_entry(path: String, local_path: PathBuf) -> FileEntry {
    // sizes, modes and symlink targets are filled in by the tarball reader
    FileEntry {
        path,
        local_path,
        size: 0,
        mode: 0,
        symlink_target: String::new(),
    }
}
