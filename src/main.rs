mod direntry;
mod error;
mod fs;
mod rofs;

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fs2::FileExt;
use fuser::MountOption;
use libdrip::{Backend, RoStore, RwStore, StoreOptions};
use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(clap::Parser, Debug)]
#[clap(about = "Mount an oblivious synchronized store")]
struct Args {
    /// Directory holding the encrypted backend blocks
    backend: PathBuf,

    /// Where the filesystem is mounted
    mountpoint: PathBuf,

    /// Mount read-only
    #[clap(short = 'r', long)]
    read_only: bool,

    /// Backend slots rewritten per drip cycle
    #[clap(short = 'k', long = "drip-rate", default_value_t = 3)]
    drip_rate: usize,

    /// Seconds between drip cycles
    #[clap(short = 't', long = "drip-time", default_value_t = 3)]
    drip_time: u64,

    /// Verbose output
    #[clap(short = 'v', long)]
    verbose: bool,

    /// Send log output to a file ("-" for stdout)
    #[clap(short = 'd', long = "debug-file")]
    debug_file: Option<PathBuf>,
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|err| {
        let code = match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
            _ => 1,
        };
        let _ = err.print();
        std::process::exit(code);
    });

    init_logging(&args);

    if let Err(err) = run(args) {
        log::error!("{err:?}");
        std::process::exit(1);
    }
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    match args.debug_file.as_deref() {
        Some(path) if path.as_os_str() == "-" => {
            builder.target(env_logger::Target::Stdout);
        }
        Some(path) => match File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("could not open {}: {err}", path.display()),
        },
        None => {}
    }
    builder.init();
}

/// Passphrase prompted from the controlling terminal, folded down to the
/// 16-byte block cipher key.
fn getkey(backend: &std::path::Path) -> Result<[u8; 16]> {
    let phrase = rpassword::prompt_password(format!(
        "Enter passphrase for directory {}: ",
        backend.display()
    ))?;

    let digest = Sha256::digest(phrase.as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    Ok(key)
}

fn run(args: Args) -> Result<()> {
    let key = getkey(&args.backend)?;
    std::fs::create_dir_all(&args.backend)?;
    let backend = Backend::open(key, &args.backend)?;

    let mut mount_options = vec![MountOption::FSName("dripfs".to_string())];

    if args.read_only {
        mount_options.push(MountOption::RO);

        // refreshing faster than the writer drips buys nothing
        let thresh = Duration::from_secs(args.drip_time.max(1));
        let store = RoStore::open(backend, thresh)?;
        let filesystem = rofs::DripFsRo::new(store, thresh)?;
        fuser::mount2(filesystem, &args.mountpoint, &mount_options)?;
    } else {
        // one writer per backend; slot files are all plain integers, so the
        // lockfile is invisible to the slot scan
        let lockfile = File::create(args.backend.join("lock"))?;
        lockfile.try_lock_exclusive().map_err(|_| {
            std::io::Error::other("another process already has this backend open for writing")
        })?;

        let options = StoreOptions::default()
            .drip_rate(args.drip_rate)
            .drip_time(args.drip_time);
        let store = RwStore::open(backend, options)?;
        store.start()?;

        let filesystem = fs::DripFs::new(Arc::clone(&store))?;
        fuser::mount2(filesystem, &args.mountpoint, &mount_options)?;

        // drains the buffer before returning
        store.finish();
    }

    Ok(())
}
