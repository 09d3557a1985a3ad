use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use clap::{Parser, Subcommand};
use oci_depot::{default_store_dir, Digest, Distributor, EventHandler, Reference, Repository};

#[derive(Parser, Debug)]
struct Args {
    /// Directory for the blob store and the index.
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// CPU architecture to download.
    #[arg(short, long)]
    arch: Option<String>,

    /// Operating system to download.
    #[arg(short, long)]
    os: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download an image.
    Pull { image: String },

    /// Upload an image to its registry.
    Push { image: String },

    /// Add a tag to a local image.
    Tag { source: String, target: String },

    /// Delete a local reference.
    Rm {
        image: String,

        /// Delete a digest even if tags point to it.
        #[arg(short, long)]
        force: bool,
    },

    /// List the references of a repository, or all repositories.
    Ls { repository: Option<String> },
}

#[derive(Default)]
struct Logger {
    received: AtomicU64,
}

impl EventHandler for Logger {
    fn registry_request(&self, method: &str, url: &str) {
        println!("{method} {url}");
    }

    fn registry_auth(&self, url: &str) {
        println!("AUTH {url}");
    }

    fn retry(&self, what: &str, attempt: u32, cause: &dyn std::fmt::Display) {
        println!("RETRY {what} (attempt {attempt}): {cause}");
    }

    fn download_start(&self, blobs: usize, bytes: u64) {
        println!("Downloading {blobs} blobs, {bytes} bytes");
    }

    fn download_progress_bytes(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn blob_skipped(&self, digest: &Digest) {
        println!("SKIP {digest}");
    }

    fn blob_committed(&self, digest: &Digest) {
        println!("STORED {digest}");
    }

    fn blob_uploaded(&self, digest: &Digest) {
        println!("UPLOADED {digest}");
    }

    fn finished(&self) {
        let received = self.received.swap(0, Ordering::Relaxed);
        if received > 0 {
            println!("Received {received} bytes");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let root = match args.root.or_else(default_store_dir) {
        Some(root) => root,
        None => return Err("Missing --root".into()),
    };

    let mut builder = Distributor::builder(root).event_handler(Logger::default());

    if let Some(arch) = args.arch {
        builder = builder.architecture(arch);
    }

    if let Some(os) = args.os {
        builder = builder.os(os);
    }

    let distributor = builder.build()?;

    match args.command {
        Command::Pull { image } => {
            let pulled = distributor.pull(&Reference::parse(&image)?)?;
            println!("{}", pulled.reference);
        }

        Command::Push { image } => {
            let digest = distributor.push(&Reference::parse(&image)?)?;
            println!("{digest}");
        }

        Command::Tag { source, target } => {
            distributor.tag(&Reference::parse(&source)?, &Reference::parse(&target)?)?;
        }

        Command::Rm { image, force } => {
            let removal = distributor.delete(&Reference::parse(&image)?, force)?;

            for reference in &removal.untagged {
                println!("Untagged: {reference}");
            }

            for image in &removal.deleted {
                println!("Deleted: {image}");
            }
        }

        Command::Ls { repository: None } => {
            for repository in distributor.repositories() {
                println!("{repository}");
            }
        }

        Command::Ls {
            repository: Some(repository),
        } => {
            let repository: Repository = repository.parse()?;

            for entry in distributor.list(&repository) {
                println!(
                    "{}\t{}\t{}",
                    entry.tag.as_deref().unwrap_or("<none>"),
                    entry.digest,
                    entry.image,
                );
            }
        }
    }

    Ok(())
}
