//! DSvn FSFS inspection CLI

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dsvn_fsfs::{FileSystem, NodeKind, NodeRevId, NodeRevision, RepRef, Representation, Revnum};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dsvn-fsfs")]
#[command(author = "DSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Read-only inspection of FSFS repositories")]
struct Cli {
    /// Repository root directory
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Print cache statistics when done
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the youngest revision
    Youngest,

    /// Print the contents of a file
    Cat {
        path: String,
        #[arg(short = 'R', long)]
        revision: Option<Revnum>,
    },

    /// Print the fulltext of a representation, given its locator line
    /// (`<rev> <item> <size> <expanded-size> <md5> [<sha1> [<uniquifier>]]`)
    CatRep { locator: String },

    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short = 'R', long)]
        revision: Option<Revnum>,
    },

    /// Print the properties of a node
    Proplist {
        path: String,
        #[arg(short = 'R', long)]
        revision: Option<Revnum>,
    },

    /// Print the changed paths of a revision
    Changes { revision: Revnum },

    /// Print a node-revision header, given its id
    ShowNoderev { id: String },
}

/// Walk `path` down from the root of `rev`.
fn lookup(fs: &FileSystem, rev: Revnum, path: &str) -> Result<Arc<NodeRevision>> {
    let mut node = fs.node_rev(&fs.rev_root_id(rev)?)?;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if node.kind != NodeKind::Dir {
            bail!("'{}' is not a directory in r{}", node.created_path.as_deref().unwrap_or("?"), rev);
        }
        let entries = fs.dir_entries(&node)?;
        let entry = entries
            .iter()
            .find(|e| e.name == component)
            .with_context(|| format!("path '{}' not found in r{}", path, rev))?;
        debug!("{} -> {}", component, entry.id);
        node = fs.node_rev(&entry.id)?;
    }
    Ok(node)
}

fn resolve_rev(fs: &FileSystem, revision: Option<Revnum>) -> Result<Revnum> {
    match revision {
        Some(rev) => {
            fs.ensure_revision_exists(rev)?;
            Ok(rev)
        }
        None => Ok(fs.youngest_rev()?),
    }
}

fn run(fs: &FileSystem, command: Commands) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match command {
        Commands::Youngest => {
            writeln!(out, "{}", fs.youngest_rev()?)?;
        }

        Commands::Cat { path, revision } => {
            let rev = resolve_rev(fs, revision)?;
            let node = lookup(fs, rev, &path)?;
            let mut reader = fs.file_contents(&node)?;
            while let Some(chunk) = reader.next_chunk()? {
                out.write_all(&chunk)?;
            }
        }

        Commands::CatRep { locator } => {
            let rep = Representation::parse(&locator, None)?;
            let mut reader = fs.read_rep(&rep)?;
            std::io::copy(&mut reader, &mut out)?;
        }

        Commands::Ls { path, revision } => {
            let rev = resolve_rev(fs, revision)?;
            let node = lookup(fs, rev, &path)?;
            for entry in fs.dir_entries(&node)?.iter() {
                let suffix = if entry.kind == NodeKind::Dir { "/" } else { "" };
                writeln!(out, "{:<40} {}", format!("{}{}", entry.name, suffix), entry.id)?;
            }
        }

        Commands::Proplist { path, revision } => {
            let rev = resolve_rev(fs, revision)?;
            let node = lookup(fs, rev, &path)?;
            for (name, value) in fs.proplist(&node)?.iter() {
                writeln!(out, "  {}: {}", name, String::from_utf8_lossy(value))?;
            }
        }

        Commands::Changes { revision } => {
            for change in fs.paths_changed(revision)?.iter() {
                let flags = format!(
                    "{}{}",
                    if change.text_mod { "T" } else { "-" },
                    if change.prop_mod { "P" } else { "-" }
                );
                write!(out, "{:<8} {} {}", change.kind.as_str(), flags, change.path)?;
                if let Some((rev, path)) = &change.copyfrom {
                    write!(out, " (from {}@{})", path, rev)?;
                }
                writeln!(out)?;
            }
        }

        Commands::ShowNoderev { id } => {
            let id: NodeRevId = id.parse()?;
            let node = fs.node_rev(&id)?;
            out.write_all(node.serialize().as_bytes())?;
            if let Some(RepRef::Stored(rep)) = &node.text_rep {
                writeln!(out, "text-container: {}", rep.container)?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let repo = cli.repo.clone();
    let fs = tokio::task::spawn_blocking(move || FileSystem::open(&repo))
        .await?
        .with_context(|| format!("opening repository at {}", cli.repo.display()))?;
    info!("opened {} (format {})", cli.repo.display(), fs.format().number);

    let worker = fs.clone();
    tokio::task::spawn_blocking(move || run(&worker, cli.command)).await??;

    if cli.stats {
        for (name, stats) in fs.cache_stats() {
            eprintln!(
                "{:<10} hits {:>8} misses {:>8} entries {:>6} bytes {:>10}",
                name, stats.hits, stats.misses, stats.entries, stats.bytes
            );
        }
    }
    Ok(())
}
