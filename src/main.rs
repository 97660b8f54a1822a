use clap::{Parser, Subcommand};
use color_eyre::Result;
use querycache::{logging, Config, Persister};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "querycache")]
#[command(about = "Inspect and manage a persisted query cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querycache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the size of the persisted snapshot
  Size,
  /// Delete the persisted snapshot
  Clear,
  /// List the entries of the persisted snapshot
  Inspect,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.logging)?;

  let persister = Persister::new(config.open_storage()?, config.persist_config())
    .with_codec(config.persistence.codec.build());

  match args.command {
    Command::Size => {
      let size = persister.persisted_size().await?;
      println!("{} entries, {} bytes", size.entry_count, size.byte_count);
    }
    Command::Clear => {
      persister.clear().await?;
      println!("cleared namespace {}", persister.config().namespace);
    }
    Command::Inspect => match persister.inspect().await? {
      None => println!("nothing persisted"),
      Some(snapshot) => {
        println!(
          "schema v{}, written {}, {} entries",
          snapshot.schema_version,
          snapshot.snapshot_timestamp.to_rfc3339(),
          snapshot.entries.len()
        );
        for record in &snapshot.entries {
          println!("  {}  updated {}", record.key, record.data_updated_at.to_rfc3339());
        }
      }
    },
  }

  Ok(())
}
