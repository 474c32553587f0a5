use clap::{Arg, ArgMatches, Command};
use region_store::{
    atomic_file_store::{AtomicFileStore, RecoveryAction},
    config::Config,
    logging::LoggerManager,
    Result, StoreError,
};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};

/// Build CLI argument parser
fn build_cli() -> Command {
    Command::new("region-store")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Maintenance tool for crash-safe world data files")
        .subcommand_required(true)
        .args(Config::cli_args())
        .subcommand(
            Command::new("read")
                .about("Print a file's content to stdout")
                .arg(Arg::new("path").required(true).value_name("PATH")),
        )
        .subcommand(
            Command::new("write")
                .about("Atomically replace a file with the content of SOURCE ('-' for stdin)")
                .arg(Arg::new("path").required(true).value_name("PATH"))
                .arg(Arg::new("source").required(true).value_name("SOURCE")),
        )
        .subcommand(
            Command::new("recover")
                .about("Repair the _new/_old leftovers of an interrupted write")
                .arg(Arg::new("path").required(true).value_name("PATH")),
        )
        .subcommand(Command::new("show-config").about("Print the effective configuration as YAML"))
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    if let Err(e) = run(&matches).await {
        error!("Command failed: {}", e);
        eprintln!("region-store: {}", e);
        std::process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let config = Config::from_matches(matches)?;

    let mut logger_manager = LoggerManager::new(config.logging.clone());
    logger_manager.initialize()?;
    if let Some(path) = matches.get_one::<String>("config") {
        info!("Configuration file: {}", path);
    }
    config.log_summary();

    let store = AtomicFileStore::new(config.file_store.to_store_config());

    match matches.subcommand() {
        Some(("read", sub)) => {
            let path = required_path(sub, "path")?;
            let data = store.read(&path).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Some(("write", sub)) => {
            let path = required_path(sub, "path")?;
            let source = required_path(sub, "source")?;
            let data = read_source(&source).await?;
            let len = data.len();
            store.write(path.clone(), data).await?;
            info!("Wrote file: path={:?}, bytes={}", path, len);
        }
        Some(("recover", sub)) => {
            let path = required_path(sub, "path")?;
            let action = store.recover_interrupted_write(&path).await?;
            match action {
                RecoveryAction::Nothing => println!("{}: nothing to recover", path.display()),
                other => println!("{}: {:?}", path.display(), other),
            }
        }
        Some(("show-config", _)) => {
            print!("{}", config.to_yaml()?);
        }
        _ => {
            return Err(StoreError::ConfigError("No subcommand given".to_string()));
        }
    }

    Ok(())
}

fn required_path(matches: &ArgMatches, name: &str) -> Result<PathBuf> {
    matches
        .get_one::<String>(name)
        .map(PathBuf::from)
        .ok_or_else(|| StoreError::ConfigError(format!("Missing argument: {}", name)))
}

async fn read_source(source: &Path) -> Result<Vec<u8>> {
    if source == Path::new("-") {
        let mut data = Vec::new();
        tokio::io::stdin().read_to_end(&mut data).await?;
        return Ok(data);
    }
    tokio::fs::read(source).await.map_err(|e| {
        StoreError::IoError(format!("Failed to read source file {:?}: {}", source, e))
    })
}
