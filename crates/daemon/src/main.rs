use std::process::ExitCode;

use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

use bosfs_daemon::cli::Args;
use bosfs_daemon::fs::BosfsFs;
use bosfs_daemon::prepare::prepare;

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_logging(&args) {
        eprintln!("bosfs: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bosfs: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let prepared = runtime.block_on(prepare(&args))?;

    let mut options = vec![
        MountOption::FSName("bosfs".to_string()),
        MountOption::NoDev,
        MountOption::NoSuid,
    ];
    if prepared.allow_other {
        options.push(MountOption::AllowOther);
    }

    let fs = BosfsFs::new(prepared.core, runtime.handle().clone());
    tracing::info!(mountpoint = %prepared.mountpoint.display(), "mounting");
    fuser::mount2(fs, &prepared.mountpoint, &options)?;
    Ok(())
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}
