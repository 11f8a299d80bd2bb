use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use x86_rmvisor::{DebugConsole, Monitor, RunSummary, VmmConfig, VmmError, host_platform};

/// Exit status when the guest image cannot be read.
const EXIT_IMAGE_READ: u8 = 3;

#[derive(Parser)]
#[command(name = "x86_rmvisor")]
#[command(about = "Boot a flat real-mode binary under VMX", long_about = None)]
struct Cli {
    /// Guest image, loaded at 0x100 and entered in 16-bit real mode
    image: PathBuf,
}

fn boot(image: &[u8]) -> Result<RunSummary, VmmError> {
    let monitor = Monitor::new(host_platform()?, VmmConfig::default())?;
    if monitor
        .add_device(Box::new(DebugConsole::new(std::io::stdout())))
        .is_err()
    {
        error!("[RMV] debug console port already taken");
    }
    monitor.run(image)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let image = match std::fs::read(&cli.image) {
        Ok(image) => image,
        Err(err) => {
            error!("cannot read {}: {err}", cli.image.display());
            return ExitCode::from(EXIT_IMAGE_READ);
        }
    };
    info!("[RMV] {}: {:#x} bytes", cli.image.display(), image.len());

    match boot(&image) {
        Ok(summary) => {
            info!(
                "[RMV] guest {:?} after {} resumes ({:?})",
                summary.state, summary.resumes, summary.exits
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}: {err}", err.category());
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::from(err.exit_code())
        }
    }
}
