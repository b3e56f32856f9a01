//! `ferry version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "version: {}\ngit commit: {}",
        ferry_core::VERSION,
        ferry_core::GIT_COMMIT
    );
    Ok(())
}
