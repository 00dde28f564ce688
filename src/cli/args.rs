use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub struct MainArgs {
    /// The path to the config file for the drone
    #[clap(long, short)]
    pub config: PathBuf,

    /// The path to a text file containing a list of commands to execute
    /// instead of starting the prompt
    #[clap(long, short)]
    pub script: Option<PathBuf>,
}
