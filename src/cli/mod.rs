use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dock")]
#[command(about = "Browse, upload and download files on a shared server", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// JSON config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Server address for client commands (default: 127.0.0.1:5001)
    #[arg(long, short = 's', global = true)]
    pub server: Option<String>,

    /// Longest wait between reconnect attempts, e.g. "10s"
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub max_backoff: Option<Duration>,

    /// Disable progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve a directory
    Serve {
        /// Directory holding the files (default: ./files)
        #[arg(long, short = 'd')]
        dir: Option<PathBuf>,

        /// Address to listen on (default: 0.0.0.0:5001)
        #[arg(long, short = 'l')]
        listen: Option<SocketAddr>,

        /// Refuse uploads larger than this many bytes
        #[arg(long)]
        max_file_size: Option<u64>,
    },

    /// List the files on the server
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Upload one or more files
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Download a file
    Download {
        name: String,

        /// Output path (default: the file name in the current directory)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
