use std::path::PathBuf;

use clap::Parser;

/// Raw positional arguments as handed to `lisod` on the command line.
#[derive(Debug, Parser)]
#[command(name = "lisod", about = "A single-host HTTP/1.1 origin server")]
pub struct Cli {
    /// TCP port to accept HTTP connections on.
    pub http_port: u16,
    /// Path to the append-mode diagnostic log file.
    pub log_file: PathBuf,
    /// Path to the advisory lock file used to prevent a second instance.
    pub lock_file: PathBuf,
    /// Document root served for static GET/HEAD requests.
    pub www_folder: PathBuf,
    /// Path to the CGI script invoked for requests under `/cgi/`.
    pub cgi_script_path: PathBuf,
    /// Run in the foreground instead of daemonizing (used by tests).
    #[arg(long)]
    pub foreground: bool,
}

/// Immutable, `Arc`-shared configuration every component is handed by
/// reference. Built once from `Cli` at startup.
#[derive(Debug)]
pub struct Config {
    pub http_port: u16,
    pub log_file: PathBuf,
    pub lock_file: PathBuf,
    pub www_folder: PathBuf,
    pub cgi_script_path: PathBuf,
    pub foreground: bool,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            http_port: cli.http_port,
            log_file: cli.log_file,
            lock_file: cli.lock_file,
            www_folder: cli.www_folder,
            cgi_script_path: cli.cgi_script_path,
            foreground: cli.foreground,
        }
    }
}
