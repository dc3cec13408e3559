//! Daemon command line.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{ArgAction, Parser};

#[derive(Debug, Parser)]
#[command(
    name = "ffind-daemon",
    version,
    disable_version_flag = true,
    about = "Filesystem indexing daemon",
    after_help = "Examples:\n  ffind-daemon /home/user/projects\n  \
                  ffind-daemon --foreground --db ~/.cache/ffind.db ~/code ~/docs"
)]
pub struct Args {
    /// Directories to index and watch.
    #[arg(value_name = "DIR", required = true)]
    pub roots: Vec<PathBuf>,

    /// Run in foreground (don't daemonize).
    #[arg(long)]
    pub foreground: bool,

    /// Enable SQLite persistence at PATH.
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Print version information.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,
}

/// Parses the command line. Help and version exit 0; anything invalid
/// (including a missing DIR) exits 1, matching the daemon's
/// startup-failure code.
pub fn parse() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_are_required() {
        assert!(Args::try_parse_from(["ffind-daemon"]).is_err());
    }

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from([
            "ffind-daemon",
            "--foreground",
            "--db",
            "/tmp/ff.db",
            "/home/a",
            "/home/b",
        ])
        .unwrap();
        assert!(args.foreground);
        assert_eq!(args.db, Some(PathBuf::from("/tmp/ff.db")));
        assert_eq!(args.roots.len(), 2);
    }
}
