//! Command line of the `gracehttp` server binary.
//!
//! Besides `--config`, the flags carry the spawn metadata a process passes
//! to its successor. They are not meant to be typed by hand.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

use crate::net::inherit::Descriptor;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "gracehttp")]
#[command(about = "Multi-listener HTTP server with graceful restart", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "gracehttp.toml")]
    pub config: PathBuf,

    /// Server names whose listeners were handed over
    #[arg(long, value_delimiter = ',', hide = true)]
    pub name: Vec<String>,

    /// Inherited descriptor on which to report readiness
    #[arg(long, hide = true)]
    pub control_fd: Option<Descriptor>,

    /// Number of inherited listener descriptors
    #[arg(long, hide = true)]
    pub fcount: Option<usize>,

    /// Process id of the top-level coordinator
    #[arg(long, hide = true)]
    pub topid: Option<u32>,
}

impl Cli {
    /// A command line for a spawned process. Metadata of this process is
    /// not carried over.
    pub fn for_spawn(config: PathBuf) -> Self {
        Self {
            config,
            name: Vec::new(),
            control_fd: None,
            fcount: None,
            topid: None,
        }
    }

    /// True when this process was spawned as a successor.
    pub fn is_successor(&self) -> bool {
        self.control_fd.is_some()
    }

    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--config".into(), self.config.clone().into()];
        if !self.name.is_empty() {
            args.push(format!("--name={}", self.name.join(",")).into());
        }
        if let Some(fd) = self.control_fd {
            args.push(format!("--control-fd={fd}").into());
        }
        if let Some(count) = self.fcount {
            args.push(format!("--fcount={count}").into());
        }
        if let Some(topid) = self.topid {
            args.push(format!("--topid={topid}").into());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_args_round_trip() {
        let cli = Cli {
            config: "/etc/gracehttp.toml".into(),
            name: vec!["api".into(), "admin".into()],
            control_fd: Some(6),
            fcount: Some(3),
            topid: Some(4242),
        };
        let mut argv: Vec<OsString> = vec!["gracehttp".into()];
        argv.extend(cli.to_args());
        assert_eq!(Cli::parse_from(argv), cli);
        assert!(cli.is_successor());
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["gracehttp"]);
        assert_eq!(cli.config, PathBuf::from("gracehttp.toml"));
        assert!(!cli.is_successor());
        assert_eq!(cli, Cli::for_spawn("gracehttp.toml".into()));
    }
}
