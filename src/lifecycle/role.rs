//! Process role, derived from spawn metadata.

use crate::cli::Cli;
use crate::config::ProcessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Owns no listeners; spawns and supervises the worker process group.
    Coordinator,
    /// Owns listeners and serves. `top` is the supervising coordinator, if any.
    Worker { top: Option<u32> },
}

impl ProcessRole {
    /// A process spawned with `--topid` is always a worker; otherwise it
    /// coordinates when supervision is configured.
    pub fn detect(cli: &Cli, process: &ProcessConfig) -> Self {
        match cli.topid {
            Some(top) => ProcessRole::Worker { top: Some(top) },
            None if process.supervise && cfg!(unix) => ProcessRole::Coordinator,
            None => ProcessRole::Worker { top: None },
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, ProcessRole::Coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        let mut cli = Cli::for_spawn("gracehttp.toml".into());
        let mut process = ProcessConfig::default();
        assert_eq!(ProcessRole::detect(&cli, &process), ProcessRole::Worker { top: None });

        process.supervise = true;
        assert_eq!(ProcessRole::detect(&cli, &process).is_coordinator(), cfg!(unix));

        cli.topid = Some(77);
        assert_eq!(ProcessRole::detect(&cli, &process), ProcessRole::Worker { top: Some(77) });
    }
}
