use clap::Parser;
use std::path::PathBuf;

use crate::config::PipelineConfig;
use crate::entities::CaptureId;

/// Simulated multi-frame capture session
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Pipeline settings file (JSON). Default: capture.json in the config directory
    #[arg(short = 'C', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Write the effective settings to the config file and exit
    #[arg(long = "save-config")]
    pub save_config: bool,

    /// Enable logging to file (default: capture.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Fused cycles to run
    #[arg(short = 'n', long = "cycles", value_name = "N")]
    pub cycles: Option<u64>,

    /// Capture ids of one bundle, in fusion order
    #[arg(short = 'b', long = "bundle", value_name = "ID", value_delimiter = ',')]
    pub bundle: Option<Vec<CaptureId>>,

    /// Simulated device ids
    #[arg(short = 'd', long = "devices", value_name = "ID", value_delimiter = ',')]
    pub devices: Option<Vec<String>>,

    /// Worker threads (0 = 75% of CPU cores)
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,
}

impl Args {
    /// CLI values override file values
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(cycles) = self.cycles {
            config.cycles = cycles;
        }
        if let Some(bundle) = &self.bundle {
            config.bundle = bundle.clone();
        }
        if let Some(devices) = &self.devices {
            config.devices = devices.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = Args::parse_from(["capture-sim", "-vv", "--bundle", "3,1", "-n", "2", "-d", "front"]);
        assert_eq!(args.verbosity, 2);

        let mut config = PipelineConfig::default();
        args.apply(&mut config);
        assert_eq!(config.bundle, vec![3, 1]);
        assert_eq!(config.cycles, 2);
        assert_eq!(config.devices, vec!["front".to_string()]);
        assert_eq!(config.workers, PipelineConfig::default().workers);
    }
}
