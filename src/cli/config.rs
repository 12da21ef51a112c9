//! CLI configuration module
//!
//! Manages configuration for the CLI application.

use crate::cli::args::CliArgs;
use crate::config::WebSeedConfig;
use crate::torrent::TorrentInfo;
use std::path::PathBuf;
use anyhow::Result;
use url::Url;

/// Configuration for one download run
#[derive(Debug, Clone)]
pub struct Config {
    /// Torrent information
    pub torrent_info: TorrentInfo,
    /// Download directory
    pub output_dir: PathBuf,
    /// Mirrors given on the command line
    pub mirrors: Vec<String>,
    /// File selection patterns; empty selects everything
    pub select: Vec<String>,
    /// Engine settings
    pub webseed: WebSeedConfig,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs, torrent_info: TorrentInfo, webseed: WebSeedConfig) -> Self {
        let output_dir = args.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        Self {
            torrent_info,
            output_dir,
            mirrors: args.mirrors.clone(),
            select: args.select.clone(),
            webseed,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate output directory
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("output_dir cannot be empty"));
        }

        for mirror in &self.mirrors {
            let url = Url::parse(mirror)
                .map_err(|e| anyhow::anyhow!("Invalid mirror URL '{}': {}", mirror, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow::anyhow!("Mirror URL must be http or https: {}", mirror));
            }
        }

        if self.all_mirrors().is_empty() {
            return Err(anyhow::anyhow!("Torrent has no web seeds; pass at least one --mirror"));
        }

        if self.select.iter().any(|p| p.trim().is_empty()) {
            return Err(anyhow::anyhow!("Selection patterns cannot be empty"));
        }

        self.webseed.validate()
    }

    /// Web seeds from the torrent followed by the command-line mirrors
    pub fn all_mirrors(&self) -> Vec<String> {
        let mut mirrors = self.torrent_info.web_seeds();
        for mirror in &self.mirrors {
            if !mirrors.contains(mirror) {
                mirrors.push(mirror.clone());
            }
        }
        mirrors
    }

    /// Check if only some files are wanted
    pub fn has_selection(&self) -> bool {
        !self.select.is_empty()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn torrent_info() -> TorrentInfo {
        let mut info = TorrentInfo::from_files("test_torrent", 262144, vec![TorrentFile::new("", 1048576)]);
        info.url_list = vec!["http://seed.example.com/test_torrent".to_string()];
        info
    }

    fn config() -> Config {
        Config {
            torrent_info: torrent_info(),
            output_dir: PathBuf::from("./downloads"),
            mirrors: Vec::new(),
            select: Vec::new(),
            webseed: WebSeedConfig::default(),
            verbose: false,
            quiet: false,
        }
    }

    #[test]
    fn test_config_from_args() {
        let args = CliArgs {
            torrent_file: PathBuf::from("test.torrent"),
            output_dir: Some(PathBuf::from("/tmp/downloads")),
            mirrors: vec!["http://mirror.example.com/".to_string()],
            select: vec!["*.iso".to_string()],
            config: None,
            verbose: true,
            quiet: false,
        };

        let config = Config::from_args(&args, torrent_info(), WebSeedConfig::default());

        assert_eq!(config.output_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.mirrors, vec!["http://mirror.example.com/"]);
        assert!(config.has_selection());
        assert!(config.verbose);
        assert!(!config.quiet);
        assert_eq!(
            config.all_mirrors(),
            vec!["http://seed.example.com/test_torrent", "http://mirror.example.com/"]
        );
    }

    #[test]
    fn test_config_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_config_validate_no_mirrors() {
        let mut config = config();
        config.torrent_info.url_list.clear();
        assert!(config.validate().is_err());

        config.mirrors.push("http://mirror.example.com/".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_bad_mirror() {
        let mut config = config();
        config.mirrors.push("ftp://mirror.example.com/".to_string());
        assert!(config.validate().is_err());

        config.mirrors = vec!["not a url".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_engine_settings() {
        let mut config = config();
        config.webseed.max_active_tasks = 0;
        assert!(config.validate().is_err());
    }
}
