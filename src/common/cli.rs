//! CLI argument parsing for quill binaries
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Command-line values override the config file, never the reverse

use std::path::PathBuf;

use clap::Parser;

/// Common arguments shared across quill binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "writer.toml", env = "QUILL_CONFIG")]
    pub config_file: String,
}

/// Arguments for the load-generating writer
#[derive(Parser, Debug, Clone)]
#[command(name = "quill-writer")]
#[command(about = "Publish synthetic records through a rolling quill writer")]
pub struct WriterArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Override the destination file
    #[arg(short = 'o', long = "output")]
    pub destination: Option<PathBuf>,

    /// Override the number of producer threads
    #[arg(short = 'p', long)]
    pub producers: Option<usize>,

    /// Override the records each producer publishes
    #[arg(short = 'n', long = "records")]
    pub records_per_producer: Option<u64>,

    /// Seed for payload generation (random when absent)
    #[arg(long)]
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_args_default() {
        let args = CommonArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.config_file, "writer.toml");
    }

    #[test]
    fn test_common_args_custom_config() {
        let args = CommonArgs::try_parse_from(["test", "-f", "custom.toml"]).unwrap();
        assert_eq!(args.config_file, "custom.toml");
    }

    #[test]
    fn test_common_args_long_config() {
        let args = CommonArgs::try_parse_from(["test", "--config", "my_config.toml"]).unwrap();
        assert_eq!(args.config_file, "my_config.toml");
    }

    #[test]
    fn test_writer_args_default() {
        let args = WriterArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.destination, None);
        assert_eq!(args.producers, None);
        assert_eq!(args.records_per_producer, None);
        assert_eq!(args.seed, None);
    }

    #[test]
    fn test_writer_args_full() {
        let args = WriterArgs::try_parse_from([
            "test",
            "-f",
            "load.toml",
            "-o",
            "./out/events.quill",
            "-p",
            "8",
            "--records",
            "5000",
            "--seed",
            "42",
        ])
        .unwrap();
        assert_eq!(args.common.config_file, "load.toml");
        assert_eq!(args.destination, Some(PathBuf::from("./out/events.quill")));
        assert_eq!(args.producers, Some(8));
        assert_eq!(args.records_per_producer, Some(5000));
        assert_eq!(args.seed, Some(42));
    }

    #[test]
    fn test_writer_args_rejects_bad_count() {
        assert!(WriterArgs::try_parse_from(["test", "-p", "many"]).is_err());
    }
}
