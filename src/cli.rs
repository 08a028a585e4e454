use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "boot-finder")]
#[command(about = "Detect Spring Boot applications in compiled JAR/WAR archives")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (JSON). Falls back to $BOOT_FINDER_CONFIG, then the user config dir.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Extra archive or class directory used to resolve classes.
    #[arg(long = "search-path", value_name = "PATH", global = true)]
    pub search_paths: Vec<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Analyze one archive.
    Detect {
        #[arg(value_name = "JAR")]
        jar_path: PathBuf,

        /// Decode method bodies while loading instead of on demand.
        #[arg(long)]
        deep: bool,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Analyze every archive found under a directory.
    Scan {
        #[arg(value_name = "DIR")]
        path: PathBuf,

        #[arg(long)]
        deep: bool,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_detect_with_globals_after_subcommand() {
        let cli = Cli::parse_from([
            "boot-finder",
            "detect",
            "app.jar",
            "--deep",
            "-f",
            "text",
            "--search-path",
            "lib.jar",
            "--search-path",
            "classes",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.search_paths.len(), 2);
        match cli.command {
            Commands::Detect {
                jar_path,
                deep,
                format,
            } => {
                assert_eq!(jar_path, PathBuf::from("app.jar"));
                assert!(deep);
                assert_eq!(format, OutputFormat::Text);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn scan_defaults_to_json() {
        let cli = Cli::parse_from(["boot-finder", "--config", "c.json", "scan", "dir"]);
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
        assert!(matches!(
            cli.command,
            Commands::Scan {
                format: OutputFormat::Json,
                deep: false,
                ..
            }
        ));
    }
}
