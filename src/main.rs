use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error};

use labtest::config::ENV_CONFIG;
use labtest::{LaunchSpec, LimitConfig};

/// Run a lab executable under a timeout and a memory ceiling
///
/// stdin is read from the input file and stdout is written to the output
/// file, both relative to the working directory. Exits 0 only when the
/// executable exits 0 within both limits.
#[derive(Debug, Parser)]
#[command(name = "labtest", version)]
struct Cli {
    /// Memory ceiling in KiB
    #[arg(short = 'm', long = "memory-limit", value_name = "KIB",
          value_parser = clap::value_parser!(u64).range(1..))]
    memory_limit_kib: Option<u64>,

    /// Wall-clock timeout in seconds
    #[arg(short = 't', long = "timeout", value_name = "SECS",
          value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,

    /// Executable to run
    #[arg(short = 'e', long = "exe", value_name = "EXE")]
    executable: PathBuf,

    /// TOML file with a [limits] table
    #[arg(long, value_name = "PATH", env = ENV_CONFIG)]
    config: Option<PathBuf>,

    /// Working directory of the executable
    #[arg(long, value_name = "DIR", default_value = ".")]
    work_dir: PathBuf,

    /// File bound to stdin
    #[arg(long, value_name = "FILE", default_value = labtest::runner::DEFAULT_INPUT_FILE)]
    input: PathBuf,

    /// File bound to stdout
    #[arg(long, value_name = "FILE", default_value = labtest::runner::DEFAULT_OUTPUT_FILE)]
    output: PathBuf,
}

impl Cli {
    /// Defaults, then config file, then environment, then flags
    fn limits(&self) -> Result<LimitConfig> {
        let mut limits = LimitConfig::default();
        if let Some(path) = &self.config {
            limits = limits.merge_file(path)?;
        }
        limits = limits
            .merge_env()
            .context("Invalid limit in environment")?;
        if let Some(kib) = self.memory_limit_kib {
            limits = limits.with_memory_limit_kib(kib);
        }
        if let Some(secs) = self.timeout_secs {
            limits = limits.with_timeout_secs(secs);
        }
        Ok(limits)
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::new(&self.executable)
            .with_work_dir(&self.work_dir)
            .with_input(&self.input)
            .with_output(&self.output)
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("labtest=warn")),
        )
        .init();

    // Usage errors fail like any other run
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let limits = match cli.limits() {
        Ok(limits) => limits,
        Err(err) => {
            error!("{:#}", err);
            println!("\nConfiguration error: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    debug!(
        "Limits: memory {} bytes, timeout {}s",
        limits.memory_limit_bytes, limits.timeout_secs
    );

    let verdict = labtest::run(&cli.launch_spec(), &limits);
    if !verdict.diagnostic.is_empty() {
        println!("\n{}", verdict.diagnostic);
    }

    if verdict.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_helper_flags() {
        let cli = Cli::try_parse_from(["labtest", "-m", "65536", "-t", "5", "-e", "./lab"]).unwrap();
        assert_eq!(cli.memory_limit_kib, Some(65536));
        assert_eq!(cli.timeout_secs, Some(5));
        assert_eq!(cli.executable, PathBuf::from("./lab"));
        assert_eq!(cli.input, PathBuf::from("in.txt"));
        assert_eq!(cli.output, PathBuf::from("out.txt"));
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from(["labtest", "-m", "1024", "-t", "2", "-e", "lab"]).unwrap();
        let limits = cli.limits().unwrap();
        assert_eq!(limits.memory_limit_bytes, 1024 * 1024);
        assert_eq!(limits.timeout_secs, 2);
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(Cli::try_parse_from(["labtest", "-m", "0", "-e", "lab"]).is_err());
        assert!(Cli::try_parse_from(["labtest", "-t", "0", "-e", "lab"]).is_err());
    }

    #[test]
    fn test_executable_required() {
        assert!(Cli::try_parse_from(["labtest", "-m", "1024"]).is_err());
    }

    #[test]
    fn test_launch_spec_from_flags() {
        let cli = Cli::try_parse_from([
            "labtest", "-e", "lab", "--work-dir", "/tmp/case", "--input", "case.in",
        ])
        .unwrap();
        let spec = cli.launch_spec();
        let dir = PathBuf::from("/tmp/case");
        assert_eq!(spec.input_path(), dir.join("case.in"));
        assert_eq!(spec.output_path(), dir.join("out.txt"));
    }
}
