use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sandbox-ctl")]
#[command(version, about = "Run untrusted programs behind a filesystem broker", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Read-only access to a data directory
    sandbox-ctl run --grant /srv/data/ -- cat /srv/data/input.txt

    # Serve a host directory under another name, allowing 10 new files
    sandbox-ctl run --grant-at /home/me/out/=/out/:10 -- sh -c 'echo hi > /out/x'

    # Everything from a policy file, with a tighter timeout
    sandbox-ctl run --policy judge.json --timeout 5 -- ./solution

    # What does this host support?
    sandbox-ctl check
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program in the sandbox
    Run(RunArgs),

    /// Check sandbox requirements
    Check,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Expose a host file or directory (trailing /) at the same path
    #[arg(long, value_name = "PATH[:BUDGET]", value_parser = parse_grant)]
    pub grant: Vec<GrantSpec>,

    /// Expose a host path under a different in-sandbox path
    #[arg(long, value_name = "HOST=SANDBOX[:BUDGET]", value_parser = parse_grant_at)]
    pub grant_at: Vec<RemapSpec>,

    /// In-memory scratch directory allowing BUDGET new files
    #[arg(long, value_name = "PATH[:BUDGET]", value_parser = parse_tmp)]
    pub tmp: Vec<GrantSpec>,

    /// Make a path quietly absent
    #[arg(long, value_name = "PATH")]
    pub hide: Vec<PathBuf>,

    /// JSON policy file with grants, limits and timeout
    #[arg(short, long, value_name = "FILE")]
    pub policy: Option<PathBuf>,

    /// Do not grant the shared library bundle
    #[arg(long)]
    pub no_syslibs: bool,

    /// Timeout in seconds
    #[arg(short, long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Address space limit (100M, 1G, 2G)
    #[arg(short, long, value_name = "SIZE")]
    pub memory: Option<String>,

    /// Preload binary to use instead of the one next to sandbox-ctl
    #[arg(long, value_name = "PATH")]
    pub preload: Option<PathBuf>,

    /// Name used in log lines (auto-generated if not provided)
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,

    /// Program to run
    #[arg(value_name = "PROGRAM", required = true)]
    pub program: String,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// `PATH[:BUDGET]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantSpec {
    pub path: PathBuf,
    pub budget: u32,
}

/// `HOST=SANDBOX[:BUDGET]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapSpec {
    pub host: PathBuf,
    pub sandbox: PathBuf,
    pub budget: u32,
}

const DEFAULT_TMP_BUDGET: u32 = 100;

/// Split a trailing `:N`; a suffix that is not a number stays in the path.
fn split_budget(s: &str) -> (&str, Option<u32>) {
    match s.rsplit_once(':') {
        Some((path, budget)) => match budget.parse() {
            Ok(n) => (path, Some(n)),
            Err(_) => (s, None),
        },
        None => (s, None),
    }
}

fn non_empty(path: &str) -> Result<PathBuf, String> {
    if path.is_empty() {
        return Err("path cannot be empty".to_string());
    }
    Ok(PathBuf::from(path))
}

fn parse_grant(s: &str) -> Result<GrantSpec, String> {
    let (path, budget) = split_budget(s);
    Ok(GrantSpec {
        path: non_empty(path)?,
        budget: budget.unwrap_or(0),
    })
}

fn parse_tmp(s: &str) -> Result<GrantSpec, String> {
    let (path, budget) = split_budget(s);
    Ok(GrantSpec {
        path: non_empty(path)?,
        budget: budget.unwrap_or(DEFAULT_TMP_BUDGET),
    })
}

fn parse_grant_at(s: &str) -> Result<RemapSpec, String> {
    let (host, rest) = s
        .split_once('=')
        .ok_or_else(|| format!("expected HOST=SANDBOX[:BUDGET], got '{}'", s))?;
    let (sandbox, budget) = split_budget(rest);
    Ok(RemapSpec {
        host: non_empty(host)?,
        sandbox: non_empty(sandbox)?,
        budget: budget.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn run(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Run(run) => run,
            Commands::Check => panic!("expected run"),
        }
    }

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn grant_budget_is_optional() {
        assert_eq!(
            parse_grant("/srv/").unwrap(),
            GrantSpec {
                path: "/srv/".into(),
                budget: 0
            }
        );
        assert_eq!(parse_grant("/srv/:3").unwrap().budget, 3);
        assert_eq!(parse_tmp("/tmp/").unwrap().budget, DEFAULT_TMP_BUDGET);
        assert_eq!(parse_tmp("/tmp/:0").unwrap().budget, 0);
    }

    #[test]
    fn colon_without_number_is_part_of_path() {
        assert_eq!(parse_grant("/a:b").unwrap().path, PathBuf::from("/a:b"));
        assert!(parse_grant(":4").is_err());
    }

    #[test]
    fn grant_at_needs_both_sides() {
        let spec = parse_grant_at("/home/me/out/=/out/:10").unwrap();
        assert_eq!(spec.host, PathBuf::from("/home/me/out/"));
        assert_eq!(spec.sandbox, PathBuf::from("/out/"));
        assert_eq!(spec.budget, 10);
        assert!(parse_grant_at("/out/").is_err());
        assert!(parse_grant_at("=/out/").is_err());
    }

    #[test]
    fn run_collects_flags_and_program() {
        let args = run(&[
            "sandbox-ctl",
            "run",
            "--grant",
            "/srv/",
            "--tmp",
            "/tmp/:5",
            "--hide",
            "/home/",
            "--timeout",
            "3",
            "--",
            "ls",
            "-l",
            "/srv",
        ]);
        assert_eq!(args.grant.len(), 1);
        assert_eq!(args.tmp[0].budget, 5);
        assert_eq!(args.hide, vec![PathBuf::from("/home/")]);
        assert_eq!(args.timeout, Some(3));
        assert_eq!(args.program, "ls");
        assert_eq!(args.args, vec!["-l", "/srv"]);
    }

    #[test]
    fn run_requires_a_program() {
        assert!(Cli::try_parse_from(["sandbox-ctl", "run", "--no-syslibs"]).is_err());
    }
}
