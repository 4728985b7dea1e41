use console::style;
use log::{debug, info};
use sandbox_rs::{Policy, SandboxBuilder, SandboxResult};
use std::time::Duration;

use crate::cli::RunArgs;

/// Build the sandbox described by `args`.
///
/// The policy file goes first so command line flags add to it and
/// override its limits.
pub fn builder(args: &RunArgs) -> Result<SandboxBuilder, Box<dyn std::error::Error>> {
    let sandbox_id = args
        .id
        .clone()
        .unwrap_or_else(|| format!("sandbox-{}", std::process::id()));

    let mut builder = SandboxBuilder::new(&sandbox_id);

    if let Some(path) = &args.policy {
        debug!("Loading policy {}", path.display());
        builder = builder.policy(&Policy::load(path)?);
    }

    if args.no_syslibs {
        builder = builder.syslibs(false);
    }

    for grant in &args.grant {
        debug!("Granting {} (budget {})", grant.path.display(), grant.budget);
        builder = builder.grant_native(&grant.path, grant.budget);
    }

    for remap in &args.grant_at {
        debug!(
            "Granting {} at {} (budget {})",
            remap.host.display(),
            remap.sandbox.display(),
            remap.budget
        );
        builder = builder.grant_native_at(&remap.host, &remap.sandbox, remap.budget);
    }

    for tmp in &args.tmp {
        debug!("Tmp {} (budget {})", tmp.path.display(), tmp.budget);
        builder = builder.grant_tmp(&tmp.path, tmp.budget);
    }

    for path in &args.hide {
        builder = builder.hide(path);
    }

    if let Some(m) = &args.memory {
        debug!("Overriding memory limit: {}", m);
        builder = builder.memory_limit_str(m)?;
    }

    if let Some(t) = args.timeout {
        debug!("Overriding timeout: {}s", t);
        builder = builder.timeout(Duration::from_secs(t));
    }

    if let Some(p) = &args.preload {
        builder = builder.preload(p);
    }

    Ok(builder)
}

/// Run the program and return the exit code to leave with
pub fn run_sandbox(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let builder = builder(&args)?;
    info!("Building sandbox '{}'", builder.config().id);
    let mut sandbox = builder.build()?;

    info!("Executing: {} {:?}", args.program, args.args);

    let args_refs: Vec<&str> = args.args.iter().map(|s| s.as_str()).collect();
    let result = sandbox.run(&args.program, &args_refs)?;

    info!("Execution completed in {}ms", result.wall_time_ms);
    println!("{}", summary(&result));

    Ok(result.exit_code)
}

fn summary(result: &SandboxResult) -> String {
    let exit_code_styled = if result.exit_code == 0 {
        style(result.exit_code).green().bold()
    } else {
        style(result.exit_code).red().bold()
    };
    let violations_styled = if result.violations == 0 {
        style(result.violations).bold()
    } else {
        style(result.violations).yellow().bold()
    };

    let mut line = format!(
        "{}={} | {}={} | {}={}",
        style("exit_code").dim(),
        exit_code_styled,
        style("wall_time_ms").dim(),
        style(result.wall_time_ms).bold(),
        style("violations").dim(),
        violations_styled,
    );

    if let Some(signal) = result.signal {
        line.push_str(&format!(" | {}={}", style("signal").red(), signal));
    }

    if result.timed_out {
        line.push_str(&format!(
            " | {}={}",
            style("timed_out").red(),
            style("true").red().bold()
        ));
    }

    line
}
