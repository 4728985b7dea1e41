use console::{StyledObject, style};
use env_logger::{Builder, Env};
use log::Level;
use std::io::Write;

/// Crates whose lines `--verbose` turns up; dependencies stay at warn
const OWN_CRATES: &[&str] = &[
    "sandbox_ctl",
    "sandbox_rs",
    "sandbox_broker",
    "sandbox_seccomp",
    "sandbox_namespace",
    "sandbox_core",
];

fn default_filter(verbose: bool) -> String {
    if !verbose {
        return "warn".to_string();
    }
    let mut filter = String::from("warn");
    for name in OWN_CRATES {
        filter.push_str(&format!(",{}=debug", name));
    }
    filter
}

fn level_label(level: Level) -> StyledObject<&'static str> {
    match level {
        Level::Error => style("ERROR").red().bold(),
        Level::Warn => style("WARN ").yellow().bold(),
        Level::Info => style("INFO ").green(),
        Level::Debug => style("DEBUG").cyan(),
        Level::Trace => style("TRACE").dim(),
    }
}

/// Initialize logger; `RUST_LOG` wins over the verbose flag
pub fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", default_filter(verbose));

    Builder::from_env(env)
        .format(|buf, record| writeln!(buf, "{} {}", level_label(record.level()), record.args()))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_by_default() {
        assert_eq!(default_filter(false), "warn");
    }

    #[test]
    fn verbose_raises_own_crates_only() {
        let filter = default_filter(true);
        assert!(filter.starts_with("warn,"));
        assert!(filter.contains("sandbox_broker=debug"));
        assert!(!filter.contains("mio"));
    }

    #[test]
    fn labels_have_equal_width() {
        console::set_colors_enabled(false);
        for level in [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace] {
            assert_eq!(level_label(level).to_string().len(), 5);
        }
    }
}
