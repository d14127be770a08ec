//! Logging for daemons using `proxmox-graceful`.
//!
//! Library code logs through the `log` facade, [`Logger::init`] routes those records into a
//! `tracing` subscriber writing to stderr and/or the journal.

use std::env;

use tracing_subscriber::prelude::*;

mod pid_formatter;

pub mod builder;
pub use builder::Logger;
pub use pid_formatter::PidFormatter;

pub use tracing_subscriber::filter::LevelFilter;

fn journald_or_stderr_layer<S>() -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber,
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match tracing_journald::layer() {
        Ok(layer) => layer.boxed(),
        Err(err) => {
            eprintln!("Unable to open syslog: {err:?}");
            pid_stderr_layer().boxed()
        }
    }
}

fn plain_stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber,
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let format = tracing_subscriber::fmt::format()
        .with_level(false)
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
}

fn pid_stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber,
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .event_format(PidFormatter::new())
        .with_writer(std::io::stderr)
}

/// Parse the log level from `env_var`, falling back to `default_log_level` if it is unset or
/// invalid.
pub fn get_env_variable(env_var: &str, default_log_level: LevelFilter) -> LevelFilter {
    let mut log_level = default_log_level;
    if let Ok(v) = env::var(env_var) {
        match v.parse::<LevelFilter>() {
            Ok(l) => {
                log_level = l;
            }
            Err(e) => {
                eprintln!("env variable {env_var} found, but parsing failed: {e:?}");
            }
        }
    }
    log_level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_from_env() {
        let var = "PROXMOX_GRACEFUL_LOG_TEST_LEVEL";

        env::remove_var(var);
        assert_eq!(get_env_variable(var, LevelFilter::INFO), LevelFilter::INFO);

        env::set_var(var, "debug");
        assert_eq!(get_env_variable(var, LevelFilter::INFO), LevelFilter::DEBUG);

        env::set_var(var, "chatty");
        assert_eq!(get_env_variable(var, LevelFilter::WARN), LevelFilter::WARN);

        env::remove_var(var);
    }
}
