use tracing::level_filters::LevelFilter;
use tracing_log::{AsLog, LogTracer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

use crate::{get_env_variable, journald_or_stderr_layer, pid_stderr_layer, plain_stderr_layer};

/// Builder-like struct to compose your logging layers.
///
/// Stores a global log level which will also be applied to all layers. The different layers can be
/// added with the builder methods. Note that the init method can only be called once.
///
/// # Examples
///
/// ```
/// # use proxmox_graceful_log::{Logger, LevelFilter};
/// # fn func() -> Result<(), anyhow::Error> {
/// // A daemon started in a terminal, old and new instance share stderr on reload
/// Logger::from_env("GRACEFUL_LOG", LevelFilter::INFO)
///     .stderr_with_pid()
///     .init()?;
/// # Ok(())
/// # }
/// # func().expect("failed to init logger");
/// ```
pub struct Logger {
    global_log_level: LevelFilter,
    layer: Vec<
        Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync + 'static>,
    >,
}

impl Logger {
    /// Create a new LogBuilder with no layers and a default loglevel retrieved from an env
    /// variable. If the env variable cannot be retrieved or the content is not parsable, fallback
    /// to the default_log_level passed.
    pub fn from_env(env_var: &str, default_log_level: LevelFilter) -> Logger {
        let log_level = get_env_variable(env_var, default_log_level);
        Logger {
            global_log_level: log_level,
            layer: vec![],
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.global_log_level
    }

    /// Print to journald.
    ///
    /// If the journal cannot be opened, print to stderr with the process ID instead.
    pub fn journald(mut self) -> Logger {
        self.layer.push(
            journald_or_stderr_layer()
                .with_filter(self.global_log_level)
                .boxed(),
        );
        self
    }

    /// Print to stderr.
    ///
    /// Prints all the events to stderr with the compact format (no level, no timestamp).
    pub fn stderr(mut self) -> Logger {
        self.layer.push(
            plain_stderr_layer()
                .with_filter(self.global_log_level)
                .boxed(),
        );
        self
    }

    /// Print to stderr, prefixed with process ID and level.
    ///
    /// e.g.: `[4711] INFO: event message`.
    pub fn stderr_with_pid(mut self) -> Logger {
        self.layer.push(
            pid_stderr_layer()
                .with_filter(self.global_log_level)
                .boxed(),
        );
        self
    }

    /// Inits the tracing logger with the previously configured layers.
    ///
    /// Also configures the `LogTracer` which will convert all `log` events to tracing events.
    pub fn init(self) -> Result<(), anyhow::Error> {
        let registry = tracing_subscriber::registry().with(self.layer);
        tracing::subscriber::set_global_default(registry)?;

        LogTracer::init_with_filter(self.global_log_level.as_log())?;
        Ok(())
    }
}
