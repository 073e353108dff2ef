//! Log setup for Rust hosts and, with feature `python`, a bridge into
//! Python's `logging` module.
//!
//! The level comes from `HATSCAN_LOG`, then `RUST_LOG`, then `info`.

use std::sync::Once;

use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

const LEVEL_VARS: [&str; 2] = ["HATSCAN_LOG", "RUST_LOG"];

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

fn env_filter() -> Option<String> {
    LEVEL_VARS.iter().find_map(|var| std::env::var(var).ok())
}

/// Level named by `HATSCAN_LOG` or `RUST_LOG`, `info` if neither parses.
pub fn env_level() -> LevelFilter {
    parse_level(env_filter().as_deref()).unwrap_or(LevelFilter::Info)
}

/// Install `env_logger` on stderr. Later calls do nothing.
///
/// The variable may hold a plain level or full `env_logger` directives such
/// as `hatscan::scan_thread=trace`.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let filter = env_filter().unwrap_or_else(|| "info".to_owned());
        let installed = env_logger::Builder::new()
            .parse_filters(&filter)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        if installed.is_err() {
            log::debug!("a logger was already installed; keeping it");
        }
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, reset_python_logging_cache, set_python_log_level_str};

#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::Once;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use parking_lot::Mutex;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Python logger per dotted target, with the highest level it accepts.
    type LoggerCache = HashMap<String, (LevelFilter, Py<PyAny>)>;

    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        cache: Mutex<LoggerCache>,
    }

    fn python_level(level: Level) -> usize {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn accepted_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (python_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut cache = self.cache.lock();
            if let Some((level, logger)) = cache.get(target) {
                return Ok((*level, logger.clone_ref(py)));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let level = Self::accepted_level(&logger)?;
            let logger = logger.unbind();
            cache.insert(target.to_owned(), (level, logger.clone_ref(py)));
            Ok((level, logger))
        }

        fn emit(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (accepted, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > accepted || level > *self.top_filter.lock() {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let entry = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    python_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (entry,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *self.top_filter.lock()
        }

        fn log(&self, record: &Record) {
            // records from the scan thread arrive without the GIL
            Python::attach(|py| {
                if let Err(e) = self.emit(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route `log` records into Python's `logging`. Later calls do nothing.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    // set only here, under the Once
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => result = Err(e),
        });
        result
    }

    /// Forget cached Python loggers after the Python logging config changes.
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            logger.cache.lock().clear();
        }
    }

    /// Set the bridge level from a name such as `"debug"`, or from the
    /// environment when `None`.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *logger.top_filter.lock() = level;
            logger.cache.lock().clear();
        }
        log::set_max_level(level);
        Ok(())
    }
}
