//! Logging setup for the driver.
//!
//! Two front ends share the `log` facade: [`init_rust_logging`] installs a
//! stderr formatter for native binaries, and [`init_python_logging`] installs
//! a bridge that forwards Rust records into Python's `logging` hierarchy when
//! the crate is loaded as an extension module. Level selection comes from
//! `TRNS_LOG` (falling back to `RUST_LOG`) in both cases.

use std::sync::{Mutex, Once};

use env_logger::Env;
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use pyo3::prelude::*;
use pyo3::types::{PyModule, PyTuple};

static RUST_LOG_ONCE: Once = Once::new();
static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("TRNS_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize stderr logging for Rust binaries based on `TRNS_LOG`/`RUST_LOG`.
#[allow(dead_code)]
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(env_level()));
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_target(true)
            .init();
    });
}

/// Forwards `log` records to Python's `logging` module.
///
/// Each record is routed to `logging.getLogger(target)` with `::` rewritten
/// to `.`, so `trns_rs::device` shows up as the `trns_rs.device` logger and
/// obeys whatever configuration the embedding application set up. Resolving
/// the logger per record keeps Python-side reconfiguration honest.
struct PyLogger {
    top_filter: Mutex<LevelFilter>,
    logging_mod: Py<PyModule>,
}

impl PyLogger {
    fn map_level(level: log::Level) -> usize {
        match level {
            log::Level::Error => 40,
            log::Level::Warn => 30,
            log::Level::Info => 20,
            log::Level::Debug => 10,
            log::Level::Trace => 5,
        }
    }

    fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
        let target = record.target().replace("::", ".");
        let lvl = Self::map_level(record.level());

        let logger = self
            .logging_mod
            .bind(py)
            .getattr("getLogger")?
            .call1((&target,))?;
        if !logger.call_method1("isEnabledFor", (lvl,))?.is_truthy()? {
            return Ok(());
        }

        let none = py.None();
        let msg = format!("{}", record.args());
        let py_record = logger.call_method1(
            "makeRecord",
            (
                &target,
                lvl,
                record.file(),
                record.line().unwrap_or_default(),
                msg,
                PyTuple::empty(py),
                &none, // exc_info
                &none, // func
                &none, // extra
            ),
        )?;
        logger.call_method1("handle", (py_record,))?;
        Ok(())
    }
}

impl Log for PyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level().to_level_filter() <= *self.top_filter.lock().unwrap()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        Python::attach(|py| {
            if let Err(e) = self.forward(py, record) {
                e.restore(py);
            }
        });
    }

    fn flush(&self) {}
}

/// Install the bridge so Rust logs flow into Python's `logging`.
/// Safe to call multiple times; the logger is installed on first call.
pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
    if PY_LOGGER.get().is_some() {
        return Ok(());
    }
    let level = env_level();
    let logger = PyLogger {
        top_filter: Mutex::new(level),
        logging_mod: py.import("logging")?.into(),
    };
    let leaked: &'static PyLogger = Box::leak(Box::new(logger));
    if log::set_logger(leaked).is_ok() {
        log::set_max_level(level);
        let _ = PY_LOGGER.set(leaked);
    }
    Ok(())
}

/// Apply an explicit minimum level at runtime; `None` re-reads the env level.
pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    let level = level
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or_else(env_level);
    init_python_logging(py)?;
    if let Some(logger) = PY_LOGGER.get() {
        *logger.top_filter.lock().unwrap() = level;
    }
    log::set_max_level(level);
    Ok(())
}
