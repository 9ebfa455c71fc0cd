//! `LD_LOG`-driven logging.
//!
//! The engine logs through the `log` facade with a small set of targets;
//! the `LD_LOG` environment variable picks which of them reach stderr.
//! Tokens are colon-separated: `debug`, `function`, `error`, `assert`,
//! `symbol-fail`, `symbol-ok`, `reloc`, and `help` to list them.

use core::sync::atomic::{AtomicU32, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record};

const LOG_DEBUG: u32 = 1 << 0;
const LOG_FUNCTION: u32 = 1 << 1;
const LOG_ERROR: u32 = 1 << 2;
const LOG_ASSERT: u32 = 1 << 3;
const LOG_SYMBOL_FAIL: u32 = 1 << 4;
const LOG_SYMBOL_OK: u32 = 1 << 5;
const LOG_RELOC: u32 = 1 << 6;

static FLAGS: AtomicU32 = AtomicU32::new(0);

/// Parse one `LD_LOG` specification into flag bits. `help` writes the
/// token list to stderr as a side effect.
pub(crate) fn parse_spec(spec: &str) -> u32 {
    let mut flags = 0;
    for token in spec.split(':') {
        match token {
            "debug" => flags |= LOG_DEBUG,
            "function" => flags |= LOG_FUNCTION,
            "error" => flags |= LOG_ERROR,
            "assert" => flags |= LOG_ASSERT,
            "symbol-fail" => flags |= LOG_SYMBOL_FAIL,
            "symbol-ok" => flags |= LOG_SYMBOL_OK,
            "reloc" => flags |= LOG_RELOC,
            "help" => {
                write_stderr(
                    "LD_LOG tokens: debug:function:error:assert:symbol-fail:symbol-ok:reloc:help\n",
                );
            }
            _ => {}
        }
    }
    flags
}

fn write_stderr(msg: &str) {
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
    }
}

struct LdLogger;

static LOGGER: LdLogger = LdLogger;

impl Log for LdLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let flags = FLAGS.load(Ordering::Relaxed);
        match metadata.target() {
            "symbol-fail" => flags & LOG_SYMBOL_FAIL != 0,
            "symbol-ok" => flags & LOG_SYMBOL_OK != 0,
            "reloc" => flags & LOG_RELOC != 0,
            "function" => flags & LOG_FUNCTION != 0,
            _ => match metadata.level() {
                Level::Error | Level::Warn => flags & LOG_ERROR != 0,
                _ => flags & LOG_DEBUG != 0,
            },
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = alloc::format!("ldso: {}: {}\n", record.target(), record.args());
        write_stderr(&line);
    }

    fn flush(&self) {}
}

/// Install the logger according to `LD_LOG`. Safe to call once, early in
/// stage 2.
pub(crate) fn initialize(spec: Option<&str>) {
    if let Some(spec) = spec {
        FLAGS.store(parse_spec(spec), Ordering::Relaxed);
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_tokens_accumulate() {
        let flags = parse_spec("debug:reloc:symbol-fail");
        assert_eq!(flags, LOG_DEBUG | LOG_RELOC | LOG_SYMBOL_FAIL);
        assert_eq!(parse_spec("nonsense"), 0);
        assert_eq!(parse_spec("error"), LOG_ERROR);
    }
}
