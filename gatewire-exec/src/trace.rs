//! Per-process debug tracing, driven by the `GATEWIRE_DEBUG` environment
//! variable.
//!
//! When the variable is set (non-empty), a full trace goes to a file in the
//! temp directory whose name carries the pid; `GATEWIRE_DEBUG=2`
//! additionally mirrors the trace to stderr. Both the master process and
//! every bootstrapped worker honour the variable independently. Without
//! it, the crate only emits through whatever logger the host application
//! installed.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Once;

/// The environment variable that switches the debug trace on.
pub const DEBUG_ENV: &str = "GATEWIRE_DEBUG";

/// Install the debug trace logger if `GATEWIRE_DEBUG` asks for one.
///
/// Idempotent and quiet when a logger is already installed; called on
/// every entry point (group creation, worker serve) so either side of a
/// gateway can be traced on its own.
pub fn init_from_env() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let value = match std::env::var(DEBUG_ENV) {
            Ok(value) if !value.is_empty() => value,
            _ => return,
        };
        let path = std::env::temp_dir().join(format!("gatewire-debug-{}", std::process::id()));
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("cannot open debug log {}: {}", path.display(), err);
                return;
            }
        };
        let tee = Tee {
            file,
            mirror: value.trim() == "2",
        };
        let _ = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Trace)
            .target(env_logger::Target::Pipe(Box::new(tee)))
            .try_init();
    });
}

/// Writes to the trace file, optionally mirroring to stderr.
struct Tee {
    file: File,
    mirror: bool,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        if self.mirror {
            let _ = io::stderr().write_all(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.mirror {
            let _ = io::stderr().flush();
        }
        Ok(())
    }
}
