//! The worker runtime: the remote end of every gateway.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use gatewire_exec::{
    init_debug_trace, listen, serve_stdio_with, ExecModel, OpRegistry, ServeDefaults,
};

#[derive(Parser, Debug)]
#[clap(
    name = "gatewire-worker",
    version,
    about = "Worker runtime of the gatewire execution fabric"
)]
struct Opt {
    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Parser, Debug)]
enum Mode {
    /// Serve one gateway session over stdin/stdout (the remote end of pipe
    /// and ssh gateways)
    ServeStdio(ServeStdioOpt),
    /// Accept socket gateway connections and serve each one
    Listen(ListenOpt),
}

#[derive(Parser, Debug)]
struct ServeStdioOpt {
    /// Gateway id to use when the bootstrap payload does not name one
    #[clap(long)]
    id: Option<String>,
    /// Execution model to use when the bootstrap payload does not name one
    #[clap(long)]
    execmodel: Option<String>,
}

#[derive(Parser, Debug)]
struct ListenOpt {
    /// Address to listen on
    #[clap(long, default_value = "127.0.0.1:8888")]
    bind: String,
    /// Serve a single connection, then exit
    #[clap(long)]
    once: bool,
}

fn main() -> Result<()> {
    init_debug_trace();
    let _ = env_logger::Builder::from_default_env().try_init();
    let opt = Opt::parse();
    log::debug!("worker starting: {:?}", opt.mode);
    let registry = Arc::new(OpRegistry::with_builtins());
    match opt.mode {
        Mode::ServeStdio(opt) => {
            let defaults = ServeDefaults {
                id: opt.id,
                execmodel: opt
                    .execmodel
                    .as_deref()
                    .map(ExecModel::from_name)
                    .transpose()?,
            };
            serve_stdio_with(registry, &defaults)
        }
        Mode::Listen(opt) => listen(&opt.bind, opt.once, registry),
    }
}
