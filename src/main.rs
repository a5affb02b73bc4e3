//! Entry point: parse arguments, load the config, stand up logging, and
//! either hand off to the test-mode report or run the daemon. Mirrors the
//! shape of `dlog.c`'s `main` -- argument parsing, then config load, then
//! daemonize, then the loop -- with each step given its own module here.

mod buf;
mod cli;
mod config;
mod descriptor;
mod error;
mod handoff;
mod io;
mod logging;
mod process;
mod reactor;
mod rotate;
mod rules;
mod runtime;
mod table;

use std::io::Write as _;

use cli::Cli;
use error::Error;
use runtime::Runtime;

fn main() {
    let cli = Cli::parse_args();

    if cli.version {
        println!("logrelay {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    let config = match config::parse_file(&cli.config) {
        Ok(config) => config,
        Err(source) => {
            eprintln!("logrelay: {}", Error::from(source));
            std::process::exit(1);
        }
    };

    if cli.test {
        println!("{config:#?}");
        std::process::exit(0);
    }

    logging::init(cli.foreground);

    if let Err(e) = run(cli, config) {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

fn run(cli: Cli, config: config::Config) -> Result<(), Error> {
    let pidfile = config.pidfile.clone();

    if !cli.foreground {
        process::daemonize()?;
    }
    process::install_handlers(cli.foreground)?;
    write_pidfile(&pidfile)?;

    let mut rt = Runtime::bootstrap(config, cli.listen_port, cli.restarted)?;
    let restarting = rt.run()?;
    if !restarting {
        let _ = std::fs::remove_file(&pidfile);
    }
    Ok(())
}

fn write_pidfile(path: &std::path::Path) -> Result<(), Error> {
    let mut f = std::fs::File::create(path).map_err(|source| Error::PidFile {
        path: path.display().to_string(),
        source,
    })?;
    write!(f, "{}", std::process::id()).map_err(|source| Error::PidFile {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}
