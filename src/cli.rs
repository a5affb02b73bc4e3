//! Command-line surface. Mirrors the teacher's `#[derive(Parser)]` style
//! (see `vector`'s `cli.rs`), kept deliberately small: this binary's whole
//! configuration lives in the file named by `-c`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "logrelay",
    about = "Single-threaded log-routing daemon with live restart hand-off",
    disable_version_flag = true
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Parse the config, print the resulting rule tree, and exit.
    #[arg(short = 't', long = "test")]
    pub test: bool,

    /// Override the listen port from the config file.
    #[arg(short = 'l', long = "listen-port")]
    pub listen_port: Option<u16>,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'n', long = "foreground")]
    pub foreground: bool,

    /// Internal: marks this process as a restart hand-off child. Not
    /// meant to be passed by a user directly.
    #[arg(short = 'x', long = "restarted", hide = true)]
    pub restarted: bool,

    /// Print version and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    pub version: bool,

    /// Alias for --help.
    #[arg(short = '?', action = clap::ArgAction::Help, hide = true)]
    _help_alias: Option<bool>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_config_flag_parses() {
        let cli = Cli::parse_from(["logrelay", "-c", "/etc/logrelay.conf"]);
        assert_eq!(cli.config, PathBuf::from("/etc/logrelay.conf"));
        assert!(!cli.test);
        assert!(!cli.foreground);
    }

    #[test]
    fn restart_child_flag_is_recognized() {
        let cli = Cli::parse_from(["logrelay", "-c", "a.conf", "-x", "-n"]);
        assert!(cli.restarted);
        assert!(cli.foreground);
    }

    #[test]
    fn listen_port_override_parses_as_u16() {
        let cli = Cli::parse_from(["logrelay", "-c", "a.conf", "-l", "9000"]);
        assert_eq!(cli.listen_port, Some(9000));
    }
}
